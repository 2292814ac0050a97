use crate::app::codes::CodeKind;
use crate::app::registry::{ConnectionHandle, Control};
use crate::app::{handlers, AppState, RequestError};
use crate::util::now_millis;
use comcore_proto::{kinds, Frame, LOGOUT_FIRST};
use comcore_storage::StorageError;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Grace period past an invite link's expiry during which it is still
/// accepted, to tolerate clock skew between server and clients.
pub const INVITE_GRACE_MS: i64 = 30 * 1000;

/// Authoritative per-connection login state. Only state-appropriate
/// requests are accepted; everything else is unauthorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    ConfirmEmail { email: String, kind: CodeKind },
    ResetPassword { user: i64 },
    LoggedIn { user: i64, name: String, token: String },
}

pub struct ConnectionContext {
    pub id: u64,
    pub frames: mpsc::UnboundedSender<Frame>,
    pub control: mpsc::UnboundedSender<Control>,
    pub session: SessionState,
    /// Pushes queued during handling, flushed after the reply frame.
    pub pending: Vec<Frame>,
}

/// Parses one raw line and processes the resulting request.
pub async fn handle_line(state: &Arc<AppState>, ctx: &mut ConnectionContext, line: &str) {
    match Frame::parse(line) {
        Ok(frame) => handle_frame(state, ctx, frame).await,
        Err(err) => {
            let _ = ctx.frames.send(Frame::error(&err.to_string()));
        }
    }
}

/// Runs one request to completion and emits exactly one `REPLY` or `ERROR`
/// frame, followed by any pushes the handler queued for this connection.
pub async fn handle_frame(state: &Arc<AppState>, ctx: &mut ConnectionContext, frame: Frame) {
    let reply = match dispatch(state, ctx, &frame).await {
        Ok(data) => Frame::reply(data),
        Err(RequestError::Invalid(message)) => Frame::error(&message),
        Err(RequestError::Unauthorized) => {
            warn!(connection = ctx.id, kind = %frame.kind, "unauthorized request");
            leave_session(state, ctx).await;
            ctx.pending.push(Frame::new(kinds::LOGOUT, json!({})));
            Frame::error("unauthorized")
        }
        Err(RequestError::Internal(detail)) => {
            error!(connection = ctx.id, kind = %frame.kind, detail = %detail, "internal error");
            Frame::error("internal server error")
        }
    };
    let _ = ctx.frames.send(reply);
    for push in ctx.pending.drain(..) {
        let _ = ctx.frames.send(push);
    }
}

async fn dispatch(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    frame: &Frame,
) -> Result<Value, RequestError> {
    let data = &frame.data;
    match frame.kind.as_str() {
        // State-independent requests never alter the session.
        "PING" => Ok(data.clone()),
        "checkInviteLink" => check_invite_link(state, data).await,
        kind if LOGOUT_FIRST.contains(&kind) => {
            leave_session(state, ctx).await;
            match kind {
                "login" => login(state, ctx, data).await,
                "createAccount" => create_account(state, ctx, data).await,
                "requestReset" => request_reset(state, ctx, data).await,
                _ => Ok(json!({})),
            }
        }
        "connect" => match &ctx.session {
            SessionState::LoggedOut => connect(state, ctx, data).await,
            _ => Err(RequestError::Unauthorized),
        },
        "enterCode" => match &ctx.session {
            SessionState::ConfirmEmail { email, kind } => {
                let email = email.clone();
                let kind = *kind;
                enter_code(state, ctx, &email, kind, data).await
            }
            _ => Err(RequestError::Unauthorized),
        },
        "finishReset" => match ctx.session {
            SessionState::ResetPassword { user } => finish_reset(state, ctx, user, data).await,
            _ => Err(RequestError::Unauthorized),
        },
        _ => match &ctx.session {
            SessionState::LoggedIn { user, .. } => {
                let user = *user;
                handlers::dispatch(state, ctx, user, &frame.kind, data).await
            }
            _ => Err(RequestError::Unauthorized),
        },
    }
}

/// Leaves whatever state the connection is in, deregistering from the
/// session registry when it was logged in. No push is sent here.
async fn leave_session(state: &Arc<AppState>, ctx: &mut ConnectionContext) {
    if let SessionState::LoggedIn { user, .. } = ctx.session {
        state.registry.logout_connection(user, ctx.id).await;
        debug!(connection = ctx.id, user, "session left");
    }
    ctx.session = SessionState::LoggedOut;
}

/// Enters the logged-in state: issues (or reuses) the auth token, registers
/// the connection for pushes, and queues the `login` push to this device.
async fn enter_logged_in(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    name: String,
    token: Option<String>,
) -> Result<(), RequestError> {
    let token = match token {
        Some(token) => token,
        None => {
            let token = comcore_crypto::random_token();
            state.store.set_auth_token(user, &token).await?;
            token
        }
    };
    state
        .registry
        .login_connection(
            user,
            ctx.id,
            ConnectionHandle {
                frames: ctx.frames.clone(),
                control: ctx.control.clone(),
            },
        )
        .await;
    ctx.pending.push(Frame::new(
        kinds::LOGIN,
        json!({"id": user, "name": name, "token": token}),
    ));
    debug!(connection = ctx.id, user, "session entered");
    ctx.session = SessionState::LoggedIn { user, name, token };
    Ok(())
}

async fn login(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    data: &Value,
) -> Result<Value, RequestError> {
    let email = field_str(data, "email")?;
    let pass = field_str(data, "pass")?;
    if state
        .codes
        .continue_creation(state.mailer.as_ref(), email, pass)
        .await
    {
        ctx.session = SessionState::ConfirmEmail {
            email: email.to_string(),
            kind: CodeKind::NewAccount,
        };
        return Ok(json!({"status": "ENTER_CODE"}));
    }
    let account = match state.store.lookup_account(email).await {
        Ok(account) => account,
        Err(StorageError::Missing) => return Ok(json!({"status": "DOES_NOT_EXIST"})),
        Err(err) => return Err(err.into()),
    };
    if !comcore_crypto::check_password(pass, &account.password_hash) {
        return Ok(json!({"status": "INVALID_PASSWORD"}));
    }
    if account.two_factor {
        state
            .codes
            .send_confirmation(
                state.mailer.as_ref(),
                email,
                CodeKind::TwoFactor,
                Some(account.id),
            )
            .await;
        ctx.session = SessionState::ConfirmEmail {
            email: email.to_string(),
            kind: CodeKind::TwoFactor,
        };
        return Ok(json!({"status": "ENTER_CODE"}));
    }
    enter_logged_in(state, ctx, account.id, account.name, None).await?;
    Ok(json!({"status": "SUCCESS"}))
}

/// Re-establishes a session from a previously issued auth token. The token
/// is reused, not rotated. A mismatch pushes a forced-logout frame so the
/// client discards its stale credentials.
async fn connect(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    data: &Value,
) -> Result<Value, RequestError> {
    let user = field_i64(data, "id")?;
    let token = field_str(data, "token")?;
    let stored = match state.store.get_auth_token(user).await {
        Ok(stored) => stored,
        Err(StorageError::Missing) => None,
        Err(err) => return Err(err.into()),
    };
    match stored {
        Some(stored) if stored == token => {
            let name = state.store.get_user_name(user).await?;
            enter_logged_in(state, ctx, user, name, Some(token.to_string())).await?;
            Ok(json!({"connected": true}))
        }
        _ => {
            ctx.pending.push(Frame::new(kinds::LOGOUT, json!({})));
            Ok(json!({"connected": false}))
        }
    }
}

async fn create_account(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    data: &Value,
) -> Result<Value, RequestError> {
    let name = field_str(data, "name")?.trim();
    let email = field_str(data, "email")?.trim();
    let pass = field_str(data, "pass")?;
    if name.is_empty() {
        return Err(RequestError::Invalid("name must not be empty".to_string()));
    }
    if email.is_empty() || !email.contains('@') {
        return Err(RequestError::Invalid("invalid email address".to_string()));
    }
    if pass.is_empty() {
        return Err(RequestError::Invalid(
            "password must not be empty".to_string(),
        ));
    }
    if state.store.lookup_account(email).await.is_ok() {
        return Err(RequestError::Invalid("account already exists".to_string()));
    }
    if !state
        .codes
        .start_creation(state.mailer.as_ref(), name, email, pass)
        .await
    {
        return Err(RequestError::Invalid(
            "account pending confirmation".to_string(),
        ));
    }
    ctx.session = SessionState::ConfirmEmail {
        email: email.to_string(),
        kind: CodeKind::NewAccount,
    };
    Ok(json!({"created": true}))
}

async fn request_reset(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    data: &Value,
) -> Result<Value, RequestError> {
    let email = field_str(data, "email")?;
    let account = match state.store.lookup_account(email).await {
        Ok(account) => account,
        Err(StorageError::Missing) => return Ok(json!({"sent": false})),
        Err(err) => return Err(err.into()),
    };
    state
        .codes
        .send_confirmation(
            state.mailer.as_ref(),
            email,
            CodeKind::ResetPassword,
            Some(account.id),
        )
        .await;
    ctx.session = SessionState::ConfirmEmail {
        email: email.to_string(),
        kind: CodeKind::ResetPassword,
    };
    Ok(json!({"sent": true}))
}

async fn enter_code(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    email: &str,
    kind: CodeKind,
    data: &Value,
) -> Result<Value, RequestError> {
    let code = field_str(data, "code")?;
    let Some(bound_user) = state.codes.check_code(email, kind, code).await else {
        return Ok(json!({"correct": false}));
    };
    match kind {
        CodeKind::NewAccount => {
            let account = state.codes.finish_creation(&state.store, email).await?;
            enter_logged_in(state, ctx, account.id, account.name, None).await?;
        }
        CodeKind::TwoFactor => {
            let user = bound_user.ok_or_else(|| {
                RequestError::Internal("two-factor code without bound user".to_string())
            })?;
            let name = state.store.get_user_name(user).await?;
            enter_logged_in(state, ctx, user, name, None).await?;
        }
        CodeKind::ResetPassword => {
            let user = bound_user.ok_or_else(|| {
                RequestError::Internal("reset code without bound user".to_string())
            })?;
            ctx.session = SessionState::ResetPassword { user };
        }
    }
    Ok(json!({"correct": true}))
}

/// Stores the new password hash, force-logs-out every other session of the
/// user, and logs this connection in with a fresh token.
async fn finish_reset(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let pass = field_str(data, "pass")?;
    if pass.is_empty() {
        return Err(RequestError::Invalid(
            "password must not be empty".to_string(),
        ));
    }
    let hash = comcore_crypto::hash_password(pass);
    state.store.reset_password(user, &hash).await?;
    state.registry.force_logout(user, Some(ctx.id)).await;
    let name = state.store.get_user_name(user).await?;
    enter_logged_in(state, ctx, user, name, None).await?;
    Ok(json!({"reset": true}))
}

/// Reports link validity without joining. Accepted alongside every state.
async fn check_invite_link(state: &Arc<AppState>, data: &Value) -> Result<Value, RequestError> {
    let code = field_str(data, "link")?.trim();
    let link = match state.store.check_invite_code(code).await {
        Ok(link) => link,
        Err(StorageError::Missing) => return Ok(json!({"valid": false})),
        Err(err) => return Err(err.into()),
    };
    if link.expire_at != 0 && now_millis() > link.expire_at + INVITE_GRACE_MS {
        return Ok(json!({"valid": false}));
    }
    let name = state.store.get_group_name(link.group).await?;
    Ok(json!({"valid": true, "name": name, "expire": link.expire_at}))
}

pub(crate) fn field_str<'a>(data: &'a Value, key: &str) -> Result<&'a str, RequestError> {
    data.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| missing_field(key))
}

pub(crate) fn field_i64(data: &Value, key: &str) -> Result<i64, RequestError> {
    data.get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| missing_field(key))
}

pub(crate) fn field_bool(data: &Value, key: &str) -> Result<bool, RequestError> {
    data.get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| missing_field(key))
}

pub(crate) fn missing_field(key: &str) -> RequestError {
    RequestError::Invalid(format!("missing or invalid field: {}", key))
}
