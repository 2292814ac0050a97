use crate::app::session::{
    field_bool, field_i64, field_str, missing_field, ConnectionContext, INVITE_GRACE_MS,
};
use crate::app::uploads::{self, MAX_UPLOAD_SIZE};
use crate::app::{AppState, RequestError};
use crate::util::now_millis;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use comcore_proto::kinds;
use comcore_storage::{PollItem, Role, StorageError, MAX_ITEM_ID};
use serde_json::{json, Value};
use std::sync::Arc;

const INVITE_LINK_LEN: usize = 10;
const INVITE_LINK_ATTEMPTS: usize = 8;
const MIN_LINK_TTL_MS: i64 = 2 * 60 * 1000;

/// Dispatches one authenticated request. Unknown kinds are plain errors and
/// do not force a logout.
pub async fn dispatch(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    kind: &str,
    data: &Value,
) -> Result<Value, RequestError> {
    match kind {
        "getTwoFactor" => get_two_factor(state, user).await,
        "setTwoFactor" => set_two_factor(state, user, data).await,
        "createGroup" => create_group(state, user, data).await,
        "createSubGroup" => create_sub_group(state, user, data).await,
        "getGroups" => get_groups(state, user).await,
        "getGroupInfo" => get_group_info(state, user, data).await,
        "createModule" => create_module(state, user, data).await,
        "setRequireApproval" => set_require_approval(state, user, data).await,
        "setModuleEnabled" => set_module_enabled(state, user, data).await,
        "getUsers" => get_users(state, user, data).await,
        "getUserInfo" => get_user_info(state, user, data).await,
        "getModules" => get_modules(state, user, data).await,
        "getModuleInfo" => get_module_info(state, user, data).await,
        "createInviteLink" => create_invite_link(state, user, data).await,
        "useInviteLink" => use_invite_link(state, user, data).await,
        "sendInvite" => send_invite(state, user, data).await,
        "getInvites" => get_invites(state, user).await,
        "replyToInvite" => reply_to_invite(state, user, data).await,
        "leaveGroup" => leave_group(state, user, data).await,
        "kick" => kick(state, user, data).await,
        "setRole" => set_role(state, ctx, user, data).await,
        "setMuted" => set_muted(state, user, data).await,
        "sendMessage" => send_message(state, ctx, user, data).await,
        "getMessages" => get_messages(state, user, data).await,
        "updateMessage" => update_message(state, ctx, user, data).await,
        "setReaction" => set_reaction(state, ctx, user, data).await,
        "addTask" => add_task(state, ctx, user, data).await,
        "getTasks" => get_tasks(state, user, data).await,
        "updateTaskStatus" => update_task_status(state, ctx, user, data).await,
        "updateTaskDeadline" => update_task_deadline(state, ctx, user, data).await,
        "deleteTask" => delete_task(state, ctx, user, data).await,
        "addEvent" => add_event(state, ctx, user, data).await,
        "getEvents" => get_events(state, user, data).await,
        "approveEvent" => approve_event(state, ctx, user, data).await,
        "updateEvent" => update_event(state, ctx, user, data).await,
        "deleteEvent" => delete_event(state, ctx, user, data).await,
        "setBulletin" => set_bulletin(state, ctx, user, data).await,
        "addPoll" => add_poll(state, ctx, user, data).await,
        "getPolls" => get_polls(state, user, data).await,
        "voteOnPoll" => vote_on_poll(state, user, data).await,
        "uploadFile" => upload_file(state, data).await,
        "createDirectMessage" => create_direct_message(state, user, data).await,
        _ => Err(RequestError::Invalid(format!(
            "unknown request kind: {}",
            kind
        ))),
    }
}

fn invalid(message: &str) -> RequestError {
    RequestError::Invalid(message.to_string())
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RequestError> {
    serde_json::to_value(value).map_err(|err| RequestError::Internal(err.to_string()))
}

/// Requires membership and at least the given role.
async fn require_role(
    state: &Arc<AppState>,
    group: i64,
    user: i64,
    min: Role,
) -> Result<Role, RequestError> {
    let role = state.store.get_role(group, user).await?;
    if role < min {
        return Err(invalid("insufficient permissions"));
    }
    Ok(role)
}

async fn require_unmuted(state: &Arc<AppState>, group: i64, user: i64) -> Result<(), RequestError> {
    if state.store.get_muted(group, user).await? {
        return Err(invalid("user is muted"));
    }
    Ok(())
}

/// Authority over another member's item: the author themselves, or a
/// strictly more powerful role.
async fn require_item_authority(
    state: &Arc<AppState>,
    group: i64,
    user: i64,
    author: i64,
) -> Result<(), RequestError> {
    if user == author {
        return Ok(());
    }
    let actor = state.store.get_role(group, user).await?;
    let author_role = state
        .store
        .get_role(group, author)
        .await
        .unwrap_or(Role::User);
    if actor > author_role {
        Ok(())
    } else {
        Err(invalid("insufficient permissions"))
    }
}

// ── account settings ────────────────────────────────────────────

async fn get_two_factor(state: &Arc<AppState>, user: i64) -> Result<Value, RequestError> {
    let enabled = state.store.get_two_factor(user).await?;
    Ok(json!({"enabled": enabled}))
}

async fn set_two_factor(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let enabled = field_bool(data, "enabled")?;
    state.store.set_two_factor(user, enabled).await?;
    Ok(json!({}))
}

// ── groups ──────────────────────────────────────────────────────

async fn create_group(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let name = field_str(data, "name")?.trim();
    if name.is_empty() {
        return Err(invalid("group name must not be empty"));
    }
    let id = state.store.create_group(user, name).await?;
    Ok(json!({"id": id}))
}

async fn create_sub_group(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let name = field_str(data, "name")?.trim();
    let users = field_i64_array(data, "users")?;
    if name.is_empty() {
        return Err(invalid("group name must not be empty"));
    }
    require_role(state, group, user, Role::Owner).await?;
    let id = state
        .store
        .create_sub_group(user, group, name, &users)
        .await?;
    Ok(json!({"id": id}))
}

async fn get_groups(state: &Arc<AppState>, user: i64) -> Result<Value, RequestError> {
    let groups = state.store.get_groups(user).await?;
    Ok(json!({"groups": groups}))
}

async fn get_group_info(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let groups = field_i64_array(data, "groups")?;
    let last_refresh = data.get("lastRefresh").and_then(|v| v.as_i64()).unwrap_or(0);
    let infos = state
        .store
        .get_group_info(user, &groups, last_refresh)
        .await?;
    Ok(json!({"groups": infos}))
}

async fn create_module(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let name = field_str(data, "name")?.trim();
    let kind = field_str(data, "type")?;
    if name.is_empty() {
        return Err(invalid("module name must not be empty"));
    }
    if kind.is_empty() {
        return Err(invalid("module type must not be empty"));
    }
    require_role(state, group, user, Role::Moderator).await?;
    let id = state
        .store
        .create_module(group, name, comcore_storage::ModuleKind::from_label(kind))
        .await?;
    Ok(json!({"id": id}))
}

async fn set_require_approval(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let require = field_bool(data, "require")?;
    require_role(state, group, user, Role::Moderator).await?;
    state.store.set_require_approval(group, require).await?;
    Ok(json!({}))
}

async fn set_module_enabled(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let module = field_i64(data, "id")?;
    let enabled = field_bool(data, "enabled")?;
    require_role(state, group, user, Role::Moderator).await?;
    state
        .store
        .set_module_enabled(group, module, enabled)
        .await?;
    Ok(json!({}))
}

async fn get_users(state: &Arc<AppState>, user: i64, data: &Value) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    state.store.check_user_in_group(user, group).await?;
    let users = state.store.get_users(group).await?;
    Ok(json!({"users": users}))
}

async fn get_user_info(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let target = field_i64(data, "user")?;
    state.store.check_user_in_group(user, group).await?;
    let info = state.store.get_user_info(group, target).await?;
    to_value(&info)
}

async fn get_modules(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    state.store.check_user_in_group(user, group).await?;
    let modules = state.store.get_modules(group).await?;
    Ok(json!({"modules": modules}))
}

async fn get_module_info(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    state.store.check_user_in_group(user, group).await?;
    let mut modules = state.store.get_module_info(group).await?;
    if let Some(requested) = data.get("modules").and_then(|v| v.as_array()) {
        let wanted: Vec<i64> = requested.iter().filter_map(|v| v.as_i64()).collect();
        modules.retain(|m| wanted.contains(&m.id));
    }
    Ok(json!({"modules": modules}))
}

// ── invites ─────────────────────────────────────────────────────

async fn create_invite_link(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let expire = field_i64(data, "expire")?;
    if expire < 0 {
        return Err(invalid("invalid expiry"));
    }
    require_role(state, group, user, Role::Moderator).await?;
    let expire_at = if expire == 0 {
        0
    } else {
        expire.max(now_millis() + MIN_LINK_TTL_MS)
    };
    for _ in 0..INVITE_LINK_ATTEMPTS {
        let code = comcore_crypto::human_code(INVITE_LINK_LEN);
        match state
            .store
            .add_group_invite_code(group, &code, expire_at)
            .await
        {
            Ok(()) => return Ok(json!({"link": code})),
            Err(StorageError::Duplicate) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(RequestError::Internal(
        "invite code space exhausted".to_string(),
    ))
}

async fn use_invite_link(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let code = field_str(data, "link")?.trim();
    let link = match state.store.check_invite_code(code).await {
        Ok(link) => link,
        Err(StorageError::Missing) => return Ok(json!({"id": null})),
        Err(err) => return Err(err.into()),
    };
    if link.expire_at != 0 && now_millis() > link.expire_at + INVITE_GRACE_MS {
        return Ok(json!({"id": null}));
    }
    state.store.join_group(user, link.group).await?;
    Ok(json!({"id": link.group}))
}

async fn send_invite(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let email = field_str(data, "email")?;
    require_role(state, group, user, Role::Moderator).await?;
    let target = match state.store.lookup_account(email).await {
        Ok(account) => account,
        Err(StorageError::Missing) => return Err(invalid("account does not exist")),
        Err(err) => return Err(err.into()),
    };
    if state
        .store
        .check_user_in_group(target.id, group)
        .await
        .is_ok()
    {
        return Err(invalid("already a member"));
    }
    // A repeat of a pending invite succeeds without a second push.
    if let Some(invite) = state.store.send_invite(target.id, group, user).await? {
        state
            .registry
            .forward(target.id, kinds::INVITE, to_value(&invite)?, None)
            .await;
    }
    Ok(json!({"sent": true}))
}

async fn get_invites(state: &Arc<AppState>, user: i64) -> Result<Value, RequestError> {
    let invites = state.store.get_invites(user).await?;
    Ok(json!({"invites": invites}))
}

async fn reply_to_invite(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let accept = field_bool(data, "accept")?;
    state.store.reply_to_invite(user, group, accept).await?;
    Ok(json!({}))
}

// ── membership administration ───────────────────────────────────

async fn leave_group(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let role = state.store.get_role(group, user).await?;
    if role == Role::Owner && state.store.get_users(group).await?.len() > 1 {
        return Err(invalid("owner cannot leave group"));
    }
    state.store.leave_group(user, group).await?;
    Ok(json!({}))
}

async fn kick(state: &Arc<AppState>, user: i64, data: &Value) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let target = field_i64(data, "user")?;
    let actor_role = state.store.get_role(group, user).await?;
    let target_role = state.store.get_role(group, target).await?;
    if actor_role <= target_role {
        return Err(invalid("insufficient permissions"));
    }
    state.store.kick(group, target).await?;
    state
        .registry
        .forward(target, kinds::KICKED, json!({"group": group}), None)
        .await;
    Ok(json!({}))
}

async fn set_role(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let target = field_i64(data, "user")?;
    let role = Role::from_label(field_str(data, "role")?).ok_or_else(|| invalid("unknown role"))?;
    if target == user {
        return Err(invalid("cannot change own role"));
    }
    let actor_role = state.store.get_role(group, user).await?;
    let target_role = state.store.get_role(group, target).await?;
    if actor_role <= target_role {
        return Err(invalid("insufficient permissions"));
    }
    // Granting ownership is a transfer: only the owner can do it, and the
    // same update demotes them to moderator.
    if role == Role::Owner && actor_role != Role::Owner {
        return Err(invalid("insufficient permissions"));
    }
    state.store.set_role(group, target, role).await?;
    state
        .registry
        .forward(
            target,
            kinds::ROLE_CHANGED,
            json!({"group": group, "role": role.label()}),
            None,
        )
        .await;
    if role == Role::Owner {
        state
            .registry
            .forward(
                user,
                kinds::ROLE_CHANGED,
                json!({"group": group, "role": Role::Moderator.label()}),
                Some(ctx.id),
            )
            .await;
    }
    Ok(json!({}))
}

async fn set_muted(state: &Arc<AppState>, user: i64, data: &Value) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let target = field_i64(data, "user")?;
    let muted = field_bool(data, "muted")?;
    if target == user {
        return Err(invalid("cannot change own muted status"));
    }
    let actor_role = state.store.get_role(group, user).await?;
    let target_role = state.store.get_role(group, target).await?;
    if actor_role <= target_role {
        return Err(invalid("insufficient permissions"));
    }
    state.store.set_muted(group, target, muted).await?;
    state
        .registry
        .forward(
            target,
            kinds::MUTED_CHANGED,
            json!({"group": group, "muted": muted}),
            None,
        )
        .await;
    Ok(json!({}))
}

// ── messages ────────────────────────────────────────────────────

async fn send_message(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let chat = field_i64(data, "chat")?;
    let contents = field_str(data, "contents")?;
    if contents.is_empty() {
        return Err(invalid("message contents must not be empty"));
    }
    state.store.check_user_in_group(user, group).await?;
    require_unmuted(state, group, user).await?;
    let message = state.store.send_message(group, chat, user, contents).await?;
    state
        .forward_group(
            group,
            kinds::MESSAGE,
            json!({"group": group, "chat": chat, "message": message}),
            Some(ctx.id),
        )
        .await?;
    to_value(&message)
}

async fn get_messages(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let chat = field_i64(data, "chat")?;
    let mut after = field_i64(data, "after")?;
    let mut before = field_i64(data, "before")?;
    if after < 1 {
        after = 0;
    }
    if before < 1 {
        before = MAX_ITEM_ID;
    }
    state.store.check_user_in_group(user, group).await?;
    let messages = state.store.get_messages(group, chat, after, before).await?;
    Ok(json!({"messages": messages}))
}

async fn update_message(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let chat = field_i64(data, "chat")?;
    let id = field_i64(data, "id")?;
    let contents = field_str(data, "newContents")?;
    state.store.check_user_in_group(user, group).await?;
    let message = state.store.get_message(group, chat, id).await?;
    if message.contents.is_empty() {
        return Err(invalid("message is deleted"));
    }
    if message.sender != user {
        // Others' messages can only be deleted, and only from a strictly
        // more powerful role.
        if !contents.is_empty() {
            return Err(invalid("insufficient permissions"));
        }
        require_item_authority(state, group, user, message.sender).await?;
    }
    let updated = state.store.edit_message(group, chat, id, contents).await?;
    state
        .forward_group(
            group,
            kinds::MESSAGE_UPDATED,
            json!({"group": group, "chat": chat, "message": updated}),
            Some(ctx.id),
        )
        .await?;
    to_value(&updated)
}

async fn set_reaction(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let chat = field_i64(data, "chat")?;
    let id = field_i64(data, "id")?;
    let reaction = match data.get("reaction") {
        None | Some(Value::Null) => None,
        Some(Value::String(reaction)) if !reaction.is_empty() => Some(reaction.as_str()),
        Some(_) => return Err(missing_field("reaction")),
    };
    state.store.check_user_in_group(user, group).await?;
    let reactions = state
        .store
        .set_reaction(group, chat, id, user, reaction)
        .await?;
    state
        .forward_group(
            group,
            kinds::REACTION,
            json!({"group": group, "chat": chat, "id": id, "reactions": reactions}),
            Some(ctx.id),
        )
        .await?;
    Ok(json!({"reactions": reactions}))
}

// ── tasks ───────────────────────────────────────────────────────

async fn add_task(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let task_list = field_i64(data, "taskList")?;
    let deadline = field_i64(data, "deadline")?;
    let description = field_str(data, "description")?;
    if description.is_empty() {
        return Err(invalid("task description must not be empty"));
    }
    if deadline < 0 {
        return Err(invalid("invalid deadline"));
    }
    state.store.check_user_in_group(user, group).await?;
    require_unmuted(state, group, user).await?;
    let task = state
        .store
        .create_task(group, task_list, user, deadline, description)
        .await?;
    state
        .forward_group(
            group,
            kinds::TASK,
            json!({"group": group, "taskList": task_list, "task": task}),
            Some(ctx.id),
        )
        .await?;
    to_value(&task)
}

async fn get_tasks(state: &Arc<AppState>, user: i64, data: &Value) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let task_list = field_i64(data, "taskList")?;
    state.store.check_user_in_group(user, group).await?;
    let tasks = state.store.get_tasks(group, task_list).await?;
    Ok(json!({"tasks": tasks}))
}

async fn update_task_status(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let task_list = field_i64(data, "taskList")?;
    let id = field_i64(data, "id")?;
    let completed = field_bool(data, "completed")?;
    state.store.check_user_in_group(user, group).await?;
    require_unmuted(state, group, user).await?;
    let task = state
        .store
        .update_task_status(group, task_list, id, completed)
        .await?;
    state
        .forward_group(
            group,
            kinds::TASK_UPDATED,
            json!({"group": group, "taskList": task_list, "task": task}),
            Some(ctx.id),
        )
        .await?;
    to_value(&task)
}

async fn update_task_deadline(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let task_list = field_i64(data, "taskList")?;
    let id = field_i64(data, "id")?;
    let deadline = field_i64(data, "deadline")?;
    if deadline < 0 {
        return Err(invalid("invalid deadline"));
    }
    state.store.check_user_in_group(user, group).await?;
    require_unmuted(state, group, user).await?;
    let task = state
        .store
        .update_task_deadline(group, task_list, id, deadline)
        .await?;
    state
        .forward_group(
            group,
            kinds::TASK_UPDATED,
            json!({"group": group, "taskList": task_list, "task": task}),
            Some(ctx.id),
        )
        .await?;
    to_value(&task)
}

async fn delete_task(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let task_list = field_i64(data, "taskList")?;
    let id = field_i64(data, "id")?;
    state.store.check_user_in_group(user, group).await?;
    require_unmuted(state, group, user).await?;
    state.store.delete_task(group, task_list, id).await?;
    state
        .forward_group(
            group,
            kinds::TASK_DELETED,
            json!({"group": group, "taskList": task_list, "id": id}),
            Some(ctx.id),
        )
        .await?;
    Ok(json!({}))
}

// ── calendar ────────────────────────────────────────────────────

async fn add_event(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let calendar = field_i64(data, "calendar")?;
    let description = field_str(data, "description")?;
    let start = field_i64(data, "start")?;
    let end = field_i64(data, "end")?;
    if description.is_empty() {
        return Err(invalid("event description must not be empty"));
    }
    if start < 1 {
        return Err(invalid("invalid start time"));
    }
    if end < start {
        return Err(invalid("invalid end time"));
    }
    let role = state.store.get_role(group, user).await?;
    require_unmuted(state, group, user).await?;
    let require_approval = state.store.get_require_approval(group).await?;
    let approved = !(role == Role::User && require_approval);
    let event = state
        .store
        .create_event(group, calendar, user, description, start, end, approved)
        .await?;
    state
        .forward_group(
            group,
            kinds::EVENT,
            json!({"group": group, "calendar": calendar, "event": event}),
            Some(ctx.id),
        )
        .await?;
    to_value(&event)
}

async fn get_events(state: &Arc<AppState>, user: i64, data: &Value) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let calendar = field_i64(data, "calendar")?;
    state.store.check_user_in_group(user, group).await?;
    let events = state.store.get_events(group, calendar).await?;
    Ok(json!({"events": events}))
}

/// Approval either confirms an unapproved event or, when declined, deletes
/// it. Declining an already-approved event is a no-op.
async fn approve_event(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let calendar = field_i64(data, "calendar")?;
    let id = field_i64(data, "id")?;
    let approve = field_bool(data, "approve")?;
    require_role(state, group, user, Role::Moderator).await?;
    let event = state.store.get_event(group, calendar, id).await?;
    if approve {
        if event.approved {
            return to_value(&event);
        }
        let event = state.store.approve_event(group, calendar, id).await?;
        state
            .forward_group(
                group,
                kinds::EVENT_APPROVED,
                json!({"group": group, "calendar": calendar, "event": event}),
                Some(ctx.id),
            )
            .await?;
        return to_value(&event);
    }
    if !event.approved {
        state.store.delete_event(group, calendar, id).await?;
        state
            .forward_group(
                group,
                kinds::EVENT_DELETED,
                json!({"group": group, "calendar": calendar, "id": id}),
                Some(ctx.id),
            )
            .await?;
    }
    Ok(json!({}))
}

async fn update_event(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let calendar = field_i64(data, "calendar")?;
    let id = field_i64(data, "id")?;
    let description = field_str(data, "description")?;
    let start = field_i64(data, "start")?;
    let end = field_i64(data, "end")?;
    if description.is_empty() {
        return Err(invalid("event description must not be empty"));
    }
    if start < 1 {
        return Err(invalid("invalid start time"));
    }
    if end < start {
        return Err(invalid("invalid end time"));
    }
    require_unmuted(state, group, user).await?;
    let event = state.store.get_event(group, calendar, id).await?;
    require_item_authority(state, group, user, event.author).await?;
    let event = state
        .store
        .edit_event(group, calendar, id, description, start, end)
        .await?;
    state
        .forward_group(
            group,
            kinds::EVENT_UPDATED,
            json!({"group": group, "calendar": calendar, "event": event}),
            Some(ctx.id),
        )
        .await?;
    to_value(&event)
}

async fn delete_event(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let calendar = field_i64(data, "calendar")?;
    let id = field_i64(data, "id")?;
    let event = state.store.get_event(group, calendar, id).await?;
    require_item_authority(state, group, user, event.author).await?;
    state.store.delete_event(group, calendar, id).await?;
    state
        .forward_group(
            group,
            kinds::EVENT_DELETED,
            json!({"group": group, "calendar": calendar, "id": id}),
            Some(ctx.id),
        )
        .await?;
    Ok(json!({}))
}

async fn set_bulletin(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let calendar = field_i64(data, "calendar")?;
    let event = match data.get("event") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_i64().ok_or_else(|| missing_field("event"))?),
    };
    require_role(state, group, user, Role::Moderator).await?;
    state.store.set_bulletin_event(group, calendar, event).await?;
    state
        .forward_group(
            group,
            kinds::SET_BULLETIN,
            json!({"group": group, "calendar": calendar, "event": event}),
            Some(ctx.id),
        )
        .await?;
    Ok(json!({}))
}

// ── polls ───────────────────────────────────────────────────────

fn poll_payload(poll: &PollItem, viewer: Option<i64>) -> Value {
    let mut counts = vec![0u64; poll.options.len()];
    for option in poll.votes.values() {
        if *option < counts.len() {
            counts[*option] += 1;
        }
    }
    let options: Vec<Value> = poll
        .options
        .iter()
        .zip(counts)
        .map(|(text, votes)| json!({"text": text, "votes": votes}))
        .collect();
    json!({
        "id": poll.id,
        "author": poll.author,
        "description": poll.description,
        "options": options,
        "voted": viewer.and_then(|viewer| poll.votes.get(&viewer).copied()),
    })
}

async fn add_poll(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let poll_list = field_i64(data, "pollList")?;
    let description = field_str(data, "description")?;
    let options = field_str_array(data, "options")?;
    if description.is_empty() {
        return Err(invalid("poll description must not be empty"));
    }
    if options.is_empty() || options.iter().any(|o| o.is_empty()) {
        return Err(invalid("poll options must not be empty"));
    }
    state.store.check_user_in_group(user, group).await?;
    let poll = state
        .store
        .create_poll(group, poll_list, user, description, &options)
        .await?;
    state
        .forward_group(
            group,
            kinds::POLL,
            json!({"group": group, "pollList": poll_list, "poll": poll_payload(&poll, None)}),
            Some(ctx.id),
        )
        .await?;
    Ok(poll_payload(&poll, Some(user)))
}

async fn get_polls(state: &Arc<AppState>, user: i64, data: &Value) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let poll_list = field_i64(data, "pollList")?;
    state.store.check_user_in_group(user, group).await?;
    let polls = state.store.get_polls(group, poll_list).await?;
    let payloads: Vec<Value> = polls
        .iter()
        .map(|poll| poll_payload(poll, Some(user)))
        .collect();
    Ok(json!({"polls": payloads}))
}

async fn vote_on_poll(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let group = field_i64(data, "group")?;
    let poll_list = field_i64(data, "pollList")?;
    let id = field_i64(data, "id")?;
    let option = field_i64(data, "option")?;
    if option < 0 {
        return Err(invalid("invalid option"));
    }
    state.store.check_user_in_group(user, group).await?;
    state
        .store
        .vote(group, poll_list, id, user, option as usize)
        .await?;
    Ok(json!({}))
}

// ── uploads and direct conversations ────────────────────────────

async fn upload_file(state: &Arc<AppState>, data: &Value) -> Result<Value, RequestError> {
    let name = field_str(data, "name")?;
    let contents = field_str(data, "contents")?;
    let decoded = STANDARD
        .decode(contents)
        .map_err(|_| invalid("invalid base64 payload"))?;
    if decoded.len() > MAX_UPLOAD_SIZE {
        return Err(invalid("file too large"));
    }
    let stored = uploads::save_file(&state.config.uploads_dir, name, &decoded)
        .await
        .map_err(|err| match err {
            uploads::UploadError::TooLarge => invalid("file too large"),
            uploads::UploadError::Io(err) => RequestError::Internal(err.to_string()),
        })?;
    Ok(json!({"link": format!("/files/{}", stored)}))
}

async fn create_direct_message(
    state: &Arc<AppState>,
    user: i64,
    data: &Value,
) -> Result<Value, RequestError> {
    let target = field_i64(data, "user")?;
    if target == user {
        return Err(invalid("cannot message yourself"));
    }
    let (group, _created) = state.store.create_direct_message(user, target).await?;
    Ok(json!({"id": group}))
}

fn field_i64_array(data: &Value, key: &str) -> Result<Vec<i64>, RequestError> {
    let values = data
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| missing_field(key))?;
    values
        .iter()
        .map(|v| v.as_i64().ok_or_else(|| missing_field(key)))
        .collect()
}

fn field_str_array(data: &Value, key: &str) -> Result<Vec<String>, RequestError> {
    let values = data
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| missing_field(key))?;
    values
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| missing_field(key))
        })
        .collect()
}
