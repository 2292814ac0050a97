//! Scenario tests driving the state machine and dispatcher through fake
//! channel-backed connections, against the in-memory store and the capture
//! mail adapter.

use crate::app::registry::Control;
use crate::app::session::{self, ConnectionContext, SessionState};
use crate::app::AppState;
use crate::config::{MailMode, ServerConfig};
use crate::mail::CaptureMailer;
use crate::util::now_millis;
use comcore_proto::Frame;
use comcore_storage::Role;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Harness {
    state: Arc<AppState>,
    mailer: Arc<CaptureMailer>,
}

struct TestConn {
    ctx: ConnectionContext,
    frames: mpsc::UnboundedReceiver<Frame>,
    control: mpsc::UnboundedReceiver<Control>,
}

impl TestConn {
    fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

fn harness() -> Harness {
    let config = ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        tls_cert: String::new(),
        tls_key: String::new(),
        domain: "test".to_string(),
        uploads_dir: std::env::temp_dir()
            .join("comcore_scenario_uploads")
            .to_string_lossy()
            .to_string(),
        mail: MailMode::Capture,
    };
    let mailer = Arc::new(CaptureMailer::new());
    let state = AppState::with_mailer(config, Arc::clone(&mailer) as Arc<dyn crate::mail::Mailer>);
    Harness { state, mailer }
}

impl Harness {
    fn open(&self) -> TestConn {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        TestConn {
            ctx: ConnectionContext {
                id: self.state.allocate_connection_id(),
                frames: frames_tx,
                control: control_tx,
                session: SessionState::LoggedOut,
                pending: Vec::new(),
            },
            frames: frames_rx,
            control: control_rx,
        }
    }

    /// Sends one request and returns every frame this connection received
    /// during handling, the reply included, in delivery order.
    async fn request(&self, conn: &mut TestConn, kind: &str, data: Value) -> Vec<Frame> {
        session::handle_frame(&self.state, &mut conn.ctx, Frame::new(kind, data)).await;
        conn.drain()
    }

    /// Creates and confirms an account on the connection, leaving it logged
    /// in. Returns the new user id and auth token.
    async fn signup(&self, conn: &mut TestConn, name: &str, email: &str, pass: &str) -> (i64, String) {
        let frames = self
            .request(
                conn,
                "createAccount",
                json!({"name": name, "email": email, "pass": pass}),
            )
            .await;
        assert_eq!(reply(&frames).data, json!({"created": true}));
        let code = self.mailer.last_code(email).await.expect("code issued");
        let frames = self.request(conn, "enterCode", json!({"code": code})).await;
        assert_eq!(reply(&frames).data, json!({"correct": true}));
        let login = push(&frames, "login");
        (
            login.data["id"].as_i64().unwrap(),
            login.data["token"].as_str().unwrap().to_string(),
        )
    }

    /// Builds a group owned by the first connection's user with the second
    /// connection's user joined as a regular member.
    async fn group_with_member(&self, owner: &mut TestConn, member: &mut TestConn) -> i64 {
        let frames = self.request(owner, "createGroup", json!({"name": "G"})).await;
        let group = reply(&frames).data["id"].as_i64().unwrap();
        let frames = self
            .request(owner, "createInviteLink", json!({"group": group, "expire": 0}))
            .await;
        let link = reply(&frames).data["link"].as_str().unwrap().to_string();
        let frames = self
            .request(member, "useInviteLink", json!({"link": link}))
            .await;
        assert_eq!(reply(&frames).data, json!({"id": group}));
        group
    }
}

fn reply(frames: &[Frame]) -> &Frame {
    frames
        .iter()
        .find(|f| f.kind == "REPLY" || f.kind == "ERROR")
        .expect("reply frame")
}

fn push<'a>(frames: &'a [Frame], kind: &str) -> &'a Frame {
    frames
        .iter()
        .find(|f| f.kind == kind)
        .unwrap_or_else(|| panic!("missing {} push", kind))
}

#[tokio::test]
async fn account_creation_confirms_by_code() {
    let h = harness();
    let mut conn = h.open();
    let frames = h
        .request(
            &mut conn,
            "createAccount",
            json!({"name": "Alice", "email": "alice@x", "pass": "p"}),
        )
        .await;
    assert_eq!(reply(&frames).data, json!({"created": true}));

    let code = h.mailer.last_code("alice@x").await.unwrap();
    let wrong = if code == "123456" { "123457" } else { "123456" };
    let frames = h.request(&mut conn, "enterCode", json!({"code": wrong})).await;
    assert_eq!(reply(&frames).data, json!({"correct": false}));

    let frames = h.request(&mut conn, "enterCode", json!({"code": code})).await;
    // Reply first, then the login push for this device.
    assert_eq!(frames[0].kind, "REPLY");
    assert_eq!(frames[0].data, json!({"correct": true}));
    assert_eq!(frames[1].kind, "login");
    assert_eq!(frames[1].data["name"], json!("Alice"));
    assert!(frames[1].data["token"].as_str().unwrap().len() >= 64);
    assert!(h.state.store.lookup_account("alice@x").await.is_ok());
}

#[tokio::test]
async fn login_reports_status() {
    let h = harness();
    let mut conn = h.open();
    let frames = h
        .request(&mut conn, "login", json!({"email": "ghost@x", "pass": "p"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"status": "DOES_NOT_EXIST"}));

    h.signup(&mut conn, "Alice", "alice@x", "p").await;
    let frames = h
        .request(&mut conn, "login", json!({"email": "alice@x", "pass": "nope"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"status": "INVALID_PASSWORD"}));

    let frames = h
        .request(&mut conn, "login", json!({"email": "alice@x", "pass": "p"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"status": "SUCCESS"}));
    push(&frames, "login");
}

#[tokio::test]
async fn pending_creation_resumes_via_login() {
    let h = harness();
    let mut first = h.open();
    h.request(
        &mut first,
        "createAccount",
        json!({"name": "Alice", "email": "alice@x", "pass": "p"}),
    )
    .await;

    let mut second = h.open();
    let frames = h
        .request(&mut second, "login", json!({"email": "alice@x", "pass": "p"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"status": "ENTER_CODE"}));
    let code = h.mailer.last_code("alice@x").await.unwrap();
    let frames = h.request(&mut second, "enterCode", json!({"code": code})).await;
    assert_eq!(reply(&frames).data, json!({"correct": true}));
}

#[tokio::test]
async fn two_factor_login_requires_code() {
    let h = harness();
    let mut conn = h.open();
    h.signup(&mut conn, "Alice", "alice@x", "p").await;
    let frames = h
        .request(&mut conn, "setTwoFactor", json!({"enabled": true}))
        .await;
    assert_eq!(reply(&frames).data, json!({}));

    let frames = h
        .request(&mut conn, "login", json!({"email": "alice@x", "pass": "p"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"status": "ENTER_CODE"}));
    let code = h.mailer.last_code("alice@x").await.unwrap();
    let frames = h.request(&mut conn, "enterCode", json!({"code": code})).await;
    assert_eq!(reply(&frames).data, json!({"correct": true}));
    push(&frames, "login");
}

#[tokio::test]
async fn connect_accepts_only_the_latest_token() {
    let h = harness();
    let mut conn = h.open();
    let (alice, token) = h.signup(&mut conn, "Alice", "alice@x", "p").await;

    let mut device = h.open();
    let frames = h
        .request(&mut device, "connect", json!({"id": alice, "token": token}))
        .await;
    assert_eq!(reply(&frames).data, json!({"connected": true}));
    assert_eq!(push(&frames, "login").data["token"], json!(token.clone()));

    let mut stale = h.open();
    let frames = h
        .request(&mut stale, "connect", json!({"id": alice, "token": "deadbeef"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"connected": false}));
    push(&frames, "logout");

    // A fresh login rotates the token; the old one stops working.
    let frames = h
        .request(&mut conn, "login", json!({"email": "alice@x", "pass": "p"}))
        .await;
    let rotated = push(&frames, "login").data["token"].as_str().unwrap().to_string();
    assert_ne!(rotated, token);
    let mut old = h.open();
    let frames = h
        .request(&mut old, "connect", json!({"id": alice, "token": token}))
        .await;
    assert_eq!(reply(&frames).data, json!({"connected": false}));
}

#[tokio::test]
async fn message_roundtrip_in_fresh_group() {
    let h = harness();
    let mut conn = h.open();
    let (alice, _) = h.signup(&mut conn, "Alice", "alice@x", "p").await;

    let frames = h.request(&mut conn, "createGroup", json!({"name": "G"})).await;
    let group = reply(&frames).data["id"].as_i64().unwrap();
    let frames = h
        .request(
            &mut conn,
            "createModule",
            json!({"group": group, "name": "main", "type": "chat"}),
        )
        .await;
    let chat = reply(&frames).data["id"].as_i64().unwrap();

    let frames = h
        .request(
            &mut conn,
            "sendMessage",
            json!({"group": group, "chat": chat, "contents": "hello"}),
        )
        .await;
    let sent = &reply(&frames).data;
    assert_eq!(sent["id"], json!(1));
    assert_eq!(sent["sender"], json!(alice));
    assert_eq!(sent["contents"], json!("hello"));
    assert_eq!(sent["reactions"], json!([]));

    let frames = h
        .request(
            &mut conn,
            "getMessages",
            json!({"group": group, "chat": chat, "after": 0, "before": 0}),
        )
        .await;
    let messages = reply(&frames).data["messages"].as_array().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0], *sent);
}

#[tokio::test]
async fn role_changes_are_validated_and_pushed() {
    let h = harness();
    let mut alice_conn = h.open();
    let mut bob_conn = h.open();
    let (alice, alice_token) = h.signup(&mut alice_conn, "Alice", "alice@x", "p").await;
    let (bob, _) = h.signup(&mut bob_conn, "Bob", "bob@x", "p").await;
    let group = h.group_with_member(&mut alice_conn, &mut bob_conn).await;

    let frames = h
        .request(
            &mut bob_conn,
            "setRole",
            json!({"group": group, "user": bob, "role": "moderator"}),
        )
        .await;
    assert_eq!(reply(&frames).kind, "ERROR");
    let frames = h
        .request(
            &mut bob_conn,
            "setRole",
            json!({"group": group, "user": alice, "role": "user"}),
        )
        .await;
    assert_eq!(reply(&frames).kind, "ERROR");

    bob_conn.drain();
    let frames = h
        .request(
            &mut alice_conn,
            "setRole",
            json!({"group": group, "user": bob, "role": "moderator"}),
        )
        .await;
    assert_eq!(reply(&frames).data, json!({}));
    let changed = bob_conn.drain();
    let changed = push(&changed, "roleChanged");
    assert_eq!(changed.data, json!({"group": group, "role": "moderator"}));

    // Ownership transfer: bob becomes owner, alice drops to moderator, and
    // alice's other device hears about it.
    let mut alice_other = h.open();
    h.request(
        &mut alice_other,
        "connect",
        json!({"id": alice, "token": alice_token}),
    )
    .await;
    bob_conn.drain();
    let frames = h
        .request(
            &mut alice_conn,
            "setRole",
            json!({"group": group, "user": bob, "role": "owner"}),
        )
        .await;
    assert_eq!(reply(&frames).data, json!({}));
    let bob_frames = bob_conn.drain();
    assert_eq!(
        push(&bob_frames, "roleChanged").data,
        json!({"group": group, "role": "owner"})
    );
    let other_frames = alice_other.drain();
    assert_eq!(
        push(&other_frames, "roleChanged").data,
        json!({"group": group, "role": "moderator"})
    );
    assert_eq!(h.state.store.get_role(group, bob).await.unwrap(), Role::Owner);
    assert_eq!(
        h.state.store.get_role(group, alice).await.unwrap(),
        Role::Moderator
    );
}

#[tokio::test]
async fn muted_member_cannot_send() {
    let h = harness();
    let mut alice_conn = h.open();
    let mut bob_conn = h.open();
    h.signup(&mut alice_conn, "Alice", "alice@x", "p").await;
    let (bob, _) = h.signup(&mut bob_conn, "Bob", "bob@x", "p").await;
    let group = h.group_with_member(&mut alice_conn, &mut bob_conn).await;
    let frames = h
        .request(
            &mut alice_conn,
            "createModule",
            json!({"group": group, "name": "main", "type": "chat"}),
        )
        .await;
    let chat = reply(&frames).data["id"].as_i64().unwrap();

    bob_conn.drain();
    h.request(
        &mut alice_conn,
        "setMuted",
        json!({"group": group, "user": bob, "muted": true}),
    )
    .await;
    let frames = bob_conn.drain();
    assert_eq!(
        push(&frames, "mutedChanged").data,
        json!({"group": group, "muted": true})
    );
    let frames = h
        .request(
            &mut bob_conn,
            "sendMessage",
            json!({"group": group, "chat": chat, "contents": "x"}),
        )
        .await;
    assert_eq!(reply(&frames).kind, "ERROR");
    assert_eq!(reply(&frames).data["message"], json!("user is muted"));
}

#[tokio::test]
async fn kicked_member_is_notified_and_removed() {
    let h = harness();
    let mut alice_conn = h.open();
    let mut bob_conn = h.open();
    h.signup(&mut alice_conn, "Alice", "alice@x", "p").await;
    let (bob, _) = h.signup(&mut bob_conn, "Bob", "bob@x", "p").await;
    let group = h.group_with_member(&mut alice_conn, &mut bob_conn).await;

    bob_conn.drain();
    let frames = h
        .request(&mut alice_conn, "kick", json!({"group": group, "user": bob}))
        .await;
    assert_eq!(reply(&frames).data, json!({}));
    let frames = bob_conn.drain();
    assert_eq!(push(&frames, "kicked").data, json!({"group": group}));
    assert!(h.state.store.check_user_in_group(bob, group).await.is_err());
}

#[tokio::test]
async fn password_reset_forces_out_other_sessions() {
    let h = harness();
    let mut conn = h.open();
    let (alice, token) = h.signup(&mut conn, "Alice", "alice@x", "p").await;
    let mut other = h.open();
    h.request(&mut other, "connect", json!({"id": alice, "token": token}))
        .await;

    let frames = h
        .request(&mut conn, "requestReset", json!({"email": "alice@x"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"sent": true}));
    let code = h.mailer.last_code("alice@x").await.unwrap();
    let frames = h.request(&mut conn, "enterCode", json!({"code": code})).await;
    assert_eq!(reply(&frames).data, json!({"correct": true}));
    let frames = h
        .request(&mut conn, "finishReset", json!({"pass": "newpass"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"reset": true}));
    push(&frames, "login");

    assert_eq!(other.control.try_recv().unwrap(), Control::ForceLogout);

    let frames = h
        .request(&mut conn, "login", json!({"email": "alice@x", "pass": "p"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"status": "INVALID_PASSWORD"}));
    let frames = h
        .request(
            &mut conn,
            "login",
            json!({"email": "alice@x", "pass": "newpass"}),
        )
        .await;
    assert_eq!(reply(&frames).data, json!({"status": "SUCCESS"}));
}

#[tokio::test]
async fn repeated_invite_stays_idempotent() {
    let h = harness();
    let mut alice_conn = h.open();
    let mut carol_conn = h.open();
    h.signup(&mut alice_conn, "Alice", "alice@x", "p").await;
    let (carol, _) = h.signup(&mut carol_conn, "Carol", "carol@x", "p").await;
    let frames = h
        .request(&mut alice_conn, "createGroup", json!({"name": "G"}))
        .await;
    let group = reply(&frames).data["id"].as_i64().unwrap();

    carol_conn.drain();
    let frames = h
        .request(
            &mut alice_conn,
            "sendInvite",
            json!({"group": group, "email": "carol@x"}),
        )
        .await;
    assert_eq!(reply(&frames).data, json!({"sent": true}));
    let pushed = carol_conn.drain();
    assert_eq!(push(&pushed, "invite").data["group"], json!(group));

    let frames = h
        .request(
            &mut alice_conn,
            "sendInvite",
            json!({"group": group, "email": "carol@x"}),
        )
        .await;
    assert_eq!(reply(&frames).data, json!({"sent": true}));
    assert!(carol_conn.drain().iter().all(|f| f.kind != "invite"));

    let frames = h.request(&mut carol_conn, "getInvites", json!({})).await;
    assert_eq!(reply(&frames).data["invites"].as_array().unwrap().len(), 1);
    let frames = h
        .request(
            &mut carol_conn,
            "replyToInvite",
            json!({"group": group, "accept": true}),
        )
        .await;
    assert_eq!(reply(&frames).data, json!({}));
    assert!(h.state.store.check_user_in_group(carol, group).await.is_ok());
}

#[tokio::test]
async fn invite_links_clamp_expiry_and_honor_grace() {
    let h = harness();
    let mut alice_conn = h.open();
    let mut bob_conn = h.open();
    let (alice, _) = h.signup(&mut alice_conn, "Alice", "alice@x", "p").await;
    h.signup(&mut bob_conn, "Bob", "bob@x", "p").await;
    let frames = h
        .request(&mut alice_conn, "createGroup", json!({"name": "G"}))
        .await;
    let group = reply(&frames).data["id"].as_i64().unwrap();

    // Requested expiry below the floor is clamped to now + 2 minutes.
    let frames = h
        .request(
            &mut alice_conn,
            "createInviteLink",
            json!({"group": group, "expire": now_millis() + 1000}),
        )
        .await;
    let link = reply(&frames).data["link"].as_str().unwrap().to_string();
    assert_eq!(link.len(), 10);
    let stored = h.state.store.check_invite_code(&link).await.unwrap();
    assert!(stored.expire_at >= now_millis() + 110 * 1000);

    // Within the 30 second grace window an expired link still joins.
    h.state
        .store
        .add_group_invite_code(group, "graceygrace", now_millis() - 10 * 1000)
        .await
        .unwrap();
    let frames = h
        .request(&mut bob_conn, "useInviteLink", json!({"link": "graceygrace"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"id": group}));

    // Beyond the grace window it does not.
    let other = h.state.store.create_group(alice, "H").await.unwrap();
    h.state
        .store
        .add_group_invite_code(other, "expiredcode", now_millis() - 40 * 1000)
        .await
        .unwrap();
    let frames = h
        .request(&mut bob_conn, "useInviteLink", json!({"link": "expiredcode"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"id": null}));
    let frames = h
        .request(&mut bob_conn, "checkInviteLink", json!({"link": "expiredcode"}))
        .await;
    assert_eq!(reply(&frames).data, json!({"valid": false}));
}

#[tokio::test]
async fn event_approval_follows_role_and_flag() {
    let h = harness();
    let mut alice_conn = h.open();
    let mut bob_conn = h.open();
    h.signup(&mut alice_conn, "Alice", "alice@x", "p").await;
    h.signup(&mut bob_conn, "Bob", "bob@x", "p").await;
    let group = h.group_with_member(&mut alice_conn, &mut bob_conn).await;
    h.request(
        &mut alice_conn,
        "setRequireApproval",
        json!({"group": group, "require": true}),
    )
    .await;
    let frames = h
        .request(
            &mut alice_conn,
            "createModule",
            json!({"group": group, "name": "cal", "type": "cal"}),
        )
        .await;
    let calendar = reply(&frames).data["id"].as_i64().unwrap();

    let frames = h
        .request(
            &mut bob_conn,
            "addEvent",
            json!({"group": group, "calendar": calendar, "description": "party", "start": 1, "end": 2}),
        )
        .await;
    let pending_event = reply(&frames).data.clone();
    assert_eq!(pending_event["approved"], json!(false));

    let frames = h
        .request(
            &mut alice_conn,
            "addEvent",
            json!({"group": group, "calendar": calendar, "description": "review", "start": 5, "end": 6}),
        )
        .await;
    assert_eq!(reply(&frames).data["approved"], json!(true));

    let frames = h
        .request(
            &mut alice_conn,
            "approveEvent",
            json!({"group": group, "calendar": calendar, "id": pending_event["id"], "approve": true}),
        )
        .await;
    assert_eq!(reply(&frames).data["approved"], json!(true));

    // Declining an unapproved event deletes it.
    let frames = h
        .request(
            &mut bob_conn,
            "addEvent",
            json!({"group": group, "calendar": calendar, "description": "raid", "start": 9, "end": 9}),
        )
        .await;
    let doomed = reply(&frames).data["id"].as_i64().unwrap();
    h.request(
        &mut alice_conn,
        "approveEvent",
        json!({"group": group, "calendar": calendar, "id": doomed, "approve": false}),
    )
    .await;
    let frames = h
        .request(
            &mut alice_conn,
            "getEvents",
            json!({"group": group, "calendar": calendar}),
        )
        .await;
    let events = reply(&frames).data["events"].as_array().unwrap().clone();
    assert!(events.iter().all(|e| e["id"] != json!(doomed)));
}

#[tokio::test]
async fn message_editing_rules() {
    let h = harness();
    let mut alice_conn = h.open();
    let mut bob_conn = h.open();
    h.signup(&mut alice_conn, "Alice", "alice@x", "p").await;
    h.signup(&mut bob_conn, "Bob", "bob@x", "p").await;
    let group = h.group_with_member(&mut alice_conn, &mut bob_conn).await;
    let frames = h
        .request(
            &mut alice_conn,
            "createModule",
            json!({"group": group, "name": "main", "type": "chat"}),
        )
        .await;
    let chat = reply(&frames).data["id"].as_i64().unwrap();

    let frames = h
        .request(
            &mut bob_conn,
            "sendMessage",
            json!({"group": group, "chat": chat, "contents": "draft"}),
        )
        .await;
    let id = reply(&frames).data["id"].as_i64().unwrap();

    // Authors edit their own messages.
    let frames = h
        .request(
            &mut bob_conn,
            "updateMessage",
            json!({"group": group, "chat": chat, "id": id, "newContents": "final"}),
        )
        .await;
    assert_eq!(reply(&frames).data["contents"], json!("final"));

    // A more powerful role may delete, but not rewrite, others' messages.
    let frames = h
        .request(
            &mut alice_conn,
            "updateMessage",
            json!({"group": group, "chat": chat, "id": id, "newContents": "vandalized"}),
        )
        .await;
    assert_eq!(reply(&frames).kind, "ERROR");
    let frames = h
        .request(
            &mut alice_conn,
            "updateMessage",
            json!({"group": group, "chat": chat, "id": id, "newContents": ""}),
        )
        .await;
    assert_eq!(reply(&frames).data["contents"], json!(""));

    // Deleted messages cannot be edited again.
    let frames = h
        .request(
            &mut bob_conn,
            "updateMessage",
            json!({"group": group, "chat": chat, "id": id, "newContents": "resurrect"}),
        )
        .await;
    assert_eq!(reply(&frames).data["message"], json!("message is deleted"));
}

#[tokio::test]
async fn polls_record_one_vote_per_user() {
    let h = harness();
    let mut conn = h.open();
    h.signup(&mut conn, "Alice", "alice@x", "p").await;
    let frames = h.request(&mut conn, "createGroup", json!({"name": "G"})).await;
    let group = reply(&frames).data["id"].as_i64().unwrap();
    let frames = h
        .request(
            &mut conn,
            "createModule",
            json!({"group": group, "name": "votes", "type": "poll"}),
        )
        .await;
    let poll_list = reply(&frames).data["id"].as_i64().unwrap();

    let frames = h
        .request(
            &mut conn,
            "addPoll",
            json!({"group": group, "pollList": poll_list, "description": "lunch?", "options": ["pizza", "sushi"]}),
        )
        .await;
    let poll = reply(&frames).data["id"].as_i64().unwrap();

    h.request(
        &mut conn,
        "voteOnPoll",
        json!({"group": group, "pollList": poll_list, "id": poll, "option": 0}),
    )
    .await;
    h.request(
        &mut conn,
        "voteOnPoll",
        json!({"group": group, "pollList": poll_list, "id": poll, "option": 1}),
    )
    .await;
    let frames = h
        .request(
            &mut conn,
            "getPolls",
            json!({"group": group, "pollList": poll_list}),
        )
        .await;
    let polls = reply(&frames).data["polls"].as_array().unwrap().clone();
    assert_eq!(polls[0]["voted"], json!(1));
    assert_eq!(polls[0]["options"][0]["votes"], json!(0));
    assert_eq!(polls[0]["options"][1]["votes"], json!(1));

    let frames = h
        .request(
            &mut conn,
            "voteOnPoll",
            json!({"group": group, "pollList": poll_list, "id": poll, "option": 9}),
        )
        .await;
    assert_eq!(reply(&frames).kind, "ERROR");
}

#[tokio::test]
async fn unknown_kind_errors_without_logout() {
    let h = harness();
    let mut conn = h.open();
    h.signup(&mut conn, "Alice", "alice@x", "p").await;
    let frames = h.request(&mut conn, "bogusKind", json!({})).await;
    assert_eq!(reply(&frames).kind, "ERROR");
    assert!(frames.iter().all(|f| f.kind != "logout"));
    let frames = h.request(&mut conn, "getGroups", json!({})).await;
    assert_eq!(reply(&frames).kind, "REPLY");
}

#[tokio::test]
async fn upload_stores_and_links() {
    let h = harness();
    let mut conn = h.open();
    h.signup(&mut conn, "Alice", "alice@x", "p").await;
    let frames = h
        .request(
            &mut conn,
            "uploadFile",
            json!({"name": "notes.txt", "contents": "aGVsbG8="}),
        )
        .await;
    let link = reply(&frames).data["link"].as_str().unwrap().to_string();
    assert!(link.starts_with("/files/"));
    assert!(link.ends_with("notes.txt"));

    let frames = h
        .request(
            &mut conn,
            "uploadFile",
            json!({"name": "bad.bin", "contents": "%%%not-base64%%%"}),
        )
        .await;
    assert_eq!(reply(&frames).kind, "ERROR");
}

#[tokio::test]
async fn direct_conversations_are_shared() {
    let h = harness();
    let mut alice_conn = h.open();
    let mut bob_conn = h.open();
    let (alice, _) = h.signup(&mut alice_conn, "Alice", "alice@x", "p").await;
    let (bob, _) = h.signup(&mut bob_conn, "Bob", "bob@x", "p").await;

    let frames = h
        .request(&mut alice_conn, "createDirectMessage", json!({"user": bob}))
        .await;
    let first = reply(&frames).data["id"].as_i64().unwrap();
    let frames = h
        .request(&mut bob_conn, "createDirectMessage", json!({"user": alice}))
        .await;
    assert_eq!(reply(&frames).data["id"].as_i64().unwrap(), first);
}
