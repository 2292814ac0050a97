use comcore_proto::Frame;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

/// Out-of-band instructions for a connection's pump, handled ahead of any
/// queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Drop back to the logged-out state and push `logout`.
    ForceLogout,
    /// Push `end` and terminate (graceful shutdown).
    End,
}

#[derive(Clone)]
pub struct ConnectionHandle {
    pub frames: mpsc::UnboundedSender<Frame>,
    pub control: mpsc::UnboundedSender<Control>,
}

/// Process-wide map from user id to that user's live logged-in connections.
/// Entries are mutated only on entering or leaving the logged-in state;
/// empty sets are deleted so the map tracks only online users.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, HashMap<u64, ConnectionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    pub async fn login_connection(&self, user: i64, connection: u64, handle: ConnectionHandle) {
        let mut sessions = self.sessions.write().await;
        sessions.entry(user).or_default().insert(connection, handle);
    }

    pub async fn logout_connection(&self, user: i64, connection: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(handles) = sessions.get_mut(&user) {
            handles.remove(&connection);
            if handles.is_empty() {
                sessions.remove(&user);
            }
        }
    }

    /// Sends a push frame to every live session of the user, except the
    /// named connection. Dead channels are ignored; the pump cleans up.
    pub async fn forward(&self, user: i64, kind: &str, data: Value, except: Option<u64>) {
        let sessions = self.sessions.read().await;
        let Some(handles) = sessions.get(&user) else {
            return;
        };
        for (id, handle) in handles.iter() {
            if Some(*id) == except {
                continue;
            }
            let _ = handle.frames.send(Frame::new(kind, data.clone()));
        }
    }

    /// Terminates the logged-in state of every session of the user except
    /// the named connection. The affected pumps push `logout` themselves.
    pub async fn force_logout(&self, user: i64, except: Option<u64>) {
        let mut sessions = self.sessions.write().await;
        let Some(handles) = sessions.get_mut(&user) else {
            return;
        };
        let victims: Vec<u64> = handles
            .keys()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();
        for id in victims {
            if let Some(handle) = handles.remove(&id) {
                let _ = handle.control.send(Control::ForceLogout);
            }
        }
        if handles.is_empty() {
            sessions.remove(&user);
        }
    }

    pub async fn online_sessions(&self, user: i64) -> usize {
        let sessions = self.sessions.read().await;
        sessions.get(&user).map(|h| h.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handle() -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<Frame>,
        mpsc::UnboundedReceiver<Control>,
    ) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            ConnectionHandle {
                frames: frames_tx,
                control: control_tx,
            },
            frames_rx,
            control_rx,
        )
    }

    #[tokio::test]
    async fn forward_skips_excepted_connection() {
        let registry = SessionRegistry::new();
        let (first, mut first_rx, _c1) = handle();
        let (second, mut second_rx, _c2) = handle();
        registry.login_connection(1, 10, first).await;
        registry.login_connection(1, 11, second).await;
        registry
            .forward(1, "message", json!({"group": 5}), Some(10))
            .await;
        assert!(first_rx.try_recv().is_err());
        let frame = second_rx.try_recv().unwrap();
        assert_eq!(frame.kind, "message");
    }

    #[tokio::test]
    async fn force_logout_spares_the_excepted_connection() {
        let registry = SessionRegistry::new();
        let (first, _f1, mut first_ctrl) = handle();
        let (second, _f2, mut second_ctrl) = handle();
        registry.login_connection(1, 10, first).await;
        registry.login_connection(1, 11, second).await;
        registry.force_logout(1, Some(10)).await;
        assert!(first_ctrl.try_recv().is_err());
        assert_eq!(second_ctrl.try_recv().unwrap(), Control::ForceLogout);
        assert_eq!(registry.online_sessions(1).await, 1);
    }

    #[tokio::test]
    async fn empty_user_entries_are_pruned() {
        let registry = SessionRegistry::new();
        let (first, _f, _c) = handle();
        registry.login_connection(2, 20, first).await;
        registry.logout_connection(2, 20).await;
        assert_eq!(registry.online_sessions(2).await, 0);
        let sessions = registry.sessions.read().await;
        assert!(!sessions.contains_key(&2));
    }
}
