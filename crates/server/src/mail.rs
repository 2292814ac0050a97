use crate::app::codes::CodeKind;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

/// Delivery seam for confirmation codes. Real transports live behind this
/// trait; the bundled adapters log or capture instead of sending.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_code(&self, email: &str, kind: CodeKind, code: &str);
}

/// Logs issued codes instead of delivering them.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_code(&self, email: &str, kind: CodeKind, code: &str) {
        info!(email = %email, kind = kind.label(), code = %code, "confirmation code issued");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCode {
    pub email: String,
    pub kind: CodeKind,
    pub code: String,
}

/// Records issued codes in memory so they can be inspected.
#[derive(Default)]
pub struct CaptureMailer {
    sent: Mutex<Vec<SentCode>>,
}

impl CaptureMailer {
    pub fn new() -> Self {
        CaptureMailer::default()
    }

    pub async fn sent(&self) -> Vec<SentCode> {
        self.sent.lock().await.clone()
    }

    /// The most recently issued code for an address, if any.
    pub async fn last_code(&self, email: &str) -> Option<String> {
        self.sent
            .lock()
            .await
            .iter()
            .rev()
            .find(|entry| entry.email == email)
            .map(|entry| entry.code.clone())
    }
}

#[async_trait]
impl Mailer for CaptureMailer {
    async fn send_code(&self, email: &str, kind: CodeKind, code: &str) {
        self.sent.lock().await.push(SentCode {
            email: email.to_string(),
            kind,
            code: code.to_string(),
        });
    }
}
