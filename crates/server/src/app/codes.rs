use crate::app::RequestError;
use crate::mail::Mailer;
use crate::util::now_millis;
use comcore_storage::{Account, Store};
use std::collections::HashMap;
use tokio::sync::Mutex;

pub const CODE_DIGITS: u32 = 6;
const CODE_LIFETIME_MS: i64 = 60 * 60 * 1000;
const MAX_CODE_FAILS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    NewAccount,
    TwoFactor,
    ResetPassword,
}

impl CodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NewAccount => "newAccount",
            Self::TwoFactor => "twoFactor",
            Self::ResetPassword => "resetPassword",
        }
    }
}

struct PendingCode {
    code: String,
    kind: CodeKind,
    user: Option<i64>,
    expires_at: i64,
    fails: u32,
}

struct PendingAccount {
    name: String,
    password_hash: String,
}

/// Process-wide table of live confirmation codes and half-created accounts.
/// Codes are 6 digits, live for one hour, are single-use, and tolerate at
/// most three failed attempts.
#[derive(Default)]
pub struct CodeManager {
    codes: Mutex<HashMap<String, PendingCode>>,
    accounts: Mutex<HashMap<String, PendingAccount>>,
}

impl CodeManager {
    pub fn new() -> Self {
        CodeManager::default()
    }

    /// Issues a confirmation code for the address, or reuses the live code
    /// of the same kind. Only a freshly issued code is handed to the mailer.
    pub async fn send_confirmation(
        &self,
        mailer: &dyn Mailer,
        email: &str,
        kind: CodeKind,
        user: Option<i64>,
    ) {
        let issued = {
            let mut codes = self.codes.lock().await;
            let now = now_millis();
            if let Some(entry) = codes.get(email) {
                if entry.kind == kind && now < entry.expires_at {
                    return;
                }
            }
            let code = comcore_crypto::random_code(CODE_DIGITS);
            codes.insert(
                email.to_string(),
                PendingCode {
                    code: code.clone(),
                    kind,
                    user,
                    expires_at: now + CODE_LIFETIME_MS,
                    fails: 0,
                },
            );
            code
        };
        mailer.send_code(email, kind, &issued).await;
    }

    /// Checks a candidate code. On success the entry is destroyed and its
    /// bound user (if any) is returned; mismatches count toward the fail
    /// limit. The candidate is trimmed and must be exactly six characters
    /// before any comparison is attempted.
    pub async fn check_code(
        &self,
        email: &str,
        kind: CodeKind,
        candidate: &str,
    ) -> Option<Option<i64>> {
        let candidate = candidate.trim();
        if candidate.len() != CODE_DIGITS as usize {
            return None;
        }
        let mut codes = self.codes.lock().await;
        let entry = codes.get(email)?;
        if entry.kind != kind {
            return None;
        }
        if now_millis() >= entry.expires_at {
            codes.remove(email);
            return None;
        }
        if entry.code == candidate {
            let user = entry.user;
            codes.remove(email);
            return Some(user);
        }
        let exhausted = {
            let entry = codes.get_mut(email)?;
            entry.fails += 1;
            entry.fails >= MAX_CODE_FAILS
        };
        if exhausted {
            codes.remove(email);
        }
        None
    }

    /// Registers a half-created account and issues its confirmation code.
    /// Returns false when a creation for this address is already pending.
    pub async fn start_creation(
        &self,
        mailer: &dyn Mailer,
        name: &str,
        email: &str,
        pass: &str,
    ) -> bool {
        {
            let mut accounts = self.accounts.lock().await;
            if accounts.contains_key(email) {
                return false;
            }
            accounts.insert(
                email.to_string(),
                PendingAccount {
                    name: name.to_string(),
                    password_hash: comcore_crypto::hash_password(pass),
                },
            );
        }
        self.send_confirmation(mailer, email, CodeKind::NewAccount, None)
            .await;
        true
    }

    /// True when a pending account exists and the password matches; a fresh
    /// code is issued in case the earlier one has expired.
    pub async fn continue_creation(&self, mailer: &dyn Mailer, email: &str, pass: &str) -> bool {
        let matches = {
            let accounts = self.accounts.lock().await;
            accounts
                .get(email)
                .map(|pending| comcore_crypto::check_password(pass, &pending.password_hash))
                .unwrap_or(false)
        };
        if matches {
            self.send_confirmation(mailer, email, CodeKind::NewAccount, None)
                .await;
        }
        matches
    }

    /// Pops the pending account and materializes it in the store.
    pub async fn finish_creation(
        &self,
        store: &Store,
        email: &str,
    ) -> Result<Account, RequestError> {
        let pending = {
            let mut accounts = self.accounts.lock().await;
            accounts.remove(email)
        };
        let pending = pending
            .ok_or_else(|| RequestError::Invalid("no pending account".to_string()))?;
        let account = store
            .create_account(&pending.name, email, &pending.password_hash)
            .await?;
        Ok(account)
    }
}
