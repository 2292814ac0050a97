use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailMode {
    /// Log issued codes instead of delivering them (development default).
    Log,
    /// Record issued codes in memory for inspection.
    Capture,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub domain: String,
    pub uploads_dir: String,
    pub mail: MailMode,
}

/// Loads Comcore server configuration from filesystem and environment overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = required(override_env("COMCORE_BIND", map.remove("server.bind"))?)?;
    let tls_cert = required(override_env(
        "COMCORE_TLS_CERT",
        map.remove("server.tls_cert"),
    )?)?;
    let tls_key = required(override_env(
        "COMCORE_TLS_KEY",
        map.remove("server.tls_key"),
    )?)?;
    let domain = override_env("COMCORE_DOMAIN", map.remove("server.domain"))?
        .unwrap_or_else(|| "localhost".to_string());
    let uploads_dir = override_env("COMCORE_UPLOADS_DIR", map.remove("uploads.dir"))?
        .unwrap_or_else(|| "uploads".to_string());
    let mail = match override_env("COMCORE_MAIL_MODE", map.remove("mail.mode"))?
        .unwrap_or_else(|| "log".to_string())
        .as_str()
    {
        "log" => MailMode::Log,
        "capture" => MailMode::Capture,
        _ => return Err(ConfigError::Invalid),
    };

    Ok(ServerConfig {
        bind,
        tls_cert,
        tls_key,
        domain,
        uploads_dir,
        mail,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}
