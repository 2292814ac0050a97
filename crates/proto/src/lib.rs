use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const MAX_LINE_LEN: usize = 256 * 1024;

/// Frame kinds pushed by the server outside the request/reply cycle.
pub mod kinds {
    pub const REPLY: &str = "REPLY";
    pub const ERROR: &str = "ERROR";
    pub const PING: &str = "PING";
    pub const LOGIN: &str = "login";
    pub const LOGOUT: &str = "logout";
    pub const END: &str = "end";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_UPDATED: &str = "messageUpdated";
    pub const REACTION: &str = "reaction";
    pub const INVITE: &str = "invite";
    pub const KICKED: &str = "kicked";
    pub const ROLE_CHANGED: &str = "roleChanged";
    pub const MUTED_CHANGED: &str = "mutedChanged";
    pub const TASK: &str = "task";
    pub const TASK_UPDATED: &str = "taskUpdated";
    pub const TASK_DELETED: &str = "taskDeleted";
    pub const EVENT: &str = "event";
    pub const EVENT_UPDATED: &str = "eventUpdated";
    pub const EVENT_DELETED: &str = "eventDeleted";
    pub const EVENT_APPROVED: &str = "eventApproved";
    pub const SET_BULLETIN: &str = "setBulletin";
    pub const POLL: &str = "poll";
}

/// Request kinds that force a logout transition before they are handled.
pub const LOGOUT_FIRST: &[&str] = &["login", "createAccount", "requestReset", "logout"];

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    InvalidJson,
    MissingKind,
    InvalidKind,
    InvalidUtf8,
    LineTooLong,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "malformed json frame"),
            Self::MissingKind => write!(f, "frame kind missing"),
            Self::InvalidKind => write!(f, "frame kind must be a non-empty string"),
            Self::InvalidUtf8 => write!(f, "frame is not valid utf-8"),
            Self::LineTooLong => write!(f, "frame exceeds line limit"),
        }
    }
}

impl Error for CodecError {}

/// One protocol frame. Requests, replies, and pushes all share this shape:
/// a JSON object `{"kind": <string>, "data": <object>}` on a single line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(kind: &str, data: Value) -> Self {
        Frame {
            kind: kind.to_string(),
            data,
        }
    }

    pub fn reply(data: Value) -> Self {
        Frame::new(kinds::REPLY, data)
    }

    pub fn error(message: &str) -> Self {
        Frame::new(kinds::ERROR, serde_json::json!({ "message": message }))
    }

    /// Parses one complete line into a frame.
    pub fn parse(line: &str) -> Result<Frame, CodecError> {
        let value: Value = serde_json::from_str(line).map_err(|_| CodecError::InvalidJson)?;
        let object = value.as_object().ok_or(CodecError::InvalidJson)?;
        let kind = match object.get("kind") {
            None => return Err(CodecError::MissingKind),
            Some(Value::String(kind)) if !kind.is_empty() => kind.clone(),
            Some(_) => return Err(CodecError::InvalidKind),
        };
        let data = object.get("data").cloned().unwrap_or(Value::Null);
        Ok(Frame { kind, data })
    }

    /// Serializes the frame as one newline-terminated line.
    pub fn encode(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"));
        line.push('\n');
        line
    }
}

/// Accumulates raw socket bytes and yields complete lines split on `\r?\n`.
/// The tail without a trailing newline is retained across calls.
#[derive(Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        LineAssembler { buffer: Vec::new() }
    }

    /// Appends inbound bytes and returns every complete non-empty line.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, CodecError> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            let text = String::from_utf8(line).map_err(|_| CodecError::InvalidUtf8)?;
            lines.push(text);
        }
        if self.buffer.len() > MAX_LINE_LEN {
            return Err(CodecError::LineTooLong);
        }
        Ok(lines)
    }
}
