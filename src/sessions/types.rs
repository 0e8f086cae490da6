//! Session types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which AI tool a session runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Claude,
    Gemini,
    Codex,
    /// Anything driven by hand or by a script.
    #[default]
    Adhoc,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::Claude,
        ToolKind::Gemini,
        ToolKind::Codex,
        ToolKind::Adhoc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Claude => "claude",
            ToolKind::Gemini => "gemini",
            ToolKind::Codex => "codex",
            ToolKind::Adhoc => "adhoc",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" | "claude-code" => Ok(ToolKind::Claude),
            "gemini" | "gemini-cli" => Ok(ToolKind::Gemini),
            "codex" => Ok(ToolKind::Codex),
            "adhoc" | "ad-hoc" => Ok(ToolKind::Adhoc),
            other => Err(format!("unknown tool kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Listening,
    Active,
    Idle,
    Stopped,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 5] = [
        SessionStatus::Starting,
        SessionStatus::Listening,
        SessionStatus::Active,
        SessionStatus::Idle,
        SessionStatus::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Listening => "listening",
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Stopped => "stopped",
        }
    }

    /// Sessions that receive broadcasts.
    pub fn is_reachable(&self) -> bool {
        matches!(self, SessionStatus::Listening | SessionStatus::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(SessionStatus::Starting),
            "listening" => Ok(SessionStatus::Listening),
            "active" => Ok(SessionStatus::Active),
            "idle" => Ok(SessionStatus::Idle),
            "stopped" => Ok(SessionStatus::Stopped),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

/// One agent session as seen by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub tool: ToolKind,
    /// Display label, defaults to the id.
    pub label: String,
    pub status: SessionStatus,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Opaque handle to the terminal the session runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,
    /// Remote device id for relayed sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Working directory reported by the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, tool: ToolKind, now: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            tool,
            status: SessionStatus::Starting,
            last_seen: now,
            created_at: now,
            terminal: None,
            device: None,
            directory: None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.device.is_some()
    }

    /// The id without a `:DEVICE` suffix.
    pub fn local_name(&self) -> &str {
        match self.id.rsplit_once(':') {
            Some((name, _)) if self.device.is_some() => name,
            _ => &self.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_kind_parse_and_display() {
        assert_eq!("Claude".parse::<ToolKind>().unwrap(), ToolKind::Claude);
        assert_eq!("gemini-cli".parse::<ToolKind>().unwrap(), ToolKind::Gemini);
        assert!("vim".parse::<ToolKind>().is_err());
        for kind in ToolKind::ALL {
            assert_eq!(kind.to_string().parse::<ToolKind>().unwrap(), kind);
        }
        assert_eq!(ToolKind::default(), ToolKind::Adhoc);
    }

    #[test]
    fn test_status_serde_is_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Listening).unwrap();
        assert_eq!(json, "\"listening\"");
        for status in SessionStatus::ALL {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_reachable_statuses() {
        assert!(SessionStatus::Listening.is_reachable());
        assert!(SessionStatus::Active.is_reachable());
        assert!(!SessionStatus::Idle.is_reachable());
        assert!(!SessionStatus::Starting.is_reachable());
    }

    #[test]
    fn test_local_name_strips_device_suffix() {
        let mut s = Session::new("alpha:WXYZ", ToolKind::Claude, Utc::now());
        assert_eq!(s.local_name(), "alpha:WXYZ");
        s.device = Some("wxyz-device".to_string());
        assert_eq!(s.local_name(), "alpha");
        assert_eq!(s.label, "alpha:WXYZ");
    }
}
