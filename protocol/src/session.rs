use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::step::Step;

/// Lifecycle of a conversation session. A session starts `Pending` (no
/// sandbox yet), passes through `Creating` while its sandbox is being
/// provisioned, and then alternates `Ready` ⇄ `Busy` for the rest of its
/// life. `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Creating,
    Ready,
    Busy,
    Error,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Creating => "creating",
            SessionStatus::Ready => "ready",
            SessionStatus::Busy => "busy",
            SessionStatus::Error => "error",
            SessionStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionStatus::Pending),
            "creating" => Some(SessionStatus::Creating),
            "ready" => Some(SessionStatus::Ready),
            "busy" => Some(SessionStatus::Busy),
            "error" => Some(SessionStatus::Error),
            "terminated" => Some(SessionStatus::Terminated),
            _ => None,
        }
    }

    /// Whether a new user message may be accepted in this state.
    pub fn accepts_messages(&self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Ready)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A session row as stored and as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub sandbox_id: Option<String>,
    pub preview_url: Option<String>,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// A message row, with its frozen step traces when the turn produced any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub steps: Option<Vec<Step>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Creating,
            SessionStatus::Ready,
            SessionStatus::Busy,
            SessionStatus::Error,
            SessionStatus::Terminated,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("zombie"), None);
    }

    #[test]
    fn only_pending_and_ready_accept_messages() {
        assert!(SessionStatus::Pending.accepts_messages());
        assert!(SessionStatus::Ready.accepts_messages());
        assert!(!SessionStatus::Busy.accepts_messages());
        assert!(!SessionStatus::Terminated.accepts_messages());
    }
}
