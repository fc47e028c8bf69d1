use serde::Deserialize;
use serde::Serialize;

/// A single entry in a turn's activity feed. Steps are created when a
/// visible tool starts, flipped to `Done` when it ends, and frozen into the
/// assistant message when the turn completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub title: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Step {
    pub fn tool(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::Tool,
            title: title.into(),
            status: StepStatus::Running,
            url: None,
        }
    }

    pub fn preview(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::Preview,
            title: "Preview ready".to_string(),
            status: StepStatus::Done,
            url: Some(url.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Tool,
    Preview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Done,
}
