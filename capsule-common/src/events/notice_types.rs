//! Notice severity types for user-visible messages

use serde::{Deserialize, Serialize};

/// Severity of a user-visible notice
///
/// Rendering (toast, dialog, stderr line) is up to the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Success,
    /// Forward progress was made but something needs attention (HTTP 207)
    Warning,
    Error,
}

impl NoticeLevel {
    pub fn label(&self) -> &'static str {
        match self {
            NoticeLevel::Info => "info",
            NoticeLevel::Success => "ok",
            NoticeLevel::Warning => "warning",
            NoticeLevel::Error => "error",
        }
    }
}
