//! Server-side processes and the poller that waits for them.
//!
//! Uploads and asynchronous downloads are handed off to server-side jobs
//! identified by opaque process ids. [`poll`] queries their status with
//! bounded concurrency until each reaches a terminal state or the time budget
//! runs out.

mod poller;
mod source;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use poller::{PollPolicy, poll};
pub use source::{ApiProcessSource, ProcessStatusSource, parse_process};

/// Status of a server-side process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Accepted and not finished yet.
    Queued,
    /// Completed successfully.
    Finished,
    /// Completed unsuccessfully.
    Failed,
}

impl ProcessStatus {
    /// Maps a server status string. Unknown in-progress states count as queued.
    #[must_use]
    pub fn from_server(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "finished" | "done" | "completed" | "complete" | "success" => Self::Finished,
            "failed" | "cancelled" | "canceled" | "error" => Self::Failed,
            _ => Self::Queued,
        }
    }

    /// `finished` and `failed` need no further polling.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed state of a server-side process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedProcess {
    /// Server-assigned identifier.
    pub id: String,
    /// Last observed status.
    pub status: ProcessStatus,
    /// Result location, present only for finished jobs that produce one.
    pub result_url: Option<String>,
}

impl QueuedProcess {
    /// A freshly accepted process.
    pub fn queued(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ProcessStatus::Queued,
            result_url: None,
        }
    }

    /// A process recorded as failed.
    pub fn failed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ProcessStatus::Failed,
            result_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProcessStatus::from_server("finished"), ProcessStatus::Finished);
        assert_eq!(ProcessStatus::from_server(" DONE "), ProcessStatus::Finished);
        assert_eq!(ProcessStatus::from_server("failed"), ProcessStatus::Failed);
        assert_eq!(ProcessStatus::from_server("cancelled"), ProcessStatus::Failed);
        assert_eq!(ProcessStatus::from_server("running"), ProcessStatus::Queued);
        assert_eq!(ProcessStatus::from_server(""), ProcessStatus::Queued);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ProcessStatus::Finished.is_terminal());
        assert!(ProcessStatus::Failed.is_terminal());
        assert!(!ProcessStatus::Queued.is_terminal());
    }
}
