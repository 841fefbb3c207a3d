//! Execution status shared by builds, stages, containers and tasks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Queue,
    Running,
    Reviewing,
    Pause,
    Succeed,
    Failed,
    Canceled,
    Skip,
    Unexec,
    /// Transient marker for an automatic retry; never persisted on a record.
    Retry,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queue => "QUEUE",
            BuildStatus::Running => "RUNNING",
            BuildStatus::Reviewing => "REVIEWING",
            BuildStatus::Pause => "PAUSE",
            BuildStatus::Succeed => "SUCCEED",
            BuildStatus::Failed => "FAILED",
            BuildStatus::Canceled => "CANCELED",
            BuildStatus::Skip => "SKIP",
            BuildStatus::Unexec => "UNEXEC",
            BuildStatus::Retry => "RETRY",
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeed
                | BuildStatus::Failed
                | BuildStatus::Canceled
                | BuildStatus::Skip
                | BuildStatus::Unexec
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, BuildStatus::Running | BuildStatus::Reviewing)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, BuildStatus::Failed)
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, BuildStatus::Canceled)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "QUEUE" => BuildStatus::Queue,
            "RUNNING" => BuildStatus::Running,
            "REVIEWING" => BuildStatus::Reviewing,
            "PAUSE" => BuildStatus::Pause,
            "SUCCEED" => BuildStatus::Succeed,
            "FAILED" => BuildStatus::Failed,
            "CANCELED" => BuildStatus::Canceled,
            "SKIP" => BuildStatus::Skip,
            "UNEXEC" => BuildStatus::Unexec,
            "RETRY" => BuildStatus::Retry,
            other => {
                return Err(crate::Error::Serialization(format!(
                    "unknown build status: {other}"
                )));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_set() {
        assert!(BuildStatus::Unexec.is_finish());
        assert!(BuildStatus::Skip.is_finish());
        assert!(!BuildStatus::Retry.is_finish());
        assert!(!BuildStatus::Pause.is_finish());
    }

    #[test]
    fn test_parse_matches_display() {
        for status in [BuildStatus::Queue, BuildStatus::Reviewing, BuildStatus::Unexec] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<BuildStatus>().is_err());
    }
}
