//! Task status state machine.
//!
//! `TaskStatus` is persisted as its own column, but outside of
//! `insufficient_quota` it is always the value [`derive_status`] computes
//! from the task's timestamps and exception. Every storage mutator goes
//! through a [`Transition`] so the allowed source states live in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker to fetch it.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Completed without exception.
    Finished,
    /// Completed with a non-empty exception.
    Error,
    /// Administratively canceled.
    Canceled,
    /// Parked by admission control until an explicit rerun.
    InsufficientQuota,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Canceled => "canceled",
            Self::InsufficientQuota => "insufficient_quota",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "error" => Some(Self::Error),
            "canceled" => Some(Self::Canceled),
            "insufficient_quota" => Some(Self::InsufficientQuota),
            _ => None,
        }
    }

    /// Terminal for the worker protocol: no callback will change it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a JSON exception payload counts as "no exception".
///
/// `null`, `{}`, `[]` and `""` are all treated as empty.
pub fn is_empty_payload(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Canonical status derivation.
pub fn derive_status(
    canceled_at: Option<DateTime<Utc>>,
    exception: Option<&Value>,
    ended_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
) -> TaskStatus {
    if canceled_at.is_some() {
        TaskStatus::Canceled
    } else if !is_empty_payload(exception) {
        TaskStatus::Error
    } else if ended_at.is_some() {
        TaskStatus::Finished
    } else if started_at.is_some() {
        TaskStatus::Running
    } else {
        TaskStatus::Pending
    }
}

/// A state-changing operation on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Dispatch claim by a worker fetch.
    Claim,
    /// Worker callback. `failed` is whether the exception is non-empty.
    Complete { failed: bool },
    /// Administrative cancel.
    Cancel,
    /// Admission control rejected the task for quota.
    ParkForQuota,
    /// Administrative rerun of a parked task.
    Reset,
}

impl Transition {
    /// States this transition may start from.
    pub fn allowed_from(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;

        match self {
            Self::Claim | Self::ParkForQuota => &[Pending],
            Self::Complete { .. } => &[Pending, Running],
            Self::Cancel => &[Pending, Running],
            Self::Reset => &[InsufficientQuota],
        }
    }

    /// Status after the transition is applied.
    ///
    /// Claim, Complete and Cancel targets come from [`derive_status`] over the
    /// fields each transition sets.
    pub fn target(&self) -> TaskStatus {
        let now = Some(Utc::now());
        let failure = Value::String("failed".into());
        match self {
            Self::Claim => derive_status(None, None, None, now),
            Self::Complete { failed } => {
                let exception = failed.then_some(&failure);
                derive_status(None, exception, now, now)
            }
            Self::Cancel => derive_status(now, None, None, None),
            Self::ParkForQuota => TaskStatus::InsufficientQuota,
            Self::Reset => derive_status(None, None, None, None),
        }
    }

    pub fn can_apply(&self, from: TaskStatus) -> bool {
        self.allowed_from().contains(&from)
    }

    /// SQL list of allowed source states, for `status IN (...)` clauses.
    pub fn sql_allowed_from(&self) -> String {
        self.allowed_from()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Complete { .. } => "complete",
            Self::Cancel => "cancel",
            Self::ParkForQuota => "park",
            Self::Reset => "rerun",
        }
    }
}
