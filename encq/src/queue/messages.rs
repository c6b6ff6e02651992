//! Messages crossing the control-plane boundary.
//!
//! The work queue carries [`WorkRequest`] values from the control plane to
//! the sequencer; the status queue carries [`StatusEvent`] values back.
//! Ownership transfers fully on send, so nothing is shared across the
//! boundary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::job::Job;

/// A request from the control plane to the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkRequest {
    /// Append jobs to the queue. If the sequencer is idle, the first one
    /// starts immediately. `work_dir` is the batch scratch directory for
    /// encoder mirror files.
    AddItems {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        work_dir: Option<PathBuf>,
        jobs: Vec<Job>,
    },
    /// Kill the active job and drop everything still queued.
    Cancel,
    /// Suspend the active step, where the platform and step shape allow it.
    Pause,
    /// Resume a previously suspended step.
    Resume,
}

/// A terminal status reported by the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A job ran all of its steps without a detected error.
    Converted { video_id: String, command_id: String },
    /// A job failed; the queue has been halted and emptied.
    Error { video_id: String, command_id: String },
    /// The active job was killed on request; the queue was emptied.
    Cancelled { video_id: String, command_id: String },
    /// The queue drained completely.
    Complete,
    /// The sequencer has stopped for good.
    Exit,
}
