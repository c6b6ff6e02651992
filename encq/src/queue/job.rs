//! Queue data model: jobs and their steps.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The command shape of one encoding step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepCommand {
    /// One command line. With `shell` set it runs through the platform
    /// shell, otherwise it is token-split and executed directly.
    Single {
        command: String,
        #[serde(default)]
        shell: bool,
    },
    /// A primary command whose stdout feeds the secondary's stdin.
    Piped { primary: String, secondary: String },
}

/// One external-process invocation within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub command: StepCommand,
    /// Working directory for the spawned process, overriding the job's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    /// Substrings that mark a stderr line as a failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_markers: Vec<String>,
    /// Substrings that mark a stdout line as a success.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_markers: Vec<String>,
}

impl Step {
    /// A single command run through the platform shell.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::from_command(StepCommand::Single {
            command: command.into(),
            shell: true,
        })
    }

    /// A single command, token-split and executed directly.
    pub fn exec(command: impl Into<String>) -> Self {
        Self::from_command(StepCommand::Single {
            command: command.into(),
            shell: false,
        })
    }

    /// A primary command piped into a secondary one.
    pub fn piped(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self::from_command(StepCommand::Piped {
            primary: primary.into(),
            secondary: secondary.into(),
        })
    }

    fn from_command(command: StepCommand) -> Self {
        Self {
            command,
            work_dir: None,
            error_markers: Vec::new(),
            success_markers: Vec::new(),
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_error_markers(mut self, markers: Vec<String>) -> Self {
        self.error_markers = markers;
        self
    }

    pub fn with_success_markers(mut self, markers: Vec<String>) -> Self {
        self.success_markers = markers;
        self
    }
}

/// One full encode task for one video: an ordered sequence of steps.
///
/// `video_id` and `command_id` are opaque to the sequencer; they are echoed
/// back verbatim in terminal status events so the control plane can match
/// results to its own records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub video_id: String,
    pub command_id: String,
    pub steps: Vec<Step>,
    /// Default working directory for this job's steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

impl Job {
    pub fn new(
        video_id: impl Into<String>,
        command_id: impl Into<String>,
        steps: Vec<Step>,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            command_id: command_id.into(),
            steps,
            work_dir: None,
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_builders() {
        let step = Step::shell("ffmpeg -i in.mkv out.mkv")
            .with_error_markers(vec!["Error".to_string()])
            .with_success_markers(vec!["muxing overhead".to_string()]);

        assert_eq!(
            step.command,
            StepCommand::Single {
                command: "ffmpeg -i in.mkv out.mkv".to_string(),
                shell: true,
            }
        );
        assert_eq!(step.error_markers, vec!["Error"]);
        assert!(step.work_dir.is_none());

        let step = Step::piped("ffmpeg -i in.mkv -f nut -", "mkvmerge -o out.mkv -");
        assert!(matches!(step.command, StepCommand::Piped { .. }));
    }

    #[test]
    fn test_sparse_job_deserializes_with_defaults() {
        let json = r#"{
            "video_id": "v1",
            "command_id": "c1",
            "steps": [{"command": {"type": "single", "command": "ffmpeg -version"}}]
        }"#;
        let job: Job = serde_json::from_str(json).unwrap();

        assert_eq!(job.video_id, "v1");
        assert!(job.work_dir.is_none());
        let step = &job.steps[0];
        assert_eq!(
            step.command,
            StepCommand::Single {
                command: "ffmpeg -version".to_string(),
                shell: false,
            }
        );
        assert!(step.error_markers.is_empty());
        assert!(step.success_markers.is_empty());
    }
}
