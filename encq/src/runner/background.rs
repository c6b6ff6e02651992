//! Single-process encoding runner.
//!
//! [`BackgroundRunner`] runs at most one encoder invocation at a time. Each
//! start first cleans up whatever came before, creates a pair of
//! randomly-named mirror files for the child's stdout/stderr, launches the
//! process, and spawns an [`OutputStreamReader`] to tail the files.
//!
//! Detection state lives in [`RunnerFlags`], three sticky booleans shared
//! with the reader, so callers can poll them from any thread.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::output::{LogLine, MarkerScanner, OutputStreamReader};
use super::process::ProcessHandle;

const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_READER_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Sticky per-step detection flags.
///
/// Set by the output reader (markers) and by [`BackgroundRunner::kill`], and
/// only cleared by [`RunnerFlags::reset`] at the start of the next step.
#[derive(Debug, Default)]
pub struct RunnerFlags {
    error_detected: AtomicBool,
    success_detected: AtomicBool,
    killed: AtomicBool,
}

impl RunnerFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_detected(&self) -> bool {
        self.error_detected.load(Ordering::SeqCst)
    }

    pub fn set_error_detected(&self) {
        self.error_detected.store(true, Ordering::SeqCst);
    }

    pub fn success_detected(&self) -> bool {
        self.success_detected.load(Ordering::SeqCst)
    }

    pub fn set_success_detected(&self) {
        self.success_detected.store(true, Ordering::SeqCst);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn set_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.error_detected.store(false, Ordering::SeqCst);
        self.success_detected.store(false, Ordering::SeqCst);
        self.killed.store(false, Ordering::SeqCst);
    }
}

/// Runner tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory for mirror files. `None` means the OS temp directory.
    pub scratch_dir: Option<PathBuf>,
    /// How often the reader polls the mirror files for new output.
    pub poll_interval_ms: u64,
    /// How long `clean` waits for the reader before abandoning it.
    pub reader_shutdown_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            reader_shutdown_timeout_ms: DEFAULT_READER_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reader_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_shutdown_timeout_ms)
    }
}

/// Runs one encoder invocation at a time and watches its output.
pub struct BackgroundRunner {
    config: RunnerConfig,
    flags: Arc<RunnerFlags>,
    log_tx: mpsc::UnboundedSender<LogLine>,
    handle: Option<ProcessHandle>,
    reader: Option<JoinHandle<()>>,
    scratch_override: Option<PathBuf>,
}

impl BackgroundRunner {
    pub fn new(config: RunnerConfig, log_tx: mpsc::UnboundedSender<LogLine>) -> Self {
        Self {
            config,
            flags: Arc::new(RunnerFlags::new()),
            log_tx,
            handle: None,
            reader: None,
            scratch_override: None,
        }
    }

    /// Per-batch scratch directory, taking precedence over the configured
    /// one. Pass `None` to fall back again.
    pub fn set_scratch_dir(&mut self, dir: Option<PathBuf>) {
        self.scratch_override = dir;
    }

    /// Start a single command, replacing any previous invocation.
    pub async fn start_exec(
        &mut self,
        command_line: &str,
        work_dir: Option<&Path>,
        shell_mode: bool,
        error_markers: Vec<String>,
        success_markers: Vec<String>,
    ) -> Result<()> {
        self.clean().await;
        info!(command = %command_line, "Starting encoder");
        self.create_work_dir(work_dir).await?;

        let (stdout_path, stdout_file) = self.create_mirror_file("encoder_output").await?;
        let (stderr_path, stderr_file) = self.create_mirror_file("encoder_error").await?;

        let handle = match ProcessHandle::launch(
            command_line,
            work_dir,
            shell_mode,
            stdout_file,
            stderr_file,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.discard_mirror_files(&stdout_path, &stderr_path).await;
                return Err(e);
            }
        };

        self.attach_reader(handle, stdout_path, stderr_path, error_markers, success_markers);
        Ok(())
    }

    /// Start a primary command piped into a secondary one, replacing any
    /// previous invocation.
    pub async fn start_piped_exec(
        &mut self,
        primary_line: &str,
        secondary_line: &str,
        work_dir: Option<&Path>,
        error_markers: Vec<String>,
        success_markers: Vec<String>,
    ) -> Result<()> {
        self.clean().await;
        info!(
            primary = %primary_line,
            secondary = %secondary_line,
            "Starting encoder pipeline"
        );
        self.create_work_dir(work_dir).await?;

        let (stdout_path, stdout_file) = self.create_mirror_file("encoder_output").await?;
        let (stderr_path, stderr_file) = self.create_mirror_file("encoder_error").await?;

        let handle = match ProcessHandle::launch_piped(
            primary_line,
            secondary_line,
            work_dir,
            stdout_file,
            stderr_file,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.discard_mirror_files(&stdout_path, &stderr_path).await;
                return Err(e);
            }
        };

        self.attach_reader(handle, stdout_path, stderr_path, error_markers, success_markers);
        Ok(())
    }

    /// Whether the current invocation is still running.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(ProcessHandle::is_alive)
    }

    /// Exit status of the current invocation, once it has died.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.handle.as_ref().and_then(ProcessHandle::exit_status)
    }

    pub fn error_detected(&self) -> bool {
        self.flags.error_detected()
    }

    pub fn success_detected(&self) -> bool {
        self.flags.success_detected()
    }

    pub fn killed(&self) -> bool {
        self.flags.killed()
    }

    pub fn flags(&self) -> Arc<RunnerFlags> {
        self.flags.clone()
    }

    /// Kill the current invocation and remember that it was killed.
    ///
    /// The `killed` flag stays set until the next start or [`Self::clean`].
    pub fn kill(&self) {
        self.flags.set_killed();
        if let Some(handle) = &self.handle {
            info!("Killing active encoder");
            handle.terminate();
        }
    }

    pub fn supports_pause(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.supports_pause())
    }

    pub fn pause(&self) -> Result<()> {
        match &self.handle {
            Some(handle) => handle.pause(),
            None => Err(Error::NoActiveProcess),
        }
    }

    pub fn resume(&self) -> Result<()> {
        match &self.handle {
            Some(handle) => handle.resume(),
            None => Err(Error::NoActiveProcess),
        }
    }

    /// Wait for the output reader to finish its final drain and mirror-file
    /// cleanup, so the detection flags reflect everything the process wrote.
    ///
    /// Only meaningful once the process is dead; the wait is bounded.
    pub async fn settle_output(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            if tokio::time::timeout(self.config.reader_shutdown_timeout(), &mut reader)
                .await
                .is_err()
            {
                warn!("Output reader did not stop in time, aborting it");
                reader.abort();
            }
        }
    }

    /// Stop any live process, wait for the reader to finish its final drain
    /// and mirror-file cleanup, and reset the detection flags.
    ///
    /// Safe to call repeatedly, including when nothing is running.
    pub async fn clean(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
        self.settle_output().await;
        self.flags.reset();
    }

    fn attach_reader(
        &mut self,
        handle: ProcessHandle,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
        error_markers: Vec<String>,
        success_markers: Vec<String>,
    ) {
        let scanner = MarkerScanner::new(self.flags.clone(), error_markers, success_markers);
        let reader = OutputStreamReader::new(
            stdout_path,
            stderr_path,
            scanner,
            handle.alive_flag(),
            self.log_tx.clone(),
            self.config.poll_interval(),
        );
        self.reader = Some(tokio::spawn(reader.run()));
        self.handle = Some(handle);
    }

    async fn create_work_dir(&self, work_dir: Option<&Path>) -> Result<()> {
        if let Some(dir) = work_dir {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::launch(format!(
                    "Failed to create working directory {}: {e}",
                    dir.display()
                ))
            })?;
        }
        Ok(())
    }

    fn scratch_dir(&self) -> PathBuf {
        self.scratch_override
            .clone()
            .or_else(|| self.config.scratch_dir.clone())
            .unwrap_or_else(std::env::temp_dir)
    }

    async fn create_mirror_file(&self, prefix: &str) -> Result<(PathBuf, Stdio)> {
        let dir = self.scratch_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}_{:016x}.log", prefix, rand::random::<u64>()));
        let file = tokio::fs::File::create(&path).await?.into_std().await;
        Ok((path, Stdio::from(file)))
    }

    async fn discard_mirror_files(&self, stdout_path: &Path, stderr_path: &Path) {
        for path in [stdout_path, stderr_path] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!(path = %path.display(), error = %e, "Failed to remove mirror file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    fn runner_in(dir: &TempDir) -> (BackgroundRunner, mpsc::UnboundedReceiver<LogLine>) {
        let config = RunnerConfig {
            scratch_dir: Some(dir.path().to_path_buf()),
            poll_interval_ms: 10,
            ..RunnerConfig::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (BackgroundRunner::new(config, tx), rx)
    }

    fn scratch_file_count(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[test]
    fn test_flags_reset_clears_all_three() {
        let flags = RunnerFlags::new();
        flags.set_error_detected();
        flags.set_success_detected();
        flags.set_killed();

        flags.reset();
        assert!(!flags.error_detected());
        assert!(!flags.success_detected());
        assert!(!flags.killed());
    }

    #[test]
    fn test_config_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.scratch_dir, None);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.reader_shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_partial_deserialization_fills_defaults() {
        let config: RunnerConfig = serde_json::from_str(r#"{"poll_interval_ms": 100}"#).unwrap();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(
            config.reader_shutdown_timeout_ms,
            RunnerConfig::default().reader_shutdown_timeout_ms
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_exec_detects_success_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let (mut runner, mut rx) = runner_in(&dir);

        runner
            .start_exec("echo done", None, false, vec![], vec!["done".to_string()])
            .await
            .unwrap();

        wait_until(|| !runner.is_alive()).await;
        let flags = runner.flags();
        wait_until(move || flags.success_detected()).await;
        assert!(!runner.error_detected());

        runner.clean().await;
        assert!(!runner.success_detected());
        assert_eq!(scratch_file_count(&dir), 0);

        let line = rx.try_recv().unwrap();
        assert_eq!(line.content, "done");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_marker_sets_error_flag() {
        let dir = TempDir::new().unwrap();
        let (mut runner, _rx) = runner_in(&dir);

        runner
            .start_exec("echo bad >&2", None, true, vec!["bad".to_string()], vec![])
            .await
            .unwrap();

        let flags = runner.flags();
        wait_until(move || flags.error_detected()).await;
        assert!(!runner.success_detected());
        runner.clean().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_settle_output_makes_flags_final() {
        let dir = TempDir::new().unwrap();
        let (mut runner, _rx) = runner_in(&dir);

        // The failure line lands in the process's last instant; after
        // settling, the flag must be readable without any further waiting.
        runner
            .start_exec("echo 'Conversion failed!' >&2", None, true, vec![], vec![])
            .await
            .unwrap();
        wait_until(|| !runner.is_alive()).await;
        runner.settle_output().await;
        assert!(runner.error_detected());

        runner.clean().await;
        assert_eq!(scratch_file_count(&dir), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_piped_exec_detects_success() {
        let dir = TempDir::new().unwrap();
        let (mut runner, _rx) = runner_in(&dir);

        runner
            .start_piped_exec("echo hi", "cat", None, vec![], vec!["hi".to_string()])
            .await
            .unwrap();

        let flags = runner.flags();
        wait_until(move || flags.success_detected()).await;
        runner.clean().await;
        assert_eq!(scratch_file_count(&dir), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_uncreatable_work_dir_fails_synchronously() {
        let dir = TempDir::new().unwrap();
        let (mut runner, _rx) = runner_in(&dir);

        // A path below a regular file can never become a directory.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let work_dir = blocker.join("sub");

        let result = runner
            .start_exec("exit 0", Some(&work_dir), true, vec![], vec![])
            .await;

        assert!(matches!(result, Err(Error::Launch(_))));
        assert!(!runner.is_alive());
        // Only the blocker file itself remains in the scratch dir.
        assert_eq!(scratch_file_count(&dir), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_sets_sticky_flag_until_clean() {
        let dir = TempDir::new().unwrap();
        let (mut runner, _rx) = runner_in(&dir);

        runner
            .start_exec("sleep 30", None, false, vec![], vec![])
            .await
            .unwrap();
        assert!(runner.is_alive());

        runner.kill();
        assert!(runner.killed());
        wait_until(|| !runner.is_alive()).await;
        assert!(runner.killed());

        runner.clean().await;
        assert!(!runner.killed());
        assert_eq!(scratch_file_count(&dir), 0);
    }

    #[tokio::test]
    async fn test_clean_without_process_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (mut runner, _rx) = runner_in(&dir);

        runner.clean().await;
        runner.clean().await;
        assert!(!runner.is_alive());
    }

    #[tokio::test]
    async fn test_pause_without_process_errors() {
        let dir = TempDir::new().unwrap();
        let (runner, _rx) = runner_in(&dir);
        assert!(matches!(runner.pause(), Err(Error::NoActiveProcess)));
        assert!(!runner.supports_pause());
    }
}
