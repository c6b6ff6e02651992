//! Process output draining and marker detection.
//!
//! Encoder stdout/stderr are redirected to throwaway mirror files rather than
//! pipes, so a slow consumer can never back-pressure the encoder. The
//! [`OutputStreamReader`] tails both files, forwards every record to the log
//! channel, and scans them for the configured success/error markers.
//!
//! FFmpeg rewrites its progress line with bare `\r`, so records are delimited
//! by either `\n` or `\r`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::background::RunnerFlags;

/// Fixed stderr literal that always marks an encoder failure, regardless of
/// the configured error markers.
pub const CONVERSION_FAILED_MARKER: &str = "Conversion failed!";

/// Which stream of the encoder a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogSource::Stdout => write!(f, "stdout"),
            LogSource::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of encoder output, as delivered on the log channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub source: LogSource,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl LogLine {
    pub fn new(source: LogSource, content: impl Into<String>) -> Self {
        Self {
            source,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// Substring-matches output records against the step's marker lists and sets
/// the sticky detection flags.
///
/// Success markers apply to stdout, error markers to stderr. A stderr record
/// containing [`CONVERSION_FAILED_MARKER`] flags an error even with an empty
/// error-marker list. Once set, a flag stays set for the rest of the step.
pub struct MarkerScanner {
    flags: Arc<RunnerFlags>,
    error_markers: Vec<String>,
    success_markers: Vec<String>,
}

impl MarkerScanner {
    pub fn new(
        flags: Arc<RunnerFlags>,
        error_markers: Vec<String>,
        success_markers: Vec<String>,
    ) -> Self {
        Self {
            flags,
            error_markers,
            success_markers,
        }
    }

    /// Scan a stdout record for success markers.
    pub fn scan_stdout(&self, line: &str) {
        if self.flags.success_detected() {
            return;
        }
        if self.success_markers.iter().any(|m| line.contains(m.as_str())) {
            debug!(line = %line, "Success marker matched");
            self.flags.set_success_detected();
        }
    }

    /// Scan a stderr record for the fixed failure literal, then the
    /// configured error markers.
    pub fn scan_stderr(&self, line: &str) {
        if line.contains(CONVERSION_FAILED_MARKER) {
            if !self.flags.error_detected() {
                debug!(line = %line, "Conversion failure reported by encoder");
            }
            self.flags.set_error_detected();
            return;
        }
        if self.flags.error_detected() {
            return;
        }
        if self.error_markers.iter().any(|m| line.contains(m.as_str())) {
            debug!(line = %line, "Error marker matched");
            self.flags.set_error_detected();
        }
    }
}

/// Tails a growing mirror file and yields text records delimited by `\n` or
/// `\r`.
struct LogTailer {
    file: tokio::fs::File,
    pending: Vec<u8>,
    scratch: [u8; 4096],
}

impl LogTailer {
    async fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: tokio::fs::File::open(path).await?,
            pending: Vec::new(),
            scratch: [0u8; 4096],
        })
    }

    /// Read everything appended since the last call and push complete records
    /// into `out`. Returns whether any bytes were read.
    async fn poll_records(&mut self, out: &mut Vec<String>) -> io::Result<bool> {
        let mut read_any = false;
        loop {
            let n = self.file.read(&mut self.scratch).await?;
            if n == 0 {
                break;
            }
            read_any = true;
            self.pending.extend_from_slice(&self.scratch[..n]);
        }

        while let Some(idx) = find_record_delimiter(&self.pending) {
            let record_bytes: Vec<u8> = self.pending.drain(..idx).collect();
            consume_delimiters(&mut self.pending);

            let record = String::from_utf8_lossy(&record_bytes).trim().to_string();
            if record.is_empty() {
                continue;
            }
            out.push(record);
        }
        Ok(read_any)
    }

    /// Flush a trailing record that was written without a final delimiter.
    fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let record = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!record.is_empty()).then_some(record)
    }
}

fn find_record_delimiter(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| matches!(b, b'\n' | b'\r'))
}

fn consume_delimiters(buf: &mut Vec<u8>) {
    let n = buf
        .iter()
        .take_while(|&&b| matches!(b, b'\n' | b'\r'))
        .count();
    if n > 0 {
        buf.drain(..n);
    }
}

/// Background task that drains a step's two mirror files.
///
/// Runs until the liveness flag drops, performs one final drain (including a
/// trailing partial line), then deletes both mirror files. Deletion failures
/// are logged and swallowed; the files are throwaway scratch.
pub struct OutputStreamReader {
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    scanner: MarkerScanner,
    process_alive: Arc<std::sync::atomic::AtomicBool>,
    log_tx: mpsc::UnboundedSender<LogLine>,
    poll_interval: Duration,
}

impl OutputStreamReader {
    pub fn new(
        stdout_path: PathBuf,
        stderr_path: PathBuf,
        scanner: MarkerScanner,
        process_alive: Arc<std::sync::atomic::AtomicBool>,
        log_tx: mpsc::UnboundedSender<LogLine>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            stdout_path,
            stderr_path,
            scanner,
            process_alive,
            log_tx,
            poll_interval,
        }
    }

    /// Drain both mirror files until the process dies, then clean up.
    pub async fn run(mut self) {
        if let Err(e) = self.pump().await {
            warn!(error = %e, "Output reader stopped early");
        }
        self.remove_mirror_files().await;
    }

    async fn pump(&mut self) -> io::Result<()> {
        let mut stdout_tail = LogTailer::open(&self.stdout_path).await?;
        let mut stderr_tail = LogTailer::open(&self.stderr_path).await?;
        let mut records = Vec::new();

        loop {
            let mut got_data = self
                .drain(&mut stdout_tail, LogSource::Stdout, &mut records)
                .await?;
            got_data |= self
                .drain(&mut stderr_tail, LogSource::Stderr, &mut records)
                .await?;

            if !self.process_alive.load(Ordering::SeqCst) {
                // One last pass for anything flushed in the final instant
                // before exit.
                self.drain(&mut stdout_tail, LogSource::Stdout, &mut records)
                    .await?;
                self.drain(&mut stderr_tail, LogSource::Stderr, &mut records)
                    .await?;
                if let Some(rest) = stdout_tail.take_remainder() {
                    self.forward(LogSource::Stdout, rest);
                }
                if let Some(rest) = stderr_tail.take_remainder() {
                    self.forward(LogSource::Stderr, rest);
                }
                return Ok(());
            }

            if !got_data {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    async fn drain(
        &self,
        tail: &mut LogTailer,
        source: LogSource,
        records: &mut Vec<String>,
    ) -> io::Result<bool> {
        records.clear();
        let read_any = tail.poll_records(records).await?;
        for line in records.drain(..) {
            self.forward(source, line);
        }
        Ok(read_any)
    }

    fn forward(&self, source: LogSource, line: String) {
        match source {
            LogSource::Stdout => self.scanner.scan_stdout(&line),
            LogSource::Stderr => self.scanner.scan_stderr(&line),
        }
        // The GUI side may be gone; losing lines then is fine.
        let _ = self.log_tx.send(LogLine::new(source, line));
    }

    async fn remove_mirror_files(&self) {
        for path in [&self.stdout_path, &self.stderr_path] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!(path = %path.display(), error = %e, "Failed to remove mirror file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn scanner_with(errors: &[&str], successes: &[&str]) -> (MarkerScanner, Arc<RunnerFlags>) {
        let flags = Arc::new(RunnerFlags::new());
        let scanner = MarkerScanner::new(
            flags.clone(),
            errors.iter().map(|s| s.to_string()).collect(),
            successes.iter().map(|s| s.to_string()).collect(),
        );
        (scanner, flags)
    }

    #[test]
    fn test_success_marker_is_sticky() {
        let (scanner, flags) = scanner_with(&[], &["Done converting"]);

        scanner.scan_stdout("frame= 100 fps= 25");
        assert!(!flags.success_detected());

        scanner.scan_stdout("Done converting file");
        assert!(flags.success_detected());

        for _ in 0..50 {
            scanner.scan_stdout("unrelated output");
        }
        assert!(flags.success_detected());
    }

    #[test]
    fn test_error_marker_is_sticky() {
        let (scanner, flags) = scanner_with(&["No space left"], &[]);

        scanner.scan_stderr("No space left on device");
        assert!(flags.error_detected());

        for _ in 0..50 {
            scanner.scan_stderr("harmless warning");
        }
        assert!(flags.error_detected());
    }

    #[test]
    fn test_fixed_literal_overrides_empty_marker_list() {
        let (scanner, flags) = scanner_with(&[], &[]);

        scanner.scan_stderr("something something Conversion failed! giving up");
        assert!(flags.error_detected());
    }

    #[rstest]
    #[case("Conversion failed!", true)]
    #[case("[libx265] Conversion failed! (code 1)", true)]
    #[case("conversion failed!", false)]
    #[case("Conversion failed", false)]
    fn test_fixed_literal_is_exact_substring(#[case] line: &str, #[case] detected: bool) {
        let (scanner, flags) = scanner_with(&[], &[]);
        scanner.scan_stderr(line);
        assert_eq!(flags.error_detected(), detected);
    }

    #[test]
    fn test_success_markers_only_apply_to_stdout() {
        let (scanner, flags) = scanner_with(&[], &["encoded OK"]);

        scanner.scan_stderr("encoded OK");
        assert!(!flags.success_detected());

        scanner.scan_stdout("encoded OK");
        assert!(flags.success_detected());
    }

    #[test]
    fn test_error_markers_only_apply_to_stderr() {
        let (scanner, flags) = scanner_with(&["failed"], &[]);

        scanner.scan_stdout("failed");
        assert!(!flags.error_detected());

        scanner.scan_stderr("failed");
        assert!(flags.error_detected());
    }

    #[tokio::test]
    async fn test_tailer_splits_on_cr_and_lf() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        tokio::fs::write(&path, b"one\rtwo\nthree\r\nfour\n").await.unwrap();

        let mut tail = LogTailer::open(&path).await.unwrap();
        let mut records = Vec::new();
        tail.poll_records(&mut records).await.unwrap();

        assert_eq!(records, vec!["one", "two", "three", "four"]);
        assert!(tail.take_remainder().is_none());
    }

    #[tokio::test]
    async fn test_tailer_sees_appended_data_and_remainder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let mut writer = tokio::fs::File::create(&path).await.unwrap();
        writer.write_all(b"first\nsec").await.unwrap();
        writer.flush().await.unwrap();

        let mut tail = LogTailer::open(&path).await.unwrap();
        let mut records = Vec::new();
        tail.poll_records(&mut records).await.unwrap();
        assert_eq!(records, vec!["first"]);

        writer.write_all(b"ond\n").await.unwrap();
        writer.flush().await.unwrap();

        records.clear();
        tail.poll_records(&mut records).await.unwrap();
        assert_eq!(records, vec!["second"]);

        writer.write_all(b"tail without newline").await.unwrap();
        writer.flush().await.unwrap();

        records.clear();
        tail.poll_records(&mut records).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(tail.take_remainder().as_deref(), Some("tail without newline"));
    }

    #[tokio::test]
    async fn test_reader_forwards_every_line_once_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let stdout_path = dir.path().join("encoder_output_test.log");
        let stderr_path = dir.path().join("encoder_error_test.log");

        let mut out_file = tokio::fs::File::create(&stdout_path).await.unwrap();
        tokio::fs::File::create(&stderr_path).await.unwrap();

        let alive = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (scanner, _flags) = scanner_with(&[], &[]);

        let reader = OutputStreamReader::new(
            stdout_path.clone(),
            stderr_path.clone(),
            scanner,
            alive.clone(),
            tx,
            Duration::from_millis(10),
        );
        let task = tokio::spawn(reader.run());

        for i in 0..100 {
            out_file
                .write_all(format!("line {}\n", i).as_bytes())
                .await
                .unwrap();
        }
        // Last line lands without a trailing newline, right before "exit".
        out_file.write_all(b"final line").await.unwrap();
        out_file.flush().await.unwrap();
        drop(out_file);

        alive.store(false, Ordering::SeqCst);
        task.await.unwrap();

        let mut seen = Vec::new();
        while let Ok(line) = rx.try_recv() {
            assert_eq!(line.source, LogSource::Stdout);
            seen.push(line.content);
        }

        let mut expected: Vec<String> = (0..100).map(|i| format!("line {}", i)).collect();
        expected.push("final line".to_string());
        assert_eq!(seen, expected);

        assert!(!stdout_path.exists());
        assert!(!stderr_path.exists());
    }

    #[tokio::test]
    async fn test_reader_sets_flags_from_both_streams() {
        let dir = TempDir::new().unwrap();
        let stdout_path = dir.path().join("out.log");
        let stderr_path = dir.path().join("err.log");
        tokio::fs::write(&stdout_path, b"all good: finished\n").await.unwrap();
        tokio::fs::write(&stderr_path, b"warning\nConversion failed!\n")
            .await
            .unwrap();

        let alive = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (scanner, flags) = scanner_with(&[], &["finished"]);

        OutputStreamReader::new(
            stdout_path,
            stderr_path,
            scanner,
            alive,
            tx,
            Duration::from_millis(10),
        )
        .run()
        .await;

        assert!(flags.success_detected());
        assert!(flags.error_detected());

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
