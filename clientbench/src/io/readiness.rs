//! Readiness detection by polling the client log for a marker line.

use std::fs::{File, Metadata};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, instrument, trace, warn};

use crate::error::BenchError;

/// Longest partial line held back waiting for its newline. Past this the bytes
/// are handed out as a line of their own.
pub const MAX_PENDING_LINE: usize = 64 * 1024;

/// Identity of the file behind a path, to notice it being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
    created: Option<SystemTime>,
}

impl FileId {
    fn of(meta: &Metadata) -> Self {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;
        Self {
            #[cfg(unix)]
            dev: meta.dev(),
            #[cfg(unix)]
            ino: meta.ino(),
            created: meta.created().ok(),
        }
    }
}

/// Read position in a growing log file.
///
/// Each [`LogCursor::read_new_lines`] call returns only complete lines appended
/// since the previous call. A missing file reads as empty. If the file is
/// truncated or replaced by a new one, reading restarts at its beginning.
#[derive(Debug)]
pub struct LogCursor {
    path: PathBuf,
    offset: u64,
    file_id: Option<FileId>,
    pending: Vec<u8>,
}

impl LogCursor {
    /// A cursor at the start of the file: existing lines are returned.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            file_id: None,
            pending: Vec::new(),
        }
    }

    /// A cursor at the current end of the file: only lines written from now
    /// on, or by a file that replaces this one, are returned.
    pub fn at_end(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let mut cursor = Self::new(path);
        match File::open(&cursor.path) {
            Ok(file) => {
                let meta = file.metadata()?;
                cursor.offset = meta.len();
                cursor.file_id = Some(FileId::of(&meta));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        Ok(cursor)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_new_lines(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let meta = file.metadata()?;
        let id = FileId::of(&meta);
        if self.file_id.is_some_and(|seen| seen != id) {
            debug!(path = %self.path.display(), "log replaced, reading the new file from start");
            self.restart();
        } else if meta.len() < self.offset {
            debug!(path = %self.path.display(), "log shrank, rereading from start");
            self.restart();
        }
        self.file_id = Some(id);

        file.seek(SeekFrom::Start(self.offset))?;
        let mut appended = Vec::new();
        let read = file.read_to_end(&mut appended)?;
        self.offset += read as u64;
        self.pending.extend_from_slice(&appended);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw));
        }
        if self.pending.len() > MAX_PENDING_LINE {
            warn!(
                path = %self.path.display(),
                bytes = self.pending.len(),
                "log line too long, searching it unterminated"
            );
            let raw = std::mem::take(&mut self.pending);
            lines.push(decode_line(&raw));
        }
        Ok(lines)
    }

    fn restart(&mut self) {
        self.offset = 0;
        self.pending.clear();
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// Poll `log_path` until a line contains `marker`, scanning the whole file.
///
/// The timeout is measured from the call's start. A log that does not exist yet
/// is polled until it appears, within the same timeout. Lines already in the
/// log count; use [`wait_with_cursor`] with [`LogCursor::at_end`] to only
/// accept lines written after a given point.
pub fn wait_for_marker(
    log_path: &Path,
    marker: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), BenchError> {
    let mut cursor = LogCursor::new(log_path);
    wait_with_cursor(&mut cursor, marker, poll_interval, timeout)
}

/// [`wait_for_marker`] with a caller-owned cursor.
#[instrument(skip_all, fields(log = %cursor.path().display(), marker = %marker, timeout_secs = timeout.as_secs()))]
pub fn wait_with_cursor(
    cursor: &mut LogCursor,
    marker: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), BenchError> {
    let deadline = Instant::now() + timeout;
    loop {
        debug!("looking for client ready log line");
        let lines = cursor
            .read_new_lines()
            .map_err(|e| BenchError::io("read log", cursor.path(), e))?;
        if lines.iter().any(|line| line.contains(marker)) {
            debug!(offset = cursor.offset(), "client ready");
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(BenchError::ReadinessTimeout {
                marker: marker.to_string(),
                log_path: cursor.path().to_path_buf(),
                timeout,
            });
        }
        trace!(scanned = lines.len(), "marker not seen yet");
        thread::sleep(poll_interval.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{self, OpenOptions};
    use std::io::Write;

    use super::*;

    const MARKER: &str = "textures/atlas/mob_effects.png-atlas";

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open log");
        file.write_all(text.as_bytes()).expect("append");
    }

    #[test]
    fn cursor_returns_only_new_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        append(&log, "one\ntwo\n");

        let mut cursor = LogCursor::new(&log);
        assert_eq!(cursor.read_new_lines().expect("read"), vec!["one", "two"]);
        assert!(cursor.read_new_lines().expect("read").is_empty());

        append(&log, "three\r\n");
        assert_eq!(cursor.read_new_lines().expect("read"), vec!["three"]);
    }

    #[test]
    fn cursor_holds_back_partial_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        append(&log, "Created: 1024x512x4 textures/atlas/mob_");

        let mut cursor = LogCursor::new(&log);
        assert!(cursor.read_new_lines().expect("read").is_empty());

        append(&log, "effects.png-atlas\n");
        assert_eq!(
            cursor.read_new_lines().expect("read"),
            vec!["Created: 1024x512x4 textures/atlas/mob_effects.png-atlas"]
        );
    }

    #[test]
    fn cursor_restarts_after_truncation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        append(&log, "old session line that is long\n");

        let mut cursor = LogCursor::new(&log);
        cursor.read_new_lines().expect("read");

        fs::write(&log, "new\n").expect("truncate");
        assert_eq!(cursor.read_new_lines().expect("read"), vec!["new"]);
    }

    #[test]
    fn missing_log_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cursor = LogCursor::new(temp.path().join("absent.log"));
        assert!(cursor.read_new_lines().expect("read").is_empty());
        assert_eq!(cursor.offset(), 0);
    }

    #[test]
    fn returns_immediately_when_marker_present() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        append(&log, &format!("[main/INFO]: Created: {MARKER}\n"));

        let start = Instant::now();
        wait_for_marker(&log, MARKER, Duration::from_secs(5), Duration::from_secs(10))
            .expect("ready");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn marker_is_case_sensitive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        append(&log, &format!("{}\n", MARKER.to_uppercase()));

        let err = wait_for_marker(
            &log,
            MARKER,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert!(matches!(err, BenchError::ReadinessTimeout { .. }));
    }

    #[test]
    fn detects_marker_appended_later_within_one_interval() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        append(&log, "[main/INFO]: Loading\n");

        let writer_log = log.clone();
        let written_at = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            let at = Instant::now();
            append(&writer_log, &format!("[Render thread/INFO]: {MARKER}\n"));
            at
        });

        let poll = Duration::from_millis(100);
        let start = Instant::now();
        wait_for_marker(&log, MARKER, poll, Duration::from_secs(10)).expect("ready");
        let returned_at = Instant::now();
        let written_at = written_at.join().expect("writer");

        assert!(returned_at >= written_at);
        assert!(returned_at - written_at <= poll + Duration::from_millis(250));
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn waits_for_log_to_be_created() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("logs").join("latest.log");

        let writer_log = log.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            fs::create_dir_all(writer_log.parent().expect("parent")).expect("mkdir");
            append(&writer_log, &format!("{MARKER}\n"));
        });

        wait_for_marker(
            &log,
            MARKER,
            Duration::from_millis(50),
            Duration::from_secs(10),
        )
        .expect("ready after creation");
        writer.join().expect("writer");
    }

    #[test]
    fn times_out_when_marker_never_appears() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        append(&log, "[main/INFO]: Loading\n");

        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        let err = wait_for_marker(&log, MARKER, Duration::from_millis(50), timeout).unwrap_err();

        assert!(start.elapsed() >= timeout);
        match err {
            BenchError::ReadinessTimeout { marker, .. } => assert_eq!(marker, MARKER),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cursor_at_end_skips_existing_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        append(&log, &format!("[Render thread/INFO]: Created: {MARKER}\n"));

        let mut cursor = LogCursor::at_end(&log).expect("cursor");
        assert!(cursor.read_new_lines().expect("read").is_empty());

        append(&log, "[main/INFO]: Loading\n");
        assert_eq!(cursor.read_new_lines().expect("read"), vec!["[main/INFO]: Loading"]);
    }

    #[test]
    fn cursor_at_end_of_missing_log_reads_it_from_start() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");

        let mut cursor = LogCursor::at_end(&log).expect("cursor");
        assert_eq!(cursor.offset(), 0);
        append(&log, "first\n");
        assert_eq!(cursor.read_new_lines().expect("read"), vec!["first"]);
    }

    #[test]
    fn cursor_rereads_a_replaced_log_longer_than_the_old_one() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        append(&log, "short\n");

        let mut cursor = LogCursor::at_end(&log).expect("cursor");
        fs::rename(&log, temp.path().join("2026-10-18-1.log")).expect("rotate");
        append(&log, "[main/INFO]: a new session that is longer\nsecond\n");

        assert_eq!(
            cursor.read_new_lines().expect("read"),
            vec!["[main/INFO]: a new session that is longer", "second"]
        );
    }

    #[test]
    fn overlong_partial_line_is_flushed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        let long = format!("{}{MARKER}", "x".repeat(MAX_PENDING_LINE));
        append(&log, &long);

        let mut cursor = LogCursor::new(&log);
        let lines = cursor.read_new_lines().expect("read");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(MARKER));
        assert!(cursor.pending.is_empty());

        append(&log, "next\n");
        assert_eq!(cursor.read_new_lines().expect("read"), vec!["next"]);
    }

    #[test]
    fn previous_session_marker_is_not_taken_as_ready() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        append(&log, "[main/INFO]: Loading\n");
        append(&log, &format!("[Render thread/INFO]: Created: {MARKER}\n"));

        let mut cursor = LogCursor::at_end(&log).expect("cursor");
        let writer_log = log.clone();
        let rotated = temp.path().join("2026-10-18-1.log");
        let written_at = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            fs::rename(&writer_log, &rotated).expect("rotate");
            append(&writer_log, "[main/INFO]: Loading\n");
            thread::sleep(Duration::from_millis(300));
            let at = Instant::now();
            append(&writer_log, &format!("[Render thread/INFO]: Created: {MARKER}\n"));
            at
        });

        wait_with_cursor(
            &mut cursor,
            MARKER,
            Duration::from_millis(20),
            Duration::from_secs(10),
        )
        .expect("ready");
        let returned_at = Instant::now();
        let written_at = written_at.join().expect("writer");

        assert!(returned_at >= written_at);
    }

    #[test]
    fn stale_marker_alone_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("latest.log");
        append(&log, &format!("[Render thread/INFO]: Created: {MARKER}\n"));

        let mut cursor = LogCursor::at_end(&log).expect("cursor");
        let err = wait_with_cursor(
            &mut cursor,
            MARKER,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert!(matches!(err, BenchError::ReadinessTimeout { .. }));
    }
}
