//! Redacted SMTP protocol trace
//!
//! Every relayed conversation is appended to a per-day file
//! (`smtp-YYYYMMDD.log`) in the log directory:
//!
//! ```text
//! [14:03:11] CONNECT smtp://smtp.example.com:587
//! S: 220 smtp.example.com ESMTP
//! C: EHLO relay.local
//! ...
//! C: AUTH PLAIN
//! S: 235 2.7.0 Authentication successful
//! C: DATA
//! S: 354 Start mail input
//! C: <DATA END>
//! S: 250 2.0.0 OK
//! ----------------------------------------
//! ```
//!
//! Message bodies and credentials never reach the file. A session buffers its
//! lines and appends them as one block under the log's write lock, so
//! concurrent conversations do not interleave. Long-lived sessions write a
//! block at every checkpoint (the end of an inbound transaction) and whenever
//! [`MAX_BUFFERED_LINES`] lines are pending.

use chrono::{Local, NaiveDate};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Written after each conversation
pub const CONVERSATION_DELIMITER: &str = "----------------------------------------";

/// Replaces the `.` terminator of a DATA section
pub const DATA_END_MARKER: &str = "<DATA END>";

/// Replaces client lines sent during an AUTH exchange
pub const AUTH_REDACTED_MARKER: &str = "<AUTH DATA SUPPRESSED>";

/// Pending lines that force a session to write its block
pub const MAX_BUFFERED_LINES: usize = 256;

/// Receives the raw lines of an SMTP dialogue
pub trait ProtocolObserver: Send {
    fn connect(&mut self, target: &str);
    fn client_line(&mut self, line: &[u8]);
    fn server_line(&mut self, line: &[u8]);

    /// A unit of work ended; buffered lines may be written out
    fn checkpoint(&mut self) {}
}

/// Observer used when tracing is disabled
#[derive(Debug, Default)]
pub struct NullObserver;

impl ProtocolObserver for NullObserver {
    fn connect(&mut self, _target: &str) {}
    fn client_line(&mut self, _line: &[u8]) {}
    fn server_line(&mut self, _line: &[u8]) {}
}

/// Shared handle on the trace directory
#[derive(Debug)]
pub struct TraceLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl TraceLog {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name_for(date: NaiveDate) -> String {
        format!("smtp-{}.log", date.format("%Y%m%d"))
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(Self::file_name_for(date))
    }

    /// Start a conversation bound to today's file
    pub fn session(self: &Arc<Self>) -> TraceSession {
        let path = self.path_for(Local::now().date_naive());
        TraceSession::new(Arc::clone(self), path)
    }

    /// Append `block` to `path` while holding the write lock
    fn append(&self, path: &Path, block: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(block.as_bytes())?;
        file.flush()
    }
}

/// Transcript of a single conversation
///
/// Dropping the session flushes it, so the transcript is written on every
/// exit path of a relay.
pub struct TraceSession {
    log: Arc<TraceLog>,
    path: PathBuf,
    lines: Vec<String>,
    in_data: bool,
    in_auth: bool,
    written: bool,
    closed: bool,
}

impl TraceSession {
    fn new(log: Arc<TraceLog>, path: PathBuf) -> Self {
        Self {
            log,
            path,
            lines: Vec::new(),
            in_data: false,
            in_auth: false,
            written: false,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines recorded so far and not yet written
    pub fn pending_lines(&self) -> &[String] {
        &self.lines
    }

    /// Append the transcript and the delimiter to the day's file
    ///
    /// Write failures are logged and swallowed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // everything up to the last checkpoint is already on disk
        if self.lines.is_empty() && self.written {
            return;
        }
        self.write_block();
    }

    /// Append the pending lines and a delimiter, keeping the session open
    fn write_block(&mut self) {
        self.lines.push(CONVERSATION_DELIMITER.to_string());
        let mut block = self.lines.join("\n");
        block.push('\n');
        self.lines.clear();
        self.written = true;

        match self.log.append(&self.path, &block) {
            Ok(()) => debug!("Protocol trace appended to {}", self.path.display()),
            Err(e) => warn!("Failed to write protocol trace {}: {}", self.path.display(), e),
        }
    }

    fn push(&mut self, line: String) {
        self.lines.push(line);
        if self.lines.len() >= MAX_BUFFERED_LINES {
            self.write_block();
        }
    }

    fn record_client(&mut self, line: &str) {
        if self.in_data {
            if line == "." {
                self.in_data = false;
                self.push(format!("C: {}", DATA_END_MARKER));
            }
            return;
        }

        if self.in_auth {
            self.push(format!("C: {}", AUTH_REDACTED_MARKER));
            return;
        }

        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or("");

        if verb.eq_ignore_ascii_case("AUTH") {
            // keep the mechanism, never the initial response
            self.in_auth = true;
            match words.next() {
                Some(mechanism) => {
                    self.push(format!("C: AUTH {}", mechanism.to_ascii_uppercase()))
                }
                None => self.push("C: AUTH".to_string()),
            }
            return;
        }

        self.push(format!("C: {}", line));
        if line.trim().eq_ignore_ascii_case("DATA") {
            self.in_data = true;
        }
    }

    fn record_server(&mut self, line: &str) {
        self.push(format!("S: {}", line));

        let continues = line.starts_with("334");
        if self.in_auth && !continues {
            self.in_auth = false;
        }
        // DATA refused: no payload follows
        if self.in_data && !line.starts_with("354") {
            self.in_data = false;
        }
    }
}

impl ProtocolObserver for TraceSession {
    fn connect(&mut self, target: &str) {
        self.push(format!(
            "[{}] CONNECT {}",
            Local::now().format("%H:%M:%S"),
            target
        ));
    }

    fn client_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        for line in split_lines(&text) {
            self.record_client(line);
        }
    }

    fn server_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        for line in split_lines(&text) {
            self.record_server(line);
        }
    }

    fn checkpoint(&mut self) {
        if !self.lines.is_empty() {
            self.write_block();
        }
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    let text = text.strip_suffix('\n').unwrap_or(text);
    text.split('\n').map(|l| l.trim_end_matches('\r'))
}
