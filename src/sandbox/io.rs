//! Capture of guest console output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// One bounded, line-oriented console stream. Clones share the buffer.
#[derive(Clone, Debug)]
pub struct CapturedOutput {
    lines: Arc<Mutex<String>>,
    truncated: Arc<AtomicBool>,
    limit: usize,
}

impl CapturedOutput {
    /// A stream keeping at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(String::new())),
            truncated: Arc::new(AtomicBool::new(false)),
            limit,
        }
    }

    /// Everything captured so far, newline-terminated lines.
    pub fn to_string_lossy(&self) -> String {
        self.lines.lock().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().lines().map(str::to_string).collect()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
        self.truncated.store(false, Ordering::Release);
    }

    /// Bytes captured.
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether output was dropped because the limit was reached.
    pub fn is_truncated(&self) -> bool {
        self.truncated.load(Ordering::Acquire)
    }

    /// Append one line, dropping whatever exceeds the limit.
    pub fn push_line(&self, line: &str) {
        let mut lines = self.lines.lock();
        let room = self.limit.saturating_sub(lines.len());
        if line.len() < room {
            lines.push_str(line);
            lines.push('\n');
            return;
        }
        let mut cut = room;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        lines.push_str(&line[..cut]);
        self.truncated.store(true, Ordering::Release);
    }
}

impl Default for CapturedOutput {
    fn default() -> Self {
        Self::with_limit(ConsoleOutput::DEFAULT_LIMIT)
    }
}

/// The two guest console streams of one runtime.
#[derive(Clone, Debug, Default)]
pub struct ConsoleOutput {
    /// `console.log`, `info`, `debug` and `trace`.
    pub stdout: CapturedOutput,
    /// `console.warn` and `console.error`.
    pub stderr: CapturedOutput,
}

impl ConsoleOutput {
    /// Per-stream capture limit.
    pub const DEFAULT_LIMIT: usize = 1024 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_str(&self) -> String {
        self.stdout.to_string_lossy()
    }

    pub fn stderr_str(&self) -> String {
        self.stderr.to_string_lossy()
    }
}
