//! Bounded in-memory capture of child process output

use std::collections::VecDeque;

/// Stream a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn tag(self) -> &'static str {
        match self {
            Stream::Stdout => "LOG",
            Stream::Stderr => "ERR",
        }
    }
}

/// Per-resource output buffer holding the most recent `limit` bytes.
///
/// Each line is stored as `\n[LOG][<epoch ms>] text` or `\n[ERR][<epoch ms>] text`.
#[derive(Debug)]
pub struct CaptureBuffer {
    text: String,
    limit: usize,
    dirty: bool,
}

impl CaptureBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            dirty: false,
        }
    }

    /// Seed the buffer with previously flushed output
    pub fn with_contents(limit: usize, existing: &str) -> Self {
        let mut buffer = Self::new(limit);
        buffer.text.push_str(existing);
        buffer.trim();
        buffer
    }

    pub fn push(&mut self, stream: Stream, line: &str, now_ms: i64) {
        self.text.push('\n');
        self.text.push('[');
        self.text.push_str(stream.tag());
        self.text.push_str("][");
        self.text.push_str(&now_ms.to_string());
        self.text.push_str("] ");
        self.text.push_str(line.trim_end_matches(['\r', '\n']));
        self.trim();
        self.dirty = true;
    }

    fn trim(&mut self) {
        if self.text.len() <= self.limit {
            return;
        }
        let mut cut = self.text.len() - self.limit;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
    }

    pub fn contents(&self) -> &str {
        &self.text
    }

    /// The contents if anything was appended since the last call
    pub fn take_dirty(&mut self) -> Option<String> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.text.clone())
    }
}

/// Line-bounded buffer keeping the most recent `capacity` lines
#[derive(Debug)]
pub struct LineRing {
    lines: VecDeque<String>,
    capacity: usize,
    dirty: bool,
}

impl LineRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            dirty: false,
        }
    }

    pub fn push(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
        self.dirty = true;
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// The rendered contents if anything was appended since the last call
    pub fn take_dirty(&mut self) -> Option<String> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.render())
    }
}
