//! Incremental classifier for the separation process's stdout.

pub const PROGRESS_PREFIX: &str = "PROGRESS:";
pub const ERROR_PREFIX: &str = "ERROR:";
pub const COMPLETE_MARKER: &str = "SEPARATION_COMPLETE";
pub const READY_MARKER: &str = "READY";

/// Progress the completion marker pins to; the rest is reserved for output verification.
pub const COMPLETE_PROGRESS: u8 = 95;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Progress(u8),
    /// Live-mode process has created its pipes and is ready to be read.
    Ready,
    /// `ERROR:` line. Informational; the exit code decides the job outcome.
    Error(String),
    /// Anything else. Logged, never surfaced.
    Diagnostic(String),
}

#[derive(Debug, Default)]
pub struct ProgressStreamParser {
    buffer: Vec<u8>,
    last_progress: u8,
    saw_complete: bool,
}

impl ProgressStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already-reported progress value.
    pub fn with_progress(last_progress: u8) -> Self {
        Self {
            last_progress,
            ..Self::default()
        }
    }

    pub fn last_progress(&self) -> u8 {
        self.last_progress
    }

    pub fn saw_complete_marker(&self) -> bool {
        self.saw_complete
    }

    /// Append raw bytes and classify every complete line now buffered.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]);
            if let Some(ev) = self.classify(text.trim()) {
                events.push(ev);
            }
        }
        events
    }

    /// Final flush: whatever is left without a terminating newline becomes a diagnostic.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        String::from_utf8_lossy(&rest)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| StreamEvent::Diagnostic(l.to_string()))
            .collect()
    }

    /// Advance to `value` if that moves progress forward. Used for the job's own
    /// milestones so that every reported value shares one monotonic counter.
    pub fn advance_to(&mut self, value: u8) -> Option<u8> {
        let value = value.min(100);
        if value > self.last_progress {
            self.last_progress = value;
            Some(value)
        } else {
            None
        }
    }

    /// Synthetic one-unit bump while progress is still below 10, capped at `cap`.
    pub fn heartbeat(&mut self, cap: u8) -> Option<u8> {
        if self.last_progress >= 10 {
            return None;
        }
        self.advance_to(self.last_progress.saturating_add(1).min(cap))
    }

    fn classify(&mut self, line: &str) -> Option<StreamEvent> {
        if line.is_empty() {
            return None;
        }
        if let Some(raw) = line.strip_prefix(PROGRESS_PREFIX) {
            let value = raw.trim().parse::<i64>().ok()?;
            if !(0..=100).contains(&value) {
                return None;
            }
            return self.advance_to(value as u8).map(StreamEvent::Progress);
        }
        if line == COMPLETE_MARKER {
            self.saw_complete = true;
            return self.advance_to(COMPLETE_PROGRESS).map(StreamEvent::Progress);
        }
        if line == READY_MARKER {
            return Some(StreamEvent::Ready);
        }
        if let Some(msg) = line.strip_prefix(ERROR_PREFIX) {
            return Some(StreamEvent::Error(msg.trim().to_string()));
        }
        Some(StreamEvent::Diagnostic(line.to_string()))
    }
}
