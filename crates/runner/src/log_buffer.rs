use chrono::{DateTime, TimeZone};
use std::collections::VecDeque;

/// The newest `capacity` lines of a worker's output.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Fills `{username}`, `{pid}` and `{datetime}` in a log file template.
pub fn render_log_path<Tz: TimeZone>(
    template: &str,
    username: &str,
    pid: u32,
    at: &DateTime<Tz>,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    template
        .replace("{username}", username)
        .replace("{pid}", &pid.to_string())
        .replace("{datetime}", &at.format("%Y%m%d.%-I_%M_%S").to_string())
}
