//! Per-process stdout streams.
//!
//! Each connection starts with a line-oriented header declaring the
//! identifier, the owning unit, a default priority, whether lines carry
//! `<N>` level prefixes, and the forwarding targets. After the header,
//! every newline-terminated chunk becomes one record. Overlong lines are
//! cut at the configured maximum and continue as a fresh line; EOF
//! flushes a trailing partial line and tears the stream down.

use crate::record::{ParsedRecord, Transport};
use journal_common::Priority;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use tracing::debug;

/// Header lines arrive in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Identifier,
    Unit,
    Priority,
    LevelPrefix,
    ForwardToSyslog,
    ForwardToKmsg,
    ForwardToConsole,
    Running,
}

pub struct StdoutStream {
    fd: OwnedFd,
    state: StreamState,
    buffer: Vec<u8>,
    line_max: usize,

    identifier: Option<String>,
    unit: Option<String>,
    priority: Priority,
    level_prefix: bool,
    forward_to_syslog: bool,
    forward_to_kmsg: bool,
    forward_to_console: bool,
}

impl StdoutStream {
    pub fn new(fd: OwnedFd, line_max: usize) -> Self {
        Self {
            fd,
            state: StreamState::Identifier,
            buffer: Vec::new(),
            line_max,
            identifier: None,
            unit: None,
            priority: Priority::Info,
            level_prefix: false,
            forward_to_syslog: false,
            forward_to_kmsg: false,
            forward_to_console: false,
        }
    }

    /// Adopt an inherited descriptor whose header was consumed by a
    /// previous daemon instance; the stream continues with defaults.
    pub fn restore(fd: OwnedFd, line_max: usize) -> Self {
        let mut stream = Self::new(fd, line_max);
        stream.state = StreamState::Running;
        stream.identifier = Some(String::from("restored"));
        stream
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn forwards(&self) -> (bool, bool, bool) {
        (
            self.forward_to_syslog,
            self.forward_to_kmsg,
            self.forward_to_console,
        )
    }

    /// Feed bytes read from the socket; returns the records completed by
    /// this chunk. Empty input means EOF: a trailing partial line is
    /// flushed.
    pub fn feed(&mut self, data: &[u8]) -> Vec<ParsedRecord> {
        let mut records = Vec::new();

        if data.is_empty() {
            if self.state == StreamState::Running && !self.buffer.is_empty() {
                let line = std::mem::take(&mut self.buffer);
                if let Some(record) = self.record_for_line(&line) {
                    records.push(record);
                }
            }
            return records;
        }

        self.buffer.extend_from_slice(data);

        loop {
            let split = self.buffer.iter().position(|&b| b == b'\n');

            let line = match split {
                Some(position) => {
                    let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
                    line.pop();
                    line
                }
                None if self.state == StreamState::Running
                    && self.buffer.len() >= self.line_max =>
                {
                    // Overlong line: cut it here, the rest continues as
                    // a fresh line.
                    self.buffer.drain(..self.line_max).collect()
                }
                None => break,
            };

            match self.state {
                StreamState::Running => {
                    if let Some(record) = self.record_for_line(&line) {
                        records.push(record);
                    }
                }
                _ => self.apply_header_line(&line),
            }
        }

        records
    }

    fn apply_header_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();

        match self.state {
            StreamState::Identifier => {
                if !text.is_empty() {
                    self.identifier = Some(text.to_string());
                }
                self.state = StreamState::Unit;
            }
            StreamState::Unit => {
                if !text.is_empty() {
                    self.unit = Some(text.to_string());
                }
                self.state = StreamState::Priority;
            }
            StreamState::Priority => {
                match text.parse::<u8>().ok().and_then(Priority::from_value) {
                    Some(priority) => self.priority = priority,
                    None => debug!(line = text, "invalid stream priority, keeping default"),
                }
                self.state = StreamState::LevelPrefix;
            }
            StreamState::LevelPrefix => {
                self.level_prefix = text == "1";
                self.state = StreamState::ForwardToSyslog;
            }
            StreamState::ForwardToSyslog => {
                self.forward_to_syslog = text == "1";
                self.state = StreamState::ForwardToKmsg;
            }
            StreamState::ForwardToKmsg => {
                self.forward_to_kmsg = text == "1";
                self.state = StreamState::ForwardToConsole;
            }
            StreamState::ForwardToConsole => {
                self.forward_to_console = text == "1";
                self.state = StreamState::Running;
            }
            StreamState::Running => unreachable!(),
        }
    }

    fn record_for_line(&self, line: &[u8]) -> Option<ParsedRecord> {
        let mut line = line;
        let mut priority = self.priority;

        if self.level_prefix && line.len() >= 3 && line[0] == b'<' && line[2] == b'>' {
            if let Some(parsed) = Priority::from_level_char(line[1]) {
                priority = parsed;
                line = &line[3..];
            }
        }

        if line.is_empty() {
            return None;
        }

        let mut record = ParsedRecord::new(Transport::Stdout);
        record.priority = priority;
        record.identifier = self.identifier.clone();
        record.push(b"MESSAGE", line);
        record.push(b"PRIORITY", priority.value().to_string());
        if let Some(identifier) = &self.identifier {
            record.push(b"SYSLOG_IDENTIFIER", identifier.as_bytes());
        }

        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_fd() -> OwnedFd {
        let (read, _write) = nix::unistd::pipe().unwrap();
        read
    }

    fn header() -> &'static [u8] {
        b"myapp\nfoo.service\n5\n1\n0\n0\n0\n"
    }

    #[test]
    fn header_then_lines() {
        let mut stream = StdoutStream::new(pipe_fd(), 1024);

        let records = stream.feed(header());
        assert!(records.is_empty());
        assert_eq!(stream.identifier(), Some("myapp"));
        assert_eq!(stream.unit(), Some("foo.service"));

        let records = stream.feed(b"hello world\n<3>on fire\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].priority, Priority::Notice);
        assert_eq!(records[0].first_value(b"MESSAGE"), Some(b"hello world".as_slice()));
        // The level prefix overrides the header priority.
        assert_eq!(records[1].priority, Priority::Error);
        assert_eq!(records[1].first_value(b"MESSAGE"), Some(b"on fire".as_slice()));
    }

    #[test]
    fn partial_lines_accumulate() {
        let mut stream = StdoutStream::new(pipe_fd(), 1024);
        stream.feed(header());

        assert!(stream.feed(b"part one, ").is_empty());
        let records = stream.feed(b"part two\n");
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].first_value(b"MESSAGE"),
            Some(b"part one, part two".as_slice())
        );
    }

    #[test]
    fn eof_flushes_partial_line() {
        let mut stream = StdoutStream::new(pipe_fd(), 1024);
        stream.feed(header());
        stream.feed(b"unterminated");

        let records = stream.feed(b"");
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].first_value(b"MESSAGE"),
            Some(b"unterminated".as_slice())
        );
    }

    #[test]
    fn overlong_lines_are_split() {
        let mut stream = StdoutStream::new(pipe_fd(), 16);
        stream.feed(header());

        let records = stream.feed(&[b'x'; 40]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].first_value(b"MESSAGE"), Some([b'x'; 16].as_slice()));

        let records = stream.feed(b"\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].first_value(b"MESSAGE"), Some([b'x'; 8].as_slice()));
    }

    #[test]
    fn restored_stream_skips_header() {
        let mut stream = StdoutStream::restore(pipe_fd(), 1024);
        let records = stream.feed(b"first line after restart\n");
        assert_eq!(records.len(), 1);
    }
}
