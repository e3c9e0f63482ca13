use std::collections::VecDeque;

use hycon_core::{ConsoleLine, ConsoleSource};

pub const MAX_CONSOLE_LINES: usize = 1000;

/// Bounded, sequence-numbered console scrollback for one instance.
///
/// Only the console monitor appends; viewers read by cursor so a reconnect
/// resumes where it left off instead of replaying the whole buffer.
#[derive(Debug)]
pub struct ConsoleBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<ConsoleLine>,
}

impl ConsoleBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines,
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, source: ConsoleSource, text: String) -> ConsoleLine {
        let line = ConsoleLine {
            seq: self.next_seq,
            source,
            text,
        };
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back(line.clone());
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
        line
    }

    /// Lines with `seq > cursor`, capped at `limit`. A zero cursor returns
    /// the most recent `limit` lines (new-viewer join).
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<ConsoleLine>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let out: Vec<ConsoleLine> = self.lines.iter().skip(start).cloned().collect();
            let last = out.last().map(|l| l.seq).unwrap_or(0);
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for line in &self.lines {
            if line.seq > cursor {
                last = line.seq;
                out.push(line.clone());
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
