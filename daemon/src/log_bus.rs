/// Fan-out of server stdout lines to in-process subscribers.
///
/// There is no queue and no history: a line is delivered synchronously to
/// whoever is subscribed at the moment it is published, and then forgotten.
use std::sync::Arc;

use crate::subscription::{Subscribers, Subscription};

pub type LineCallback = dyn Fn(&str) + Send + Sync;

#[derive(Clone, Default)]
pub struct LogBus {
    subscribers: Subscribers<LineCallback>,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `line` to every subscriber in subscription order.
    pub fn publish(&self, line: &str) {
        self.subscribers.emit(|callback| callback(line));
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribers.add(Arc::new(callback))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Reassembles complete lines from arbitrarily split stdout reads.
///
/// Works on bytes so a multi-byte UTF-8 sequence split across two reads is
/// decoded intact.  Trailing `\r` is stripped from every line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends `chunk` and returns every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Returns the unterminated remainder, if any.  Called once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
