//! Bounded in-memory log ring with callback fan-out.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::LogCallback;

pub const DEFAULT_CAPACITY: usize = 1000;

/// FIFO of already-prefixed log lines, capped at `capacity`; the oldest lines
/// are dropped first on overflow. Registered callbacks see every appended
/// line. Callbacks are dispatched on a snapshot copy outside the line lock so
/// a callback may itself append to another buffer.
pub struct LogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
    callbacks: Mutex<Vec<LogCallback>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn append(&self, line: &str) {
        {
            let mut lines = self.lines.lock().unwrap();
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.to_string());
        }

        let callbacks = self.callbacks.lock().unwrap().clone();
        for cb in callbacks {
            cb(line);
        }
    }

    pub fn subscribe(&self, callback: LogCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Replay everything buffered so far into `callback`, then register it
    /// for future lines.
    pub fn replay_and_subscribe(&self, callback: LogCallback) {
        {
            let lines = self.lines.lock().unwrap();
            for line in lines.iter() {
                callback(line);
            }
        }
        self.subscribe(callback);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
