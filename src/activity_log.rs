//! Bounded activity log kept by the dev server.
//!
//! Entries live in a fixed-capacity circular buffer; once full, the oldest
//! entry is overwritten. Every pushed entry is mirrored to `tracing`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const ACTIVITY_LOG_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// Which entries to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelFilter {
    #[default]
    All,
    Only(ActivityLevel),
}

impl LevelFilter {
    pub fn accepts(self, level: ActivityLevel) -> bool {
        match self {
            Self::All => true,
            Self::Only(wanted) => wanted == level,
        }
    }

    /// Map the `1`-`5` shortcut keys to filters.
    pub fn from_shortcut(key: &str) -> Option<Self> {
        Some(match key {
            "1" => Self::All,
            "2" => Self::Only(ActivityLevel::Info),
            "3" => Self::Only(ActivityLevel::Success),
            "4" => Self::Only(ActivityLevel::Warning),
            "5" => Self::Only(ActivityLevel::Error),
            _ => return None,
        })
    }
}

impl FromStr for LevelFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "info" => Ok(Self::Only(ActivityLevel::Info)),
            "success" => Ok(Self::Only(ActivityLevel::Success)),
            "warning" => Ok(Self::Only(ActivityLevel::Warning)),
            "error" => Ok(Self::Only(ActivityLevel::Error)),
            other => Err(format!("unknown log filter: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: u64,
    pub timestamp_ms: i64,
    pub level: ActivityLevel,
    pub message: String,
}

impl ActivityEntry {
    /// Local wall-clock time, `HH:MM:SS`.
    pub fn time_label(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.timestamp_ms)
            .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
            .unwrap_or_default()
    }
}

impl fmt::Display for ActivityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:<7} {}", self.time_label(), self.level, self.message)
    }
}

pub struct ActivityLog {
    entries: Vec<Option<ActivityEntry>>,
    capacity: usize,
    write_pos: usize,
    count: usize,
    next_id: u64,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(ACTIVITY_LOG_CAPACITY)
    }
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            entries,
            capacity,
            write_pos: 0,
            count: 0,
            next_id: 1,
        }
    }

    /// Record an entry and return its id.
    pub fn push(&mut self, level: ActivityLevel, message: impl Into<String>) -> u64 {
        let message = message.into();
        match level {
            ActivityLevel::Error => tracing::error!("{message}"),
            ActivityLevel::Warning => tracing::warn!("{message}"),
            ActivityLevel::Info | ActivityLevel::Success => tracing::info!("{message}"),
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries[self.write_pos] = Some(ActivityEntry {
            id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            level,
            message,
        });
        self.write_pos = (self.write_pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
        id
    }

    pub fn info(&mut self, message: impl Into<String>) -> u64 {
        self.push(ActivityLevel::Info, message)
    }

    pub fn success(&mut self, message: impl Into<String>) -> u64 {
        self.push(ActivityLevel::Success, message)
    }

    pub fn warning(&mut self, message: impl Into<String>) -> u64 {
        self.push(ActivityLevel::Warning, message)
    }

    pub fn error(&mut self, message: impl Into<String>) -> u64 {
        self.push(ActivityLevel::Error, message)
    }

    /// Oldest first.
    pub fn entries(&self, filter: LevelFilter) -> Vec<ActivityEntry> {
        // write_pos points at the oldest slot once the buffer has wrapped
        let start = if self.count < self.capacity { 0 } else { self.write_pos };
        (0..self.count)
            .filter_map(|i| self.entries[(start + i) % self.capacity].as_ref())
            .filter(|entry| filter.accepts(entry.level))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        for slot in self.entries.iter_mut() {
            *slot = None;
        }
        self.write_pos = 0;
        self.count = 0;
    }
}
