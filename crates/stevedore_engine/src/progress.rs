//! Structured engine output parsing and per-mode progress accounting.
//!
//! The engine writes one JSON object per stdout line: `level`, `msg`,
//! and on periodic stats notices a `stats` block. Three accounting
//! modes exist:
//!
//! - **Transfer**: `transfers`/`totalTransfers` are the object
//!   counters, `bytes`/`totalBytes`/`speed`/`eta` fill in the rest.
//! - **Delete**: `deletes` is objectsDone; the total is unknown.
//! - **Batch**: one child per item; objectsDone increments per finished
//!   item and byte-level fields are not exposed across items.

use serde::Deserialize;

use stevedore_protocol::types::Progress;

/// `stats` block of a structured log record.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsBlock {
    pub bytes: Option<u64>,
    pub total_bytes: Option<i64>,
    pub transfers: Option<u64>,
    pub total_transfers: Option<i64>,
    pub speed: Option<f64>,
    pub eta: Option<f64>,
    pub deletes: Option<u64>,
}

/// One parsed stdout line.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineLogRecord {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub stats: Option<StatsBlock>,
}

fn default_level() -> String {
    "info".to_string()
}

impl EngineLogRecord {
    /// Parse one stdout line. Non-JSON lines (older engines mix plain
    /// text in) degrade to an info record carrying the raw line.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str::<EngineLogRecord>(trimmed) {
            Ok(record) => Some(record),
            Err(_) => Some(EngineLogRecord {
                level: default_level(),
                msg: trimmed.to_string(),
                stats: None,
            }),
        }
    }
}

/// Which accounting rules apply to the running episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Transfer,
    Delete,
    /// (items finished so far, items total)
    Batch,
}

/// Folds stats blocks into the job's progress snapshot.
#[derive(Debug)]
pub struct ProgressTracker {
    mode: ProgressMode,
    current: Progress,
    /// Objects finished in previous batch items.
    batch_done: u64,
    batch_total: u64,
}

impl ProgressTracker {
    pub fn transfer() -> Self {
        Self::new(ProgressMode::Transfer, 0)
    }

    pub fn delete() -> Self {
        Self::new(ProgressMode::Delete, 0)
    }

    pub fn batch(total_items: u64) -> Self {
        let mut tracker = Self::new(ProgressMode::Batch, total_items);
        tracker.current.objects_done = Some(0);
        tracker.current.objects_total = Some(total_items);
        tracker
    }

    fn new(mode: ProgressMode, batch_total: u64) -> Self {
        Self {
            mode,
            current: Progress::default(),
            batch_done: 0,
            batch_total,
        }
    }

    pub fn snapshot(&self) -> Progress {
        self.current
    }

    /// Fold one stats block; returns the updated snapshot when it
    /// changed anything.
    pub fn apply(&mut self, stats: &StatsBlock) -> Option<Progress> {
        let before = self.current;
        match self.mode {
            ProgressMode::Transfer => {
                if let Some(transfers) = stats.transfers {
                    self.current.objects_done = Some(transfers);
                }
                // The engine reports -1 while the total is still unknown.
                if let Some(total) = stats.total_transfers.filter(|t| *t >= 0) {
                    self.current.objects_total = Some(total as u64);
                }
                if let Some(bytes) = stats.bytes {
                    self.current.bytes_done = Some(bytes);
                }
                if let Some(total) = stats.total_bytes.filter(|t| *t >= 0) {
                    self.current.bytes_total = Some(total as u64);
                }
                if let Some(speed) = stats.speed {
                    self.current.speed_bps = Some(speed);
                }
                if let Some(eta) = stats.eta.filter(|e| e.is_finite() && *e >= 0.0) {
                    self.current.eta_seconds = Some(eta as u64);
                }
            }
            ProgressMode::Delete => {
                if let Some(deletes) = stats.deletes {
                    self.current.objects_done = Some(deletes);
                }
                // objectsTotal stays unknown in delete mode.
            }
            ProgressMode::Batch => {
                // Per-item byte counters are meaningless across items;
                // only object completion is tracked (see finish_item).
            }
        }
        (self.current != before).then_some(self.current)
    }

    /// Record completion of one batch item.
    pub fn finish_item(&mut self) -> Progress {
        debug_assert_eq!(self.mode, ProgressMode::Batch);
        self.batch_done = (self.batch_done + 1).min(self.batch_total);
        self.current.objects_done = Some(self.batch_done);
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_lines() {
        let record = EngineLogRecord::parse(
            r#"{"level":"notice","msg":"Transferred: 5/12","stats":{"bytes":1024,"totalBytes":4096,"transfers":5,"totalTransfers":12,"speed":512.0,"eta":6.0}}"#,
        )
        .unwrap();
        assert_eq!(record.level, "notice");
        let stats = record.stats.unwrap();
        assert_eq!(stats.transfers, Some(5));
        assert_eq!(stats.total_transfers, Some(12));
    }

    #[test]
    fn plain_text_lines_degrade_gracefully() {
        let record = EngineLogRecord::parse("Transferred: everything").unwrap();
        assert_eq!(record.level, "info");
        assert_eq!(record.msg, "Transferred: everything");
        assert!(record.stats.is_none());
        assert!(EngineLogRecord::parse("   ").is_none());
    }

    #[test]
    fn transfer_mode_accumulates() {
        let mut tracker = ProgressTracker::transfer();
        let progress = tracker
            .apply(&StatsBlock {
                bytes: Some(1000),
                total_bytes: Some(8000),
                transfers: Some(2),
                total_transfers: Some(10),
                speed: Some(100.0),
                eta: Some(70.0),
                deletes: None,
            })
            .unwrap();
        assert_eq!(progress.objects_done, Some(2));
        assert_eq!(progress.objects_total, Some(10));
        assert_eq!(progress.bytes_done, Some(1000));
        assert_eq!(progress.bytes_total, Some(8000));
        assert_eq!(progress.eta_seconds, Some(70));

        // Unknown totals (-1) leave the previous value alone.
        tracker.apply(&StatsBlock {
            transfers: Some(3),
            total_transfers: Some(-1),
            ..Default::default()
        });
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.objects_done, Some(3));
        assert_eq!(snapshot.objects_total, Some(10));
    }

    #[test]
    fn delete_mode_counts_deletes_with_unknown_total() {
        let mut tracker = ProgressTracker::delete();
        tracker.apply(&StatsBlock {
            deletes: Some(7),
            ..Default::default()
        });
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.objects_done, Some(7));
        assert_eq!(snapshot.objects_total, None);
    }

    #[test]
    fn batch_mode_counts_items_not_bytes() {
        let mut tracker = ProgressTracker::batch(3);
        assert_eq!(tracker.snapshot().objects_total, Some(3));

        // Per-item stats do not leak bytes into the snapshot.
        tracker.apply(&StatsBlock {
            bytes: Some(123),
            ..Default::default()
        });
        assert_eq!(tracker.snapshot().bytes_done, None);

        let progress = tracker.finish_item();
        assert_eq!(progress.objects_done, Some(1));
        tracker.finish_item();
        tracker.finish_item();
        assert_eq!(tracker.snapshot().objects_done, Some(3));
    }

    #[test]
    fn no_change_returns_none() {
        let mut tracker = ProgressTracker::transfer();
        assert!(tracker.apply(&StatsBlock::default()).is_none());
    }
}
