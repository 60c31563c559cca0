use chrono::{DateTime, Local};

use crate::classifier::ClassificationResult;
use crate::label::WasteCategory;

/// A recorded classification. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    label: WasteCategory,
    confidence: f32,
    timestamp: DateTime<Local>,
}

impl HistoryEntry {
    pub fn label(&self) -> WasteCategory {
        self.label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Confidence as a percentage with two decimals, e.g. `91.00%`.
    pub fn confidence_percent(&self) -> String {
        format!("{:.2}%", self.confidence * 100.0)
    }
}

impl std::fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.timestamp.format("%H:%M:%S"),
            self.label,
            self.confidence_percent()
        )
    }
}

/// Append-only record of classifications for one session.
#[derive(Debug, Clone, Default)]
pub struct HistoryLedger {
    entries: Vec<HistoryEntry>,
}

impl HistoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, result: ClassificationResult) -> HistoryEntry {
        let entry = HistoryEntry {
            label: result.label,
            confidence: result.confidence,
            timestamp: Local::now(),
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Entries in classification order.
    pub fn all(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn newest_first(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().rev()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
