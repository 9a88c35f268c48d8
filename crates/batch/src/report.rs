//! Per-item outcomes and their aggregates.

use serde::{Deserialize, Serialize};

use mediarun_core::ItemId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Updated,
    Failed,
}

/// Terminal outcome of one item in one executor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    pub item_id: ItemId,
    pub outcome: ItemOutcome,
    pub error: Option<String>,
}

impl ItemResult {
    pub fn updated(item_id: ItemId) -> Self {
        Self {
            item_id,
            outcome: ItemOutcome::Updated,
            error: None,
        }
    }

    pub fn failed(item_id: ItemId, error: impl Into<String>) -> Self {
        Self {
            item_id,
            outcome: ItemOutcome::Failed,
            error: Some(error.into()),
        }
    }
}

/// Result of one executor invocation.
///
/// `results` is sorted by item id; completion order is not preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub updated: usize,
    pub failed: usize,
    pub results: Vec<ItemResult>,
}

impl BatchReport {
    pub(crate) fn from_results(mut results: Vec<ItemResult>) -> Self {
        results.sort_by_key(|r| r.item_id);
        let updated = results
            .iter()
            .filter(|r| r.outcome == ItemOutcome::Updated)
            .count();
        Self {
            processed: results.len(),
            updated,
            failed: results.len() - updated,
            results,
        }
    }

    /// Non-empty batch in which nothing succeeded.
    pub fn is_total_failure(&self) -> bool {
        self.processed > 0 && self.updated == 0
    }

    pub fn failed_ids(&self) -> Vec<ItemId> {
        self.results
            .iter()
            .filter(|r| r.outcome == ItemOutcome::Failed)
            .map(|r| r.item_id)
            .collect()
    }

    /// First recorded item error, for run-level diagnostics.
    pub fn first_error(&self) -> Option<&str> {
        self.results.iter().find_map(|r| r.error.as_deref())
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            processed: self.processed,
            updated: self.updated,
            failed: self.failed,
        }
    }
}

/// Running totals across the chunks of a run.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub updated: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn absorb(&mut self, report: &BatchReport) {
        self.processed += report.processed;
        self.updated += report.updated;
        self.failed += report.failed;
    }

    /// A run that touched items but updated none of them did not succeed.
    pub fn is_total_failure(&self) -> bool {
        self.processed > 0 && self.updated == 0
    }
}
