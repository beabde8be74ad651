use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{ChangeRecord, FailureRecord, KeyKind, RunId};

pub const REPORT_CONTRACT_VERSION: &str = "report.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Ttl,
    Values,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Complete,
    /// Finished, but some pages, slices or keys failed after retries.
    Partial,
    Cancelled,
    Aborted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TtlSummary {
    pub scanned_keys: usize,
    pub pages: usize,
    pub filtered_keys: usize,
    pub in_sync: usize,
    pub repaired: usize,
    pub skipped_source_persistent: usize,
    pub skipped_source_missing: usize,
    pub skipped_target_missing: usize,
    pub failed_keys: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct KindSummary {
    pub discovered: usize,
    pub filtered: usize,
    pub repaired: usize,
    pub skipped_source_missing: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValueSummary {
    pub string: KindSummary,
    pub set: KindSummary,
    pub hash: KindSummary,
}

impl ValueSummary {
    #[must_use]
    pub fn kind(&self, kind: KeyKind) -> &KindSummary {
        match kind {
            KeyKind::String => &self.string,
            KeyKind::Set => &self.set,
            KeyKind::Hash => &self.hash,
        }
    }

    pub fn kind_mut(&mut self, kind: KeyKind) -> &mut KindSummary {
        match kind {
            KeyKind::String => &mut self.string,
            KeyKind::Set => &mut self.set,
            KeyKind::Hash => &mut self.hash,
        }
    }
}

/// End-of-pass summary. Emitted on success, partial failure, cancellation
/// and abort alike.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairReport {
    pub run_id: RunId,
    pub pass: PassKind,
    pub dry_run: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl: Option<TtlSummary>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub values: Option<ValueSummary>,
    pub changes: Vec<ChangeRecord>,
    pub failures: Vec<FailureRecord>,
    pub aborted: Option<String>,
    pub cancelled: bool,
}

impl RepairReport {
    #[must_use]
    pub fn begin(pass: PassKind, dry_run: bool) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            run_id: RunId::new(),
            pass,
            dry_run,
            started_at: now,
            finished_at: now,
            ttl: match pass {
                PassKind::Ttl => Some(TtlSummary::default()),
                PassKind::Values => None,
            },
            values: match pass {
                PassKind::Ttl => None,
                PassKind::Values => Some(ValueSummary::default()),
            },
            changes: Vec::new(),
            failures: Vec::new(),
            aborted: None,
            cancelled: false,
        }
    }

    /// Report for a pass that could not start, e.g. an unreadable catalog.
    #[must_use]
    pub fn aborted_before_start(pass: PassKind, dry_run: bool, reason: impl Into<String>) -> Self {
        let mut report = Self::begin(pass, dry_run);
        report.aborted = Some(reason.into());
        report.finish()
    }

    /// Stamp the finish time and order change records by key.
    #[must_use]
    pub fn finish(mut self) -> Self {
        self.changes.sort_by(|a, b| a.key.cmp(&b.key).then(a.kind.cmp(&b.kind)));
        self.finished_at = OffsetDateTime::now_utc();
        self
    }

    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        if self.aborted.is_some() {
            RunOutcome::Aborted
        } else if self.cancelled {
            RunOutcome::Cancelled
        } else if self.failures.is_empty() {
            RunOutcome::Complete
        } else {
            RunOutcome::Partial
        }
    }

    /// Repairs applied, or that would have been applied in dry-run.
    #[must_use]
    pub fn repairs(&self) -> usize {
        self.changes.len()
    }
}
