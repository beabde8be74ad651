use crate::pool::fan_out;
use crate::report::{PassKind, RepairReport, TtlSummary};
use crate::{
    compare_expirations, CancelToken, ChangeRecord, Descriptor, ExpiryVerdict, FailureRecord,
    FailureScope, Key, KeyKind, KvStore, ReconcileOptions, StoreError, StoreHandle,
};

/// Rewrites target expirations that drifted from the source.
///
/// Walks the target keyspace with `SCAN ... TYPE string`, compares absolute
/// `PEXPIRETIME` values page by page, and pipelines `PEXPIREAT` for every key
/// whose drift exceeds the tolerance. Values are never touched.
pub struct TtlReconciler<'a> {
    source: &'a dyn KvStore,
    target: &'a dyn KvStore,
    options: &'a ReconcileOptions,
    cancel: CancelToken,
}

struct ScanEnd {
    scanned_keys: usize,
    pages: usize,
    filtered_keys: usize,
    aborted: Option<String>,
    cancelled: bool,
}

#[derive(Default)]
struct PageOutcome {
    summary: TtlSummary,
    changes: Vec<ChangeRecord>,
    failure: Option<FailureRecord>,
}

impl<'a> TtlReconciler<'a> {
    #[must_use]
    pub fn new(
        source: &'a dyn KvStore,
        target: &'a dyn KvStore,
        options: &'a ReconcileOptions,
    ) -> Self {
        Self { source, target, options, cancel: CancelToken::new() }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one full pass. Never fails: store outages, scan errors and
    /// cancellation are reflected in the returned report.
    #[must_use]
    pub fn run(&self) -> RepairReport {
        let options = self.options;
        let mut report = RepairReport::begin(PassKind::Ttl, options.dry_run);
        let source = StoreHandle::new(self.source, options.retry);
        let target = StoreHandle::new(self.target, options.retry);

        tracing::info!(
            run_id = %report.run_id,
            source = source.endpoint(),
            target = target.endpoint(),
            dry_run = options.dry_run,
            page_size = options.page_size,
            tolerance_ms = options.tolerance_ms,
            "ttl pass starting"
        );

        for (role, handle) in [("target", &target), ("source", &source)] {
            if let Err(err) = handle.ping() {
                tracing::error!(role, endpoint = handle.endpoint(), error = %err, "store unreachable");
                report.aborted = Some(format!("{role} store unreachable: {err}"));
                return report.finish();
            }
        }

        let mut summary = TtlSummary::default();
        let cancel = &self.cancel;
        let scan = fan_out(
            options.workers,
            |submit| scan_target(&target, options, cancel, submit),
            |keys| repair_page(&source, &target, options, keys),
            |outcome: PageOutcome| {
                merge_summary(&mut summary, &outcome.summary);
                report.changes.extend(outcome.changes);
                if let Some(failure) = outcome.failure {
                    report.failures.push(failure);
                }
            },
        );

        summary.scanned_keys = scan.scanned_keys;
        summary.pages = scan.pages;
        summary.filtered_keys = scan.filtered_keys;
        report.ttl = Some(summary);
        report.aborted = scan.aborted;
        report.cancelled = scan.cancelled;
        let report = report.finish();

        tracing::info!(
            run_id = %report.run_id,
            scanned_keys = scan.scanned_keys,
            repairs = report.repairs(),
            failures = report.failures.len(),
            outcome = ?report.outcome(),
            "ttl pass finished"
        );
        report
    }
}

fn scan_target(
    target: &StoreHandle<'_>,
    options: &ReconcileOptions,
    cancel: &CancelToken,
    submit: &mut dyn FnMut(Vec<Key>) -> bool,
) -> ScanEnd {
    let mut end = ScanEnd {
        scanned_keys: 0,
        pages: 0,
        filtered_keys: 0,
        aborted: None,
        cancelled: false,
    };
    let mut cursor = 0;
    loop {
        if cancel.is_cancelled() {
            tracing::warn!(cursor, "ttl pass cancelled; draining in-flight pages");
            end.cancelled = true;
            return end;
        }
        let page = match target.scan(cursor, options.page_size, Some(KeyKind::String)) {
            Ok(page) => page,
            Err(err) => {
                tracing::error!(cursor, error = %err, "scan failed; aborting ttl pass");
                end.aborted = Some(format!("scan failed at cursor {cursor}: {err}"));
                return end;
            }
        };
        let next = page.cursor;
        let found = page.keys.len();
        let keys = page
            .keys
            .into_iter()
            .filter(|key| options.key_filter.admits(key.as_bytes()))
            .collect::<Vec<_>>();
        end.pages += 1;
        end.scanned_keys += found;
        end.filtered_keys += found - keys.len();
        tracing::debug!(cursor, next, keys = keys.len(), "scanned page");
        if !keys.is_empty() && !submit(keys) {
            return end;
        }
        cursor = next;
        if cursor == 0 {
            return end;
        }
    }
}

fn repair_page(
    source: &StoreHandle<'_>,
    target: &StoreHandle<'_>,
    options: &ReconcileOptions,
    keys: Vec<Key>,
) -> PageOutcome {
    let mut outcome = PageOutcome::default();
    let current = match target.expiration_times(&keys) {
        Ok(current) => current,
        Err(err) => return failed_page(outcome, keys, &err),
    };
    let wanted = match source.expiration_times(&keys) {
        Ok(wanted) => wanted,
        Err(err) => return failed_page(outcome, keys, &err),
    };

    let mut updates = Vec::new();
    for ((key, current), wanted) in keys.into_iter().zip(current).zip(wanted) {
        match compare_expirations(current, wanted, options.tolerance_ms) {
            ExpiryVerdict::InSync => outcome.summary.in_sync += 1,
            ExpiryVerdict::SkipSourcePersistent => outcome.summary.skipped_source_persistent += 1,
            ExpiryVerdict::SkipSourceMissing => outcome.summary.skipped_source_missing += 1,
            ExpiryVerdict::SkipTargetMissing => outcome.summary.skipped_target_missing += 1,
            ExpiryVerdict::Repair { from, to } => {
                tracing::debug!(%key, from = from.as_raw(), to, "expiration drift");
                outcome.changes.push(ChangeRecord {
                    key: key.clone(),
                    kind: KeyKind::String,
                    old: Descriptor::from(from),
                    new: Descriptor::ExpiresAt(to),
                });
                updates.push((key, to));
            }
        }
    }

    if !options.dry_run {
        if let Err(err) = target.expire_at_all(&updates) {
            let keys = updates.into_iter().map(|(key, _)| key).collect::<Vec<_>>();
            outcome.changes.clear();
            return failed_page(outcome, keys, &err);
        }
    }
    outcome.summary.repaired = outcome.changes.len();
    outcome
}

fn failed_page(mut outcome: PageOutcome, keys: Vec<Key>, err: &StoreError) -> PageOutcome {
    tracing::warn!(keys = keys.len(), error = %err, "ttl page failed");
    outcome.summary.failed_keys = keys.len();
    outcome.failure =
        Some(FailureRecord { scope: FailureScope::TtlPage, keys, error: err.to_string() });
    outcome
}

fn merge_summary(total: &mut TtlSummary, page: &TtlSummary) {
    total.in_sync += page.in_sync;
    total.repaired += page.repaired;
    total.skipped_source_persistent += page.skipped_source_persistent;
    total.skipped_source_missing += page.skipped_source_missing;
    total.skipped_target_missing += page.skipped_target_missing;
    total.failed_keys += page.failed_keys;
}
