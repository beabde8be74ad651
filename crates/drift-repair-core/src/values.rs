use crate::pool::fan_out;
use crate::report::{PassKind, RepairReport, ValueSummary};
use crate::{
    CancelToken, ChangeRecord, Descriptor, Expiration, FailureRecord, FailureScope, Key, KeyKind,
    KvStore, MismatchCatalog, ReconcileOptions, StoreError, StoreHandle, ValueDigest,
};

/// Copies authoritative values from the source over catalogued target keys.
///
/// The target is never read: the catalog already established that the key
/// diverges, so every key whose source value still exists is rewritten.
/// Strings go out in `MSET` slices; sets and hashes are replaced one key at a
/// time inside `MULTI`/`EXEC` so a reader never observes a half-built value.
/// Each rewritten key takes the source expiration in the same write.
pub struct ValueReconciler<'a> {
    source: &'a dyn KvStore,
    target: &'a dyn KvStore,
    catalog: &'a dyn MismatchCatalog,
    options: &'a ReconcileOptions,
    cancel: CancelToken,
}

enum WorkItem {
    StringSlice(Vec<Key>),
    SetKey(Key),
    HashKey(Key),
}

struct ItemOutcome {
    kind: KeyKind,
    repaired: usize,
    skipped_source_missing: usize,
    failed: usize,
    changes: Vec<ChangeRecord>,
    failure: Option<FailureRecord>,
}

impl ItemOutcome {
    fn new(kind: KeyKind) -> Self {
        Self {
            kind,
            repaired: 0,
            skipped_source_missing: 0,
            failed: 0,
            changes: Vec::new(),
            failure: None,
        }
    }

    fn fail(mut self, scope: FailureScope, keys: Vec<Key>, err: &StoreError) -> Self {
        tracing::warn!(kind = %self.kind, keys = keys.len(), error = %err, "value repair failed");
        self.changes.clear();
        self.repaired = 0;
        self.failed = keys.len();
        self.failure = Some(FailureRecord { scope, keys, error: err.to_string() });
        self
    }
}

impl<'a> ValueReconciler<'a> {
    #[must_use]
    pub fn new(
        source: &'a dyn KvStore,
        target: &'a dyn KvStore,
        catalog: &'a dyn MismatchCatalog,
        options: &'a ReconcileOptions,
    ) -> Self {
        Self { source, target, catalog, options, cancel: CancelToken::new() }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Repair strings, then sets, then hashes.
    #[must_use]
    pub fn run(&self) -> RepairReport {
        self.run_kinds(&KeyKind::ALL)
    }

    /// Repair only the listed kinds, in the order given.
    ///
    /// A catalog failure stops the pass; kinds already processed keep their
    /// counts and change records in the returned report.
    #[must_use]
    pub fn run_kinds(&self, kinds: &[KeyKind]) -> RepairReport {
        let options = self.options;
        let mut report = RepairReport::begin(PassKind::Values, options.dry_run);
        let source = StoreHandle::new(self.source, options.retry);
        let target = StoreHandle::new(self.target, options.retry);

        tracing::info!(
            run_id = %report.run_id,
            source = source.endpoint(),
            target = target.endpoint(),
            dry_run = options.dry_run,
            slice_size = options.slice_size,
            kinds = ?kinds,
            "value pass starting"
        );

        for (role, handle) in [("target", &target), ("source", &source)] {
            if let Err(err) = handle.ping() {
                tracing::error!(role, endpoint = handle.endpoint(), error = %err, "store unreachable");
                report.aborted = Some(format!("{role} store unreachable: {err}"));
                return report.finish();
            }
        }

        let mut summary = ValueSummary::default();
        for &kind in kinds {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let keys = match self.catalog.mismatched_keys(kind) {
                Ok(keys) => keys,
                Err(err) => {
                    tracing::error!(%kind, error = %err, "catalog unreadable; aborting value pass");
                    report.aborted = Some(format!("reading {kind} keys from catalog: {err}"));
                    break;
                }
            };
            let discovered = keys.len();
            let keys = keys
                .into_iter()
                .filter(|key| options.key_filter.admits(key.as_bytes()))
                .collect::<Vec<_>>();
            let counts = summary.kind_mut(kind);
            counts.discovered = discovered;
            counts.filtered = discovered - keys.len();
            tracing::info!(%kind, discovered, admitted = keys.len(), "catalog keys loaded");

            let cancel = &self.cancel;
            let slice_size = options.slice_size;
            let cancelled = fan_out(
                options.workers,
                move |submit| dispatch(kind, keys, slice_size, cancel, submit),
                |item| repair_item(&source, &target, options, item),
                |outcome: ItemOutcome| {
                    let counts = summary.kind_mut(outcome.kind);
                    counts.repaired += outcome.repaired;
                    counts.skipped_source_missing += outcome.skipped_source_missing;
                    counts.failed += outcome.failed;
                    report.changes.extend(outcome.changes);
                    if let Some(failure) = outcome.failure {
                        report.failures.push(failure);
                    }
                },
            );
            if cancelled {
                tracing::warn!(%kind, "value pass cancelled; in-flight items drained");
                report.cancelled = true;
                break;
            }
        }

        report.values = Some(summary);
        let report = report.finish();
        tracing::info!(
            run_id = %report.run_id,
            repairs = report.repairs(),
            failures = report.failures.len(),
            outcome = ?report.outcome(),
            "value pass finished"
        );
        report
    }
}

/// Feed work items to the pool. Returns `true` when stopped by cancellation.
fn dispatch(
    kind: KeyKind,
    keys: Vec<Key>,
    slice_size: usize,
    cancel: &CancelToken,
    submit: &mut dyn FnMut(WorkItem) -> bool,
) -> bool {
    let items = match kind {
        KeyKind::String => keys
            .chunks(slice_size.max(1))
            .map(|slice| WorkItem::StringSlice(slice.to_vec()))
            .collect::<Vec<_>>(),
        KeyKind::Set => keys.into_iter().map(WorkItem::SetKey).collect(),
        KeyKind::Hash => keys.into_iter().map(WorkItem::HashKey).collect(),
    };
    for item in items {
        if cancel.is_cancelled() {
            return true;
        }
        if !submit(item) {
            return false;
        }
    }
    false
}

fn repair_item(
    source: &StoreHandle<'_>,
    target: &StoreHandle<'_>,
    options: &ReconcileOptions,
    item: WorkItem,
) -> ItemOutcome {
    match item {
        WorkItem::StringSlice(keys) => repair_strings(source, target, options.dry_run, keys),
        WorkItem::SetKey(key) => repair_set(source, target, options.dry_run, key),
        WorkItem::HashKey(key) => repair_hash(source, target, options.dry_run, key),
    }
}

fn repair_strings(
    source: &StoreHandle<'_>,
    target: &StoreHandle<'_>,
    dry_run: bool,
    keys: Vec<Key>,
) -> ItemOutcome {
    let mut outcome = ItemOutcome::new(KeyKind::String);
    let read = source
        .multi_get(&keys)
        .and_then(|values| Ok((values, source.expiration_times(&keys)?)));
    let (values, expirations) = match read {
        Ok(read) => read,
        Err(err) => return outcome.fail(FailureScope::StringSlice, keys, &err),
    };

    let mut pairs = Vec::with_capacity(keys.len());
    let mut expiring = Vec::new();
    for ((key, value), expiration) in keys.into_iter().zip(values).zip(expirations) {
        let (Some(value), Some(CarriedExpiration(expires_at))) = (value, carried_expiration(expiration)) else {
            tracing::debug!(%key, "source string absent; skipped");
            outcome.skipped_source_missing += 1;
            continue;
        };
        outcome.changes.push(ChangeRecord {
            key: key.clone(),
            kind: KeyKind::String,
            old: Descriptor::Unknown,
            new: Descriptor::Value(ValueDigest::of_string(&value)),
        });
        if let Some(at) = expires_at {
            expiring.push((key.clone(), at));
        }
        pairs.push((key, value));
    }

    if !dry_run && !pairs.is_empty() {
        if let Err(err) = target.multi_set_expiring(&pairs, &expiring) {
            let keys = pairs.into_iter().map(|(key, _)| key).collect();
            return outcome.fail(FailureScope::StringSlice, keys, &err);
        }
    }
    tracing::debug!(written = pairs.len(), skipped = outcome.skipped_source_missing, "string slice done");
    outcome.repaired = outcome.changes.len();
    outcome
}

/// Expiration written with a rewritten key; `None` means persistent.
struct CarriedExpiration(Option<i64>);

/// `None` when the source key is gone.
fn carried_expiration(expiration: Expiration) -> Option<CarriedExpiration> {
    match expiration {
        Expiration::At(at) => Some(CarriedExpiration(Some(at))),
        Expiration::Persistent => Some(CarriedExpiration(None)),
        Expiration::Missing => None,
    }
}

fn source_expiration(source: &StoreHandle<'_>, key: &Key) -> Result<Expiration, StoreError> {
    let expirations = source.expiration_times(std::slice::from_ref(key))?;
    Ok(expirations.into_iter().next().unwrap_or(Expiration::Missing))
}

fn repair_set(
    source: &StoreHandle<'_>,
    target: &StoreHandle<'_>,
    dry_run: bool,
    key: Key,
) -> ItemOutcome {
    let mut outcome = ItemOutcome::new(KeyKind::Set);
    let read = source
        .members(&key)
        .and_then(|members| Ok((members, source_expiration(source, &key)?)));
    let (members, expiration) = match read {
        Ok(read) => read,
        Err(err) => return outcome.fail(FailureScope::SetKey, vec![key], &err),
    };
    let expires_at = match carried_expiration(expiration) {
        Some(CarriedExpiration(expires_at)) if !members.is_empty() => expires_at,
        _ => {
            tracing::debug!(%key, "source set absent; skipped");
            outcome.skipped_source_missing = 1;
            return outcome;
        }
    };
    if !dry_run {
        if let Err(err) = target.replace_set(&key, &members, expires_at) {
            return outcome.fail(FailureScope::SetKey, vec![key], &err);
        }
    }
    outcome.changes.push(ChangeRecord {
        key,
        kind: KeyKind::Set,
        old: Descriptor::Unknown,
        new: Descriptor::Value(ValueDigest::of_members(&members)),
    });
    outcome.repaired = 1;
    outcome
}

fn repair_hash(
    source: &StoreHandle<'_>,
    target: &StoreHandle<'_>,
    dry_run: bool,
    key: Key,
) -> ItemOutcome {
    let mut outcome = ItemOutcome::new(KeyKind::Hash);
    let read = source
        .all_fields(&key)
        .and_then(|fields| Ok((fields, source_expiration(source, &key)?)));
    let (fields, expiration) = match read {
        Ok(read) => read,
        Err(err) => return outcome.fail(FailureScope::HashKey, vec![key], &err),
    };
    let expires_at = match carried_expiration(expiration) {
        Some(CarriedExpiration(expires_at)) if !fields.is_empty() => expires_at,
        _ => {
            tracing::debug!(%key, "source hash absent; skipped");
            outcome.skipped_source_missing = 1;
            return outcome;
        }
    };
    if !dry_run {
        if let Err(err) = target.replace_hash(&key, &fields, expires_at) {
            return outcome.fail(FailureScope::HashKey, vec![key], &err);
        }
    }
    outcome.changes.push(ChangeRecord {
        key,
        kind: KeyKind::Hash,
        old: Descriptor::Unknown,
        new: Descriptor::Value(ValueDigest::of_fields(&fields)),
    });
    outcome.repaired = 1;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<Key> {
        names.iter().map(|name| Key::from(*name)).collect()
    }

    #[test]
    fn strings_are_dispatched_in_slices() {
        let mut slices = Vec::new();
        let cancelled = dispatch(
            KeyKind::String,
            keys(&["a", "b", "c", "d", "e"]),
            2,
            &CancelToken::new(),
            &mut |item| {
                if let WorkItem::StringSlice(slice) = item {
                    slices.push(slice.len());
                }
                true
            },
        );
        assert!(!cancelled);
        assert_eq!(slices, [2, 2, 1]);
    }

    #[test]
    fn dispatch_stops_once_cancelled() {
        let cancel = CancelToken::new();
        let mut submitted = 0;
        let cancelled = dispatch(KeyKind::Set, keys(&["s1", "s2", "s3"]), 10, &cancel, &mut |_| {
            submitted += 1;
            cancel.cancel();
            true
        });
        assert!(cancelled);
        assert_eq!(submitted, 1);
    }
}
