use crate::Expiration;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExpiryVerdict {
    InSync,
    Repair { from: Expiration, to: i64 },
    /// Source key never expires; an absolute timestamp cannot be derived.
    SkipSourcePersistent,
    SkipSourceMissing,
    /// Target key disappeared between the scan and the lookup.
    SkipTargetMissing,
}

/// Decide whether the target expiration must be rewritten to the source one.
///
/// Both sides are absolute epoch milliseconds; `tolerance_ms` absorbs clock
/// and propagation skew between the two stores.
#[must_use]
pub fn compare_expirations(
    target: Expiration,
    source: Expiration,
    tolerance_ms: u64,
) -> ExpiryVerdict {
    match (target, source) {
        (_, Expiration::Persistent) => ExpiryVerdict::SkipSourcePersistent,
        (_, Expiration::Missing) => ExpiryVerdict::SkipSourceMissing,
        (Expiration::Missing, Expiration::At(_)) => ExpiryVerdict::SkipTargetMissing,
        (Expiration::Persistent, Expiration::At(to)) => {
            ExpiryVerdict::Repair { from: Expiration::Persistent, to }
        }
        (Expiration::At(current), Expiration::At(to)) => {
            if current.abs_diff(to) > tolerance_ms {
                ExpiryVerdict::Repair { from: Expiration::At(current), to }
            } else {
                ExpiryVerdict::InSync
            }
        }
    }
}
