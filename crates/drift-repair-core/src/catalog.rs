use crate::{CatalogError, Key, KeyKind};

/// Read-only listing of keys an upstream comparison flagged as divergent.
pub trait MismatchCatalog {
    /// Keys of `kind` needing repair, deduplicated, in catalog order.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    fn mismatched_keys(&self, kind: KeyKind) -> Result<Vec<Key>, CatalogError>;
}
