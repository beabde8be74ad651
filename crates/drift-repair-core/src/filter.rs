use std::collections::BTreeSet;

/// Key allow-list in the `abc*|efg|m*` form: `|` separates entries, a
/// trailing `*` makes the entry a prefix match, anything else is exact.
/// An empty filter admits every key.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct KeyFilter {
    exact: BTreeSet<Vec<u8>>,
    prefixes: Vec<Vec<u8>>,
}

impl KeyFilter {
    #[must_use]
    pub fn parse(list: &str) -> Self {
        let mut filter = Self::default();
        for entry in list.split('|').filter(|entry| !entry.is_empty()) {
            match entry.strip_suffix('*') {
                Some(prefix) => filter.prefixes.push(prefix.as_bytes().to_vec()),
                None => {
                    filter.exact.insert(entry.as_bytes().to_vec());
                }
            }
        }
        filter
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }

    #[must_use]
    pub fn admits(&self, key: &[u8]) -> bool {
        self.is_empty()
            || self.exact.contains(key)
            || self.prefixes.iter().any(|prefix| key.starts_with(prefix))
    }
}
