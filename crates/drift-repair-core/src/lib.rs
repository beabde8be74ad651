use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use ulid::Ulid;

mod catalog;
mod compare;
mod config;
mod filter;
pub mod mem_store;
mod pool;
mod report;
mod retry;
mod store;
mod ttl;
mod values;

pub use catalog::MismatchCatalog;
pub use compare::{compare_expirations, ExpiryVerdict};
pub use config::{ConfigError, ReconcileOptions};
pub use filter::KeyFilter;
pub use report::{
    KindSummary, PassKind, RepairReport, RunOutcome, TtlSummary, ValueSummary,
    REPORT_CONTRACT_VERSION,
};
pub use retry::RetryPolicy;
pub use store::{Command, KvStore, Reply, ScanPage, StoreHandle};
pub use ttl::TtlReconciler;
pub use values::ValueReconciler;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("timed out talking to {endpoint}")]
    Timeout { endpoint: String },
    #[error("i/o error talking to {endpoint}: {message}")]
    Io { endpoint: String, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("transaction aborted by {endpoint}")]
    TransactionAborted { endpoint: String },
    #[error("unexpected reply to {command}: {detail}")]
    UnexpectedReply { command: &'static str, detail: String },
}

impl StoreError {
    /// Network-level failures are worth another attempt; anything the server
    /// answered deliberately is not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io { .. })
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CatalogError {
    #[error("catalog open error: {0}")]
    Open(String),
    #[error("catalog schema error: {0}")]
    Schema(String),
    #[error("catalog query error: {0}")]
    Query(String),
}

/// Opaque key bytes as stored in the cache.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => f.write_str(text),
            Err(_) => write!(f, "hex:{}", hex::encode(&self.0)),
        }
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.strip_prefix("hex:") {
            Some(encoded) => hex::decode(encoded).map(Self).map_err(serde::de::Error::custom),
            None => Ok(Self(raw.into_bytes())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    String,
    Set,
    Hash,
}

impl KeyKind {
    pub const ALL: [KeyKind; 3] = [Self::String, Self::Set, Self::Hash];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Set => "set",
            Self::Hash => "hash",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "string" => Some(Self::String),
            "set" => Some(Self::Set),
            "hash" => Some(Self::Hash),
            _ => None,
        }
    }
}

impl Display for KeyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Absolute expiration as reported by `PEXPIRETIME`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Expiration {
    At(i64),
    Persistent,
    Missing,
}

impl Expiration {
    /// Decode the raw integer reply: `-1` means no expiry, `-2` means the key
    /// does not exist. Other negative values are not valid replies.
    #[must_use]
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            -1 => Some(Self::Persistent),
            -2 => Some(Self::Missing),
            at if at >= 0 => Some(Self::At(at)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> i64 {
        match self {
            Self::At(at) => at,
            Self::Persistent => -1,
            Self::Missing => -2,
        }
    }
}

/// Content fingerprint recorded in place of the value itself.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValueDigest {
    pub items: usize,
    pub bytes: usize,
    pub sha256: String,
}

impl ValueDigest {
    #[must_use]
    pub fn of_string(value: &[u8]) -> Self {
        Self { items: 1, bytes: value.len(), sha256: hex::encode(Sha256::digest(value)) }
    }

    /// Order-independent digest of set members.
    #[must_use]
    pub fn of_members(members: &[Vec<u8>]) -> Self {
        let mut sorted = members.iter().collect::<Vec<_>>();
        sorted.sort();
        let mut hasher = Sha256::new();
        let mut bytes = 0;
        for member in sorted {
            hasher.update((member.len() as u64).to_be_bytes());
            hasher.update(member);
            bytes += member.len();
        }
        Self { items: members.len(), bytes, sha256: hex::encode(hasher.finalize()) }
    }

    /// Order-independent digest of hash field/value pairs.
    #[must_use]
    pub fn of_fields(fields: &[(Vec<u8>, Vec<u8>)]) -> Self {
        let mut sorted = fields.iter().collect::<Vec<_>>();
        sorted.sort();
        let mut hasher = Sha256::new();
        let mut bytes = 0;
        for (field, value) in sorted {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value);
            bytes += field.len() + value.len();
        }
        Self { items: fields.len(), bytes, sha256: hex::encode(hasher.finalize()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Descriptor {
    ExpiresAt(i64),
    Persistent,
    Missing,
    Value(ValueDigest),
    Unknown,
}

impl From<Expiration> for Descriptor {
    fn from(value: Expiration) -> Self {
        match value {
            Expiration::At(at) => Self::ExpiresAt(at),
            Expiration::Persistent => Self::Persistent,
            Expiration::Missing => Self::Missing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChangeRecord {
    pub key: Key,
    pub kind: KeyKind,
    pub old: Descriptor,
    pub new: Descriptor,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    TtlPage,
    StringSlice,
    SetKey,
    HashKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FailureRecord {
    pub scope: FailureScope,
    pub keys: Vec<Key>,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cooperative stop signal shared between the caller and a running pass.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
