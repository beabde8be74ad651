//! In-process [`KvStore`] for tests and dry experiments.
//!
//! Keys never expire on their own: `PEXPIREAT` only records the absolute
//! deadline so `PEXPIRETIME` can report it back. Faults can be injected per
//! call or for every transaction.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{Command, Expiration, Key, KeyKind, KvStore, Reply, StoreError};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StoredValue {
    String(Vec<u8>),
    Set(BTreeSet<Vec<u8>>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
}

impl StoredValue {
    #[must_use]
    pub fn kind(&self) -> KeyKind {
        match self {
            Self::String(_) => KeyKind::String,
            Self::Set(_) => KeyKind::Set,
            Self::Hash(_) => KeyKind::Hash,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StoredEntry {
    pub value: StoredValue,
    pub expires_at: Option<i64>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<Vec<u8>, StoredEntry>,
    scripted: VecDeque<Reply>,
    faults: VecDeque<StoreError>,
    fail_transactions: bool,
    mutations: usize,
}

pub struct MemoryStore {
    name: String,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), state: Mutex::new(State::default()) }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_string(&self, key: &str, value: &str) {
        self.state().entries.insert(
            key.as_bytes().to_vec(),
            StoredEntry { value: StoredValue::String(value.as_bytes().to_vec()), expires_at: None },
        );
    }

    pub fn add_members(&self, key: &str, members: &[&str]) {
        let members = members.iter().map(|member| member.as_bytes().to_vec()).collect();
        self.state().entries.insert(
            key.as_bytes().to_vec(),
            StoredEntry { value: StoredValue::Set(members), expires_at: None },
        );
    }

    pub fn set_fields(&self, key: &str, fields: &[(&str, &str)]) {
        let fields = fields
            .iter()
            .map(|(field, value)| (field.as_bytes().to_vec(), value.as_bytes().to_vec()))
            .collect();
        self.state().entries.insert(
            key.as_bytes().to_vec(),
            StoredEntry { value: StoredValue::Hash(fields), expires_at: None },
        );
    }

    /// Set or clear the absolute expiration of an existing key.
    pub fn set_expiration(&self, key: &str, at: Option<i64>) {
        if let Some(entry) = self.state().entries.get_mut(key.as_bytes()) {
            entry.expires_at = at;
        }
    }

    #[must_use]
    pub fn value(&self, key: &str) -> Option<StoredValue> {
        self.state().entries.get(key.as_bytes()).map(|entry| entry.value.clone())
    }

    #[must_use]
    pub fn expiration(&self, key: &str) -> Expiration {
        match self.state().entries.get(key.as_bytes()) {
            None => Expiration::Missing,
            Some(StoredEntry { expires_at: None, .. }) => Expiration::Persistent,
            Some(StoredEntry { expires_at: Some(at), .. }) => Expiration::At(*at),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<Key, StoredEntry> {
        self.state()
            .entries
            .iter()
            .map(|(key, entry)| (Key::new(key.clone()), entry.clone()))
            .collect()
    }

    /// Answer the next command with `reply` instead of executing it.
    pub fn script_reply(&self, reply: Reply) {
        self.state().scripted.push_back(reply);
    }

    /// Fail the next `calls` pipeline or transaction calls with `error`.
    pub fn fail_next(&self, calls: usize, error: StoreError) {
        let mut state = self.state();
        for _ in 0..calls {
            state.faults.push_back(error.clone());
        }
    }

    pub fn fail_transactions(&self, fail: bool) {
        self.state().fail_transactions = fail;
    }

    /// Write commands applied so far.
    #[must_use]
    pub fn mutations(&self) -> usize {
        self.state().mutations
    }
}

impl KvStore for MemoryStore {
    fn endpoint(&self) -> &str {
        &self.name
    }

    fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, StoreError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if let Some(error) = state.faults.pop_front() {
            return Err(error);
        }
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            let reply = match state.scripted.pop_front() {
                Some(reply) => reply,
                None => {
                    let reply = apply(&mut state.entries, command);
                    if command.is_write() && !matches!(reply, Reply::Error(_)) {
                        state.mutations += 1;
                    }
                    reply
                }
            };
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Applies every command to a copy and commits only when none of them
    /// errored.
    fn transaction(&self, commands: &[Command]) -> Result<Vec<Reply>, StoreError> {
        let mut state = self.state();
        if let Some(error) = state.faults.pop_front() {
            return Err(error);
        }
        if state.fail_transactions {
            return Err(StoreError::TransactionAborted { endpoint: self.name.clone() });
        }
        let mut staged = state.entries.clone();
        let replies = commands.iter().map(|command| apply(&mut staged, command)).collect::<Vec<_>>();
        if replies.iter().any(|reply| matches!(reply, Reply::Error(_))) {
            return Ok(replies);
        }
        state.entries = staged;
        state.mutations += commands.iter().filter(|command| command.is_write()).count();
        Ok(replies)
    }
}

fn apply(entries: &mut BTreeMap<Vec<u8>, StoredEntry>, command: &Command) -> Reply {
    match command {
        Command::Ping => Reply::Status("PONG".to_string()),
        Command::Scan { cursor, count, kind } => scan(entries, *cursor, *count, *kind),
        Command::Get(key) => match entries.get(key.as_bytes()).map(|entry| &entry.value) {
            None => Reply::Nil,
            Some(StoredValue::String(value)) => Reply::Bulk(value.clone()),
            Some(_) => Reply::Error(WRONGTYPE.to_string()),
        },
        Command::MGet(keys) => Reply::Array(
            keys.iter()
                .map(|key| match entries.get(key.as_bytes()).map(|entry| &entry.value) {
                    Some(StoredValue::String(value)) => Reply::Bulk(value.clone()),
                    _ => Reply::Nil,
                })
                .collect(),
        ),
        Command::MSet(pairs) => {
            for (key, value) in pairs {
                entries.insert(
                    key.as_bytes().to_vec(),
                    StoredEntry { value: StoredValue::String(value.clone()), expires_at: None },
                );
            }
            Reply::Status("OK".to_string())
        }
        Command::SMembers(key) => match entries.get(key.as_bytes()).map(|entry| &entry.value) {
            None => Reply::Array(Vec::new()),
            Some(StoredValue::Set(members)) => {
                Reply::Array(members.iter().cloned().map(Reply::Bulk).collect())
            }
            Some(_) => Reply::Error(WRONGTYPE.to_string()),
        },
        Command::SAdd(key, members) => {
            if members.is_empty() {
                return Reply::Error("ERR wrong number of arguments for 'sadd' command".to_string());
            }
            let entry = entries.entry(key.as_bytes().to_vec()).or_insert_with(|| StoredEntry {
                value: StoredValue::Set(BTreeSet::new()),
                expires_at: None,
            });
            let StoredValue::Set(set) = &mut entry.value else {
                return Reply::Error(WRONGTYPE.to_string());
            };
            let added = members.iter().filter(|member| set.insert((*member).clone())).count();
            Reply::Integer(count_reply(added))
        }
        Command::HGetAll(key) => match entries.get(key.as_bytes()).map(|entry| &entry.value) {
            None => Reply::Array(Vec::new()),
            Some(StoredValue::Hash(fields)) => Reply::Array(
                fields
                    .iter()
                    .flat_map(|(field, value)| [Reply::Bulk(field.clone()), Reply::Bulk(value.clone())])
                    .collect(),
            ),
            Some(_) => Reply::Error(WRONGTYPE.to_string()),
        },
        Command::HSet(key, fields) => {
            if fields.is_empty() {
                return Reply::Error("ERR wrong number of arguments for 'hset' command".to_string());
            }
            let entry = entries.entry(key.as_bytes().to_vec()).or_insert_with(|| StoredEntry {
                value: StoredValue::Hash(BTreeMap::new()),
                expires_at: None,
            });
            let StoredValue::Hash(hash) = &mut entry.value else {
                return Reply::Error(WRONGTYPE.to_string());
            };
            let added = fields
                .iter()
                .filter(|(field, value)| hash.insert(field.clone(), value.clone()).is_none())
                .count();
            Reply::Integer(count_reply(added))
        }
        Command::Del(key) => Reply::Integer(i64::from(entries.remove(key.as_bytes()).is_some())),
        Command::PExpireAt(key, at) => match entries.get_mut(key.as_bytes()) {
            Some(entry) => {
                entry.expires_at = Some(*at);
                Reply::Integer(1)
            }
            None => Reply::Integer(0),
        },
        Command::PExpireTime(key) => Reply::Integer(match entries.get(key.as_bytes()) {
            None => Expiration::Missing.as_raw(),
            Some(StoredEntry { expires_at: None, .. }) => Expiration::Persistent.as_raw(),
            Some(StoredEntry { expires_at: Some(at), .. }) => *at,
        }),
    }
}

/// Offset cursor over the ordered keyspace. The `TYPE` filter is applied
/// after the page is cut, so a page can come back short or empty while the
/// cursor is still non-zero.
fn scan(
    entries: &BTreeMap<Vec<u8>, StoredEntry>,
    cursor: u64,
    count: usize,
    kind: Option<KeyKind>,
) -> Reply {
    let start = usize::try_from(cursor).unwrap_or(usize::MAX);
    let count = count.max(1);
    let keys = entries
        .iter()
        .skip(start)
        .take(count)
        .filter(|(_, entry)| match kind {
            Some(kind) => entry.value.kind() == kind,
            None => true,
        })
        .map(|(key, _)| Reply::Bulk(key.clone()))
        .collect();
    let end = start.saturating_add(count);
    let next = if end >= entries.len() { 0 } else { end };
    Reply::Array(vec![Reply::Bulk(next.to_string().into_bytes()), Reply::Array(keys)])
}

fn count_reply(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}
