use crate::{Expiration, Key, KeyKind, RetryPolicy, StoreError};

/// Commands the reconcilers issue against either store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    Ping,
    Scan { cursor: u64, count: usize, kind: Option<KeyKind> },
    Get(Key),
    MGet(Vec<Key>),
    MSet(Vec<(Key, Vec<u8>)>),
    SMembers(Key),
    SAdd(Key, Vec<Vec<u8>>),
    HGetAll(Key),
    HSet(Key, Vec<(Vec<u8>, Vec<u8>)>),
    Del(Key),
    PExpireAt(Key, i64),
    PExpireTime(Key),
}

impl Command {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Scan { .. } => "SCAN",
            Self::Get(_) => "GET",
            Self::MGet(_) => "MGET",
            Self::MSet(_) => "MSET",
            Self::SMembers(_) => "SMEMBERS",
            Self::SAdd(..) => "SADD",
            Self::HGetAll(_) => "HGETALL",
            Self::HSet(..) => "HSET",
            Self::Del(_) => "DEL",
            Self::PExpireAt(..) => "PEXPIREAT",
            Self::PExpireTime(_) => "PEXPIRETIME",
        }
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::MSet(_) | Self::SAdd(..) | Self::HSet(..) | Self::Del(_) | Self::PExpireAt(..)
        )
    }

    /// Wire arguments, command name first.
    #[must_use]
    pub fn to_args(&self) -> Vec<Vec<u8>> {
        let mut args = vec![self.name().as_bytes().to_vec()];
        match self {
            Self::Ping => {}
            Self::Scan { cursor, count, kind } => {
                args.push(cursor.to_string().into_bytes());
                args.push(b"COUNT".to_vec());
                args.push(count.to_string().into_bytes());
                if let Some(kind) = kind {
                    args.push(b"TYPE".to_vec());
                    args.push(kind.as_str().as_bytes().to_vec());
                }
            }
            Self::Get(key)
            | Self::SMembers(key)
            | Self::HGetAll(key)
            | Self::Del(key)
            | Self::PExpireTime(key) => args.push(key.as_bytes().to_vec()),
            Self::MGet(keys) => args.extend(keys.iter().map(|key| key.as_bytes().to_vec())),
            Self::MSet(pairs) => {
                for (key, value) in pairs {
                    args.push(key.as_bytes().to_vec());
                    args.push(value.clone());
                }
            }
            Self::SAdd(key, members) => {
                args.push(key.as_bytes().to_vec());
                args.extend(members.iter().cloned());
            }
            Self::HSet(key, fields) => {
                args.push(key.as_bytes().to_vec());
                for (field, value) in fields {
                    args.push(field.clone());
                    args.push(value.clone());
                }
            }
            Self::PExpireAt(key, at) => {
                args.push(key.as_bytes().to_vec());
                args.push(at.to_string().into_bytes());
            }
        }
        args
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Reply {
    Nil,
    Status(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Array(Vec<Reply>),
    Error(String),
}

/// Store client seam. Implementations must return exactly one reply per
/// command, in request order. Server error replies are returned as
/// [`Reply::Error`]; only transport or framing failures surface as `Err`.
pub trait KvStore: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Send every command without waiting for individual replies.
    ///
    /// # Errors
    /// Returns an error when the round-trip fails as a whole.
    fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, StoreError>;

    /// Run every command atomically; either all apply or none do.
    ///
    /// # Errors
    /// Returns an error when the transaction is rejected, aborted, or the
    /// round-trip fails.
    fn transaction(&self, commands: &[Command]) -> Result<Vec<Reply>, StoreError>;

    /// # Errors
    /// Returns an error when the round-trip fails.
    fn execute(&self, command: &Command) -> Result<Reply, StoreError> {
        let mut replies = self.pipeline(std::slice::from_ref(command))?;
        match (replies.pop(), replies.is_empty()) {
            (Some(reply), true) => Ok(reply),
            _ => Err(StoreError::UnexpectedReply {
                command: command.name(),
                detail: "expected exactly one reply".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<Key>,
}

/// Typed, retrying view over a [`KvStore`].
#[derive(Clone, Copy)]
pub struct StoreHandle<'a> {
    store: &'a dyn KvStore,
    retry: RetryPolicy,
}

impl<'a> StoreHandle<'a> {
    #[must_use]
    pub fn new(store: &'a dyn KvStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.store.endpoint()
    }

    /// # Errors
    /// Returns an error when the store cannot be reached.
    pub fn ping(&self) -> Result<(), StoreError> {
        let reply = self.retry.run("PING", self.endpoint(), || self.store.execute(&Command::Ping))?;
        match reply {
            Reply::Status(_) | Reply::Bulk(_) => Ok(()),
            other => Err(unexpected("PING", &other)),
        }
    }

    /// # Errors
    /// Returns an error when the scan call fails or the reply is malformed.
    pub fn scan(
        &self,
        cursor: u64,
        count: usize,
        kind: Option<KeyKind>,
    ) -> Result<ScanPage, StoreError> {
        let command = Command::Scan { cursor, count, kind };
        let reply = self.retry.run("SCAN", self.endpoint(), || self.store.execute(&command))?;
        parse_scan(reply)
    }

    /// Pipelined `PEXPIRETIME` for every key, replies in key order.
    ///
    /// # Errors
    /// Returns an error when the pipeline fails or any reply is not a valid
    /// expiration.
    pub fn expiration_times(&self, keys: &[Key]) -> Result<Vec<Expiration>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let commands = keys.iter().cloned().map(Command::PExpireTime).collect::<Vec<_>>();
        let replies = self.pipeline_exact("PEXPIRETIME", &commands)?;
        replies
            .into_iter()
            .map(|reply| match reply {
                Reply::Integer(raw) => Expiration::from_raw(raw)
                    .ok_or_else(|| unexpected("PEXPIRETIME", &Reply::Integer(raw))),
                other => Err(reply_error("PEXPIRETIME", other)),
            })
            .collect()
    }

    /// Pipelined `PEXPIREAT` for every `(key, epoch_ms)` pair.
    ///
    /// # Errors
    /// Returns an error when the pipeline fails or any reply is an error.
    pub fn expire_at_all(&self, updates: &[(Key, i64)]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let commands = updates
            .iter()
            .map(|(key, at)| Command::PExpireAt(key.clone(), *at))
            .collect::<Vec<_>>();
        let replies = self.pipeline_exact("PEXPIREAT", &commands)?;
        for reply in replies {
            match reply {
                Reply::Integer(_) => {}
                other => return Err(reply_error("PEXPIREAT", other)),
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the call fails or the reply is malformed.
    pub fn multi_get(&self, keys: &[Key]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let command = Command::MGet(keys.to_vec());
        let reply = self.retry.run("MGET", self.endpoint(), || self.store.execute(&command))?;
        let Reply::Array(items) = reply else {
            return Err(reply_error("MGET", reply));
        };
        if items.len() != keys.len() {
            return Err(StoreError::UnexpectedReply {
                command: "MGET",
                detail: format!("expected {} values, got {}", keys.len(), items.len()),
            });
        }
        items
            .into_iter()
            .map(|item| match item {
                Reply::Bulk(value) => Ok(Some(value)),
                Reply::Nil => Ok(None),
                other => Err(reply_error("MGET", other)),
            })
            .collect()
    }

    /// # Errors
    /// Returns an error when the call fails or the store rejects the write.
    pub fn multi_set(&self, pairs: &[(Key, Vec<u8>)]) -> Result<(), StoreError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let command = Command::MSet(pairs.to_vec());
        let reply = self.retry.run("MSET", self.endpoint(), || self.store.execute(&command))?;
        match reply {
            Reply::Status(_) => Ok(()),
            other => Err(reply_error("MSET", other)),
        }
    }

    /// # Errors
    /// Returns an error when the call fails or the reply is malformed.
    pub fn members(&self, key: &Key) -> Result<Vec<Vec<u8>>, StoreError> {
        let command = Command::SMembers(key.clone());
        let reply = self.retry.run("SMEMBERS", self.endpoint(), || self.store.execute(&command))?;
        let Reply::Array(items) = reply else {
            return Err(reply_error("SMEMBERS", reply));
        };
        items
            .into_iter()
            .map(|item| match item {
                Reply::Bulk(member) => Ok(member),
                other => Err(reply_error("SMEMBERS", other)),
            })
            .collect()
    }

    /// # Errors
    /// Returns an error when the call fails or the reply is malformed.
    pub fn all_fields(&self, key: &Key) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let command = Command::HGetAll(key.clone());
        let reply = self.retry.run("HGETALL", self.endpoint(), || self.store.execute(&command))?;
        let Reply::Array(items) = reply else {
            return Err(reply_error("HGETALL", reply));
        };
        if items.len() % 2 != 0 {
            return Err(StoreError::UnexpectedReply {
                command: "HGETALL",
                detail: format!("odd number of elements ({})", items.len()),
            });
        }
        let mut fields = Vec::with_capacity(items.len() / 2);
        let mut items = items.into_iter();
        while let (Some(field), Some(value)) = (items.next(), items.next()) {
            match (field, value) {
                (Reply::Bulk(field), Reply::Bulk(value)) => fields.push((field, value)),
                (other, _) => return Err(reply_error("HGETALL", other)),
            }
        }
        Ok(fields)
    }

    /// `MSET` plus one `PEXPIREAT` per entry of `expirations`, in a single
    /// transaction. Without expirations this is a plain [`Self::multi_set`].
    ///
    /// # Errors
    /// Returns an error when the write fails; the slice is then unchanged.
    pub fn multi_set_expiring(
        &self,
        pairs: &[(Key, Vec<u8>)],
        expirations: &[(Key, i64)],
    ) -> Result<(), StoreError> {
        if expirations.is_empty() {
            return self.multi_set(pairs);
        }
        let mut commands = Vec::with_capacity(expirations.len() + 1);
        commands.push(Command::MSet(pairs.to_vec()));
        commands.extend(expirations.iter().map(|(key, at)| Command::PExpireAt(key.clone(), *at)));
        self.replace("MSET", &commands)
    }

    /// Atomically replace the set at `key` with exactly `members`, expiring
    /// at `expires_at` when given.
    ///
    /// # Errors
    /// Returns an error when the transaction fails; the key is then unchanged.
    pub fn replace_set(
        &self,
        key: &Key,
        members: &[Vec<u8>],
        expires_at: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut commands = vec![Command::Del(key.clone()), Command::SAdd(key.clone(), members.to_vec())];
        commands.extend(expires_at.map(|at| Command::PExpireAt(key.clone(), at)));
        self.replace("SADD", &commands)
    }

    /// Atomically replace the hash at `key` with exactly `fields`, expiring
    /// at `expires_at` when given.
    ///
    /// # Errors
    /// Returns an error when the transaction fails; the key is then unchanged.
    pub fn replace_hash(
        &self,
        key: &Key,
        fields: &[(Vec<u8>, Vec<u8>)],
        expires_at: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut commands = vec![Command::Del(key.clone()), Command::HSet(key.clone(), fields.to_vec())];
        commands.extend(expires_at.map(|at| Command::PExpireAt(key.clone(), at)));
        self.replace("HSET", &commands)
    }

    fn replace(&self, name: &'static str, commands: &[Command]) -> Result<(), StoreError> {
        let replies =
            self.retry.run(name, self.endpoint(), || self.store.transaction(commands))?;
        if replies.len() != commands.len() {
            return Err(StoreError::UnexpectedReply {
                command: name,
                detail: format!("expected {} replies, got {}", commands.len(), replies.len()),
            });
        }
        for reply in replies {
            if let Reply::Error(message) = reply {
                return Err(StoreError::Server(message));
            }
        }
        Ok(())
    }

    fn pipeline_exact(
        &self,
        name: &'static str,
        commands: &[Command],
    ) -> Result<Vec<Reply>, StoreError> {
        let replies = self.retry.run(name, self.endpoint(), || self.store.pipeline(commands))?;
        if replies.len() != commands.len() {
            return Err(StoreError::UnexpectedReply {
                command: name,
                detail: format!("sent {} commands, got {} replies", commands.len(), replies.len()),
            });
        }
        Ok(replies)
    }
}

fn parse_scan(reply: Reply) -> Result<ScanPage, StoreError> {
    let Reply::Array(mut parts) = reply else {
        return Err(reply_error("SCAN", reply));
    };
    if parts.len() != 2 {
        return Err(StoreError::UnexpectedReply {
            command: "SCAN",
            detail: format!("expected [cursor, keys], got {} elements", parts.len()),
        });
    }
    let keys = parts.pop();
    let cursor = parts.pop();
    let cursor = match cursor {
        Some(Reply::Bulk(raw)) => std::str::from_utf8(&raw)
            .ok()
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or_else(|| StoreError::UnexpectedReply {
                command: "SCAN",
                detail: "cursor is not an unsigned integer".to_string(),
            })?,
        Some(Reply::Integer(raw)) => u64::try_from(raw).map_err(|_| StoreError::UnexpectedReply {
            command: "SCAN",
            detail: format!("negative cursor {raw}"),
        })?,
        Some(other) => return Err(reply_error("SCAN", other)),
        None => return Err(reply_error("SCAN", Reply::Nil)),
    };
    let Some(Reply::Array(items)) = keys else {
        return Err(StoreError::UnexpectedReply {
            command: "SCAN",
            detail: "key list is not an array".to_string(),
        });
    };
    let keys = items
        .into_iter()
        .map(|item| match item {
            Reply::Bulk(raw) => Ok(Key::new(raw)),
            other => Err(reply_error("SCAN", other)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ScanPage { cursor, keys })
}

fn reply_error(command: &'static str, reply: Reply) -> StoreError {
    match reply {
        Reply::Error(message) => StoreError::Server(message),
        other => unexpected(command, &other),
    }
}

fn unexpected(command: &'static str, reply: &Reply) -> StoreError {
    StoreError::UnexpectedReply { command, detail: format!("{reply:?}") }
}
