use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use drift_repair_core::{Command, KvStore, Reply, StoreError};

use crate::{Endpoint, EndpointConfig, RespConnection};

/// [`KvStore`] over RESP2 with a small pool of reusable connections.
///
/// Connections are opened lazily. One that failed mid-call is dropped rather
/// than returned to the pool, since its read buffer may hold a partial reply.
pub struct RespStore {
    endpoint: Endpoint,
    label: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    pool_size: usize,
    idle: Mutex<Vec<RespConnection>>,
}

impl RespStore {
    /// # Errors
    /// Returns an error when the configured URL is invalid.
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let endpoint = Endpoint::parse(&config.url)?;
        Ok(Self {
            label: endpoint.label(),
            endpoint,
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
            pool_size: config.pool_size.max(1),
            idle: Mutex::new(Vec::new()),
        })
    }

    fn with_connection<T>(
        &self,
        call: impl FnOnce(&mut RespConnection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let pooled = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => RespConnection::connect(&self.endpoint, self.connect_timeout, self.command_timeout)?,
        };
        let result = call(&mut conn);
        if result.is_ok() {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < self.pool_size {
                idle.push(conn);
            }
        } else {
            tracing::debug!(endpoint = %self.label, "dropping connection after failed call");
        }
        result
    }
}

impl KvStore for RespStore {
    fn endpoint(&self) -> &str {
        &self.label
    }

    fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, StoreError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let requests = commands.iter().map(Command::to_args).collect::<Vec<_>>();
        self.with_connection(|conn| conn.round_trip(requests))
    }

    /// Wraps the commands in `MULTI`/`EXEC`. A queueing error aborts the
    /// whole transaction; a nil `EXEC` reply means it was discarded.
    fn transaction(&self, commands: &[Command]) -> Result<Vec<Reply>, StoreError> {
        let mut requests = Vec::with_capacity(commands.len() + 2);
        requests.push(vec![b"MULTI".to_vec()]);
        requests.extend(commands.iter().map(Command::to_args));
        requests.push(vec![b"EXEC".to_vec()]);

        let mut replies = self.with_connection(|conn| conn.round_trip(requests))?;
        let exec = replies.pop();
        for reply in replies {
            match reply {
                Reply::Status(_) => {}
                Reply::Error(message) => return Err(StoreError::Server(message)),
                other => {
                    return Err(StoreError::UnexpectedReply {
                        command: "MULTI",
                        detail: format!("{other:?}"),
                    })
                }
            }
        }
        match exec {
            Some(Reply::Array(results)) if results.len() == commands.len() => Ok(results),
            Some(Reply::Array(results)) => Err(StoreError::UnexpectedReply {
                command: "EXEC",
                detail: format!("expected {} results, got {}", commands.len(), results.len()),
            }),
            Some(Reply::Nil) => Err(StoreError::TransactionAborted { endpoint: self.label.clone() }),
            Some(Reply::Error(message)) => Err(StoreError::Server(message)),
            other => Err(StoreError::UnexpectedReply { command: "EXEC", detail: format!("{other:?}") }),
        }
    }
}
