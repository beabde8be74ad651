use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use drift_repair_core::{Reply, StoreError};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio_util::codec::{Decoder, Encoder};

use crate::Endpoint;

const READ_CHUNK: usize = 16 * 1024;

/// One blocking RESP2 connection.
///
/// Requests are framed with the same codec the async servers use; the
/// socket itself is a plain `std` stream with read and write timeouts, so a
/// silent server surfaces as [`StoreError::Timeout`].
pub struct RespConnection {
    stream: TcpStream,
    codec: Resp2,
    read_buf: BytesMut,
    label: String,
}

impl RespConnection {
    /// Connect, then authenticate and select the database when the endpoint
    /// asks for it.
    ///
    /// # Errors
    /// Returns an error when no resolved address accepts the connection in
    /// time or the handshake is refused.
    pub fn connect(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let label = endpoint.label();
        let addrs = endpoint
            .address()
            .to_socket_addrs()
            .map_err(|err| io_error(&label, &err))?
            .collect::<Vec<_>>();

        let mut last_err = StoreError::Io {
            endpoint: label.clone(),
            message: "address resolved to nothing".to_string(),
        };
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(command_timeout)).map_err(|err| io_error(&label, &err))?;
                    stream.set_write_timeout(Some(command_timeout)).map_err(|err| io_error(&label, &err))?;
                    stream.set_nodelay(true).map_err(|err| io_error(&label, &err))?;
                    let mut conn = Self {
                        stream,
                        codec: Resp2::default(),
                        read_buf: BytesMut::with_capacity(READ_CHUNK),
                        label,
                    };
                    conn.handshake(endpoint)?;
                    tracing::debug!(endpoint = %conn.label, %addr, "connection opened");
                    return Ok(conn);
                }
                Err(err) => last_err = io_error(&label, &err),
            }
        }
        Err(last_err)
    }

    fn handshake(&mut self, endpoint: &Endpoint) -> Result<(), StoreError> {
        if let Some(password) = &endpoint.password {
            let mut auth = vec![b"AUTH".to_vec()];
            if let Some(username) = &endpoint.username {
                auth.push(username.as_bytes().to_vec());
            }
            auth.push(password.as_bytes().to_vec());
            self.expect_ok("AUTH", auth)?;
        }
        if let Some(db) = endpoint.db {
            self.expect_ok("SELECT", vec![b"SELECT".to_vec(), db.to_string().into_bytes()])?;
        }
        Ok(())
    }

    fn expect_ok(&mut self, command: &'static str, args: Vec<Vec<u8>>) -> Result<(), StoreError> {
        let mut replies = self.round_trip(vec![args])?;
        match replies.pop() {
            Some(Reply::Status(_)) => Ok(()),
            Some(Reply::Error(message)) => Err(StoreError::Server(message)),
            other => Err(StoreError::UnexpectedReply { command, detail: format!("{other:?}") }),
        }
    }

    /// Write every request, then read exactly one reply per request.
    ///
    /// # Errors
    /// Returns an error on socket failure, timeout, or a malformed frame. The
    /// connection must not be reused after an error.
    pub fn round_trip(&mut self, requests: Vec<Vec<Vec<u8>>>) -> Result<Vec<Reply>, StoreError> {
        let expected = requests.len();
        let mut out = BytesMut::new();
        for args in requests {
            let frame =
                BytesFrame::Array(args.into_iter().map(|arg| BytesFrame::BulkString(Bytes::from(arg))).collect());
            self.codec
                .encode(frame, &mut out)
                .map_err(|err| StoreError::Protocol(err.to_string()))?;
        }
        self.stream.write_all(&out).map_err(|err| io_error(&self.label, &err))?;
        self.stream.flush().map_err(|err| io_error(&self.label, &err))?;

        let mut replies = Vec::with_capacity(expected);
        while replies.len() < expected {
            replies.push(reply_from_frame(self.read_frame()?));
        }
        Ok(replies)
    }

    fn read_frame(&mut self) -> Result<BytesFrame, StoreError> {
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            if let Some(frame) = self
                .codec
                .decode(&mut self.read_buf)
                .map_err(|err| StoreError::Protocol(err.to_string()))?
            {
                return Ok(frame);
            }
            let read = self.stream.read(&mut chunk).map_err(|err| io_error(&self.label, &err))?;
            if read == 0 {
                return Err(StoreError::Io {
                    endpoint: self.label.clone(),
                    message: "connection closed by peer".to_string(),
                });
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }
}

pub(crate) fn reply_from_frame(frame: BytesFrame) -> Reply {
    match frame {
        BytesFrame::SimpleString(raw) => Reply::Status(String::from_utf8_lossy(&raw).into_owned()),
        BytesFrame::Error(message) => Reply::Error(message.to_string()),
        BytesFrame::Integer(value) => Reply::Integer(value),
        BytesFrame::BulkString(raw) => Reply::Bulk(raw.to_vec()),
        BytesFrame::Array(items) => Reply::Array(items.into_iter().map(reply_from_frame).collect()),
        BytesFrame::Null => Reply::Nil,
    }
}

fn io_error(label: &str, err: &io::Error) -> StoreError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            StoreError::Timeout { endpoint: label.to_string() }
        }
        _ => StoreError::Io { endpoint: label.to_string(), message: err.to_string() },
    }
}
