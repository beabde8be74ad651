use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use drift_repair_core::{
    Command, Expiration, Key, KvStore, Reply, RetryPolicy, StoreError, StoreHandle,
};
use drift_repair_resp::{EndpointConfig, RespStore};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio_util::codec::{Decoder, Encoder};

type Handler = dyn Fn(&[String]) -> Option<BytesFrame> + Send + Sync;

/// Loopback RESP2 server answering each request with `handler`. A `None`
/// answer leaves the client waiting.
struct FakeServer {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<Vec<String>>>>,
    accepted: Arc<AtomicUsize>,
}

impl FakeServer {
    fn start(handler: Box<Handler>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .unwrap_or_else(|err| panic!("failed to bind fake server: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("fake server has no local addr: {err}"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let handler: Arc<Handler> = Arc::from(handler);

        let server_seen = Arc::clone(&seen);
        let server_accepted = Arc::clone(&accepted);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                server_accepted.fetch_add(1, Ordering::SeqCst);
                let handler = Arc::clone(&handler);
                let seen = Arc::clone(&server_seen);
                thread::spawn(move || serve(stream, handler.as_ref(), &seen));
            }
        });
        Self { addr, seen, accepted }
    }

    fn config(&self, path: &str) -> EndpointConfig {
        EndpointConfig {
            command_timeout_ms: 200,
            connect_timeout_ms: 200,
            ..EndpointConfig::with_url(format!("redis://{}{path}", self.addr))
        }
    }

    fn seen_names(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap_or_else(|err| panic!("seen log poisoned: {err}"))
            .iter()
            .map(|args| args[0].clone())
            .collect()
    }
}

fn serve(mut stream: std::net::TcpStream, handler: &Handler, seen: &Mutex<Vec<Vec<String>>>) {
    let mut codec = Resp2::default();
    let mut buf = BytesMut::new();
    let mut chunk = [0_u8; 4096];
    loop {
        match codec.decode(&mut buf) {
            Ok(Some(BytesFrame::Array(parts))) => {
                let args = parts
                    .into_iter()
                    .map(|part| match part {
                        BytesFrame::BulkString(raw) => String::from_utf8_lossy(&raw).into_owned(),
                        other => format!("{other:?}"),
                    })
                    .collect::<Vec<_>>();
                seen.lock().unwrap_or_else(|err| panic!("seen log poisoned: {err}")).push(args.clone());
                let Some(reply) = handler(&args) else { continue };
                let mut out = BytesMut::new();
                if codec.encode(reply, &mut out).is_err() || stream.write_all(&out).is_err() {
                    return;
                }
            }
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(read) => buf.extend_from_slice(&chunk[..read]),
            },
        }
    }
}

fn ok() -> Option<BytesFrame> {
    Some(BytesFrame::SimpleString(Bytes::from_static(b"OK")))
}

fn default_handler(args: &[String]) -> Option<BytesFrame> {
    match args[0].as_str() {
        "PING" => Some(BytesFrame::SimpleString(Bytes::from_static(b"PONG"))),
        "AUTH" | "SELECT" => ok(),
        "PEXPIRETIME" if args[1] == "gone" => Some(BytesFrame::Integer(-2)),
        "PEXPIRETIME" => Some(BytesFrame::Integer(1_000)),
        "PEXPIREAT" => Some(BytesFrame::Integer(1)),
        "GET" => Some(BytesFrame::Error("ERR boom".into())),
        "MULTI" => ok(),
        "DEL" | "SADD" | "HSET" => Some(BytesFrame::SimpleString(Bytes::from_static(b"QUEUED"))),
        "EXEC" => Some(BytesFrame::Array(vec![BytesFrame::Integer(1), BytesFrame::Integer(3)])),
        _ => Some(BytesFrame::Error("ERR unknown command".into())),
    }
}

#[test]
fn pipeline_replies_come_back_in_request_order() -> Result<(), StoreError> {
    let server = FakeServer::start(Box::new(default_handler));
    let store = RespStore::new(&server.config(""))
        .unwrap_or_else(|err| panic!("store config rejected: {err}"));
    let handle = StoreHandle::new(&store, RetryPolicy::none());

    let expirations = handle.expiration_times(&[Key::from("a"), Key::from("gone"), Key::from("b")])?;

    assert_eq!(expirations, vec![Expiration::At(1_000), Expiration::Missing, Expiration::At(1_000)]);
    Ok(())
}

#[test]
fn auth_and_select_precede_the_first_command() -> Result<(), StoreError> {
    let server = FakeServer::start(Box::new(default_handler));
    let mut config = server.config("/3");
    config.url = config.url.replace("redis://", "redis://ops:p%40ss@");
    let store = RespStore::new(&config).unwrap_or_else(|err| panic!("store config rejected: {err}"));

    store.execute(&Command::Ping)?;

    let seen = server.seen.lock().unwrap_or_else(|err| panic!("seen log poisoned: {err}")).clone();
    assert_eq!(seen[0], ["AUTH", "ops", "p@ss"]);
    assert_eq!(seen[1], ["SELECT", "3"]);
    assert_eq!(seen[2], ["PING"]);
    assert_eq!(store.endpoint(), format!("redis://{}/3", server.addr));
    Ok(())
}

#[test]
fn connections_are_reused_between_calls() -> Result<(), StoreError> {
    let server = FakeServer::start(Box::new(default_handler));
    let store = RespStore::new(&server.config("")).unwrap_or_else(|err| panic!("{err}"));

    for _ in 0..5 {
        store.execute(&Command::Ping)?;
    }

    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn replace_set_runs_inside_multi_exec() -> Result<(), StoreError> {
    let server = FakeServer::start(Box::new(default_handler));
    let store = RespStore::new(&server.config("")).unwrap_or_else(|err| panic!("{err}"));
    let handle = StoreHandle::new(&store, RetryPolicy::none());

    handle.replace_set(&Key::from("s"), &[b"1".to_vec(), b"2".to_vec(), b"3".to_vec()], None)?;

    assert_eq!(server.seen_names(), ["MULTI", "DEL", "SADD", "EXEC"]);
    Ok(())
}

#[test]
fn discarded_transaction_is_reported_as_aborted() {
    let server = FakeServer::start(Box::new(|args: &[String]| match args[0].as_str() {
        "EXEC" => Some(BytesFrame::Null),
        _ => default_handler(args),
    }));
    let store = RespStore::new(&server.config("")).unwrap_or_else(|err| panic!("{err}"));

    let result = store.transaction(&[
        Command::Del(Key::from("h")),
        Command::HSet(Key::from("h"), vec![(b"f".to_vec(), b"v".to_vec())]),
    ]);

    assert!(matches!(result, Err(StoreError::TransactionAborted { .. })));
}

#[test]
fn server_errors_are_replies_not_transport_failures() -> Result<(), StoreError> {
    let server = FakeServer::start(Box::new(default_handler));
    let store = RespStore::new(&server.config("")).unwrap_or_else(|err| panic!("{err}"));

    let reply = store.execute(&Command::Get(Key::from("k")))?;

    assert_eq!(reply, Reply::Error("ERR boom".to_string()));
    Ok(())
}

#[test]
fn silent_server_times_out() {
    let server = FakeServer::start(Box::new(|args: &[String]| match args[0].as_str() {
        "PING" => None,
        _ => default_handler(args),
    }));
    let mut config = server.config("");
    config.command_timeout_ms = 50;
    let store = RespStore::new(&config).unwrap_or_else(|err| panic!("{err}"));

    let result = store.execute(&Command::Ping);

    match result {
        Err(err) => {
            assert!(matches!(err, StoreError::Timeout { .. }), "unexpected error: {err}");
            assert!(err.is_transient());
        }
        Ok(reply) => panic!("expected a timeout, got {reply:?}"),
    }
}

#[test]
fn refused_connection_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|err| panic!("{err}"));
    let addr = listener.local_addr().unwrap_or_else(|err| panic!("{err}"));
    drop(listener);
    thread::sleep(Duration::from_millis(10));
    let store = RespStore::new(&EndpointConfig::with_url(format!("redis://{addr}")))
        .unwrap_or_else(|err| panic!("{err}"));

    match store.execute(&Command::Ping) {
        Err(err) => assert!(err.is_transient(), "unexpected error: {err}"),
        Ok(reply) => panic!("expected connection failure, got {reply:?}"),
    }
}
