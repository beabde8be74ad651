//! RESP2 client for the drift-repair reconcilers.

mod connection;
mod endpoint;
mod store;

pub use connection::RespConnection;
pub use endpoint::{
    Endpoint, EndpointConfig, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_POOL_SIZE, DEFAULT_PORT,
};
pub use store::RespStore;
