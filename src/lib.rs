//! Asynchronous Redis client with pipelining, MULTI/EXEC transactions and
//! a fixed-size connection pool.
//!
//! Every connection is pinned to its own tokio task which exclusively owns
//! the socket; callers talk to it through a channel, so replies always come
//! back in submission order and a connection never has more than one
//! command in flight.
//!
//! # Example
//! Issue a couple of commands over a single connection.
//!
//! ```no_run
//! use redic::{create_client, Commands, RedisConfig};
//!
//! # async fn example() -> redic::RedisResult<()> {
//! let client = create_client(RedisConfig::default());
//! client.wait_ready().await?;
//! client.set("greeting", "hello").await?;
//! let reply = client.get("greeting").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example
//! Run a transaction through a pool; the whole MULTI/EXEC block rides a
//! single reserved connection.
//!
//! ```no_run
//! use redic::{create_pool, RedisConfig};
//!
//! # async fn example() -> redic::RedisResult<()> {
//! let pool = create_pool(RedisConfig::default());
//! pool.wait_connected().await?;
//! let replies = pool.pmulti().set("x", "1").incr("x").get("x").send().await?;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod commands;
pub mod config;
pub mod connection;
mod framer;
pub mod pipeline;
pub mod pool;
pub mod resp;

pub use commands::{Command, Commands, SetOptions};
pub use config::{Options, RedisConfig};
pub use connection::{Connection, Event};
pub use pipeline::Pipeline;
pub use pool::{Pool, PoolEvent, PooledConnection};
pub use resp::Value;

/// Errors surfaced by the client.
#[derive(Error, Debug)]
pub enum Error {
    /// TCP connect failed or timed out.
    #[error("connect error: {0}")]
    Connect(String),
    /// The socket failed mid-session, or the connection is gone.
    #[error("transport error: {0}")]
    Transport(String),
    /// The reply stream could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),
    /// The call itself was invalid.
    #[error("usage error: {0}")]
    Usage(String),
}

impl Error {
    pub(crate) fn connect(msg: impl Into<String>) -> Error {
        Error::Connect(msg.into())
    }

    pub(crate) fn transport(msg: impl Into<String>) -> Error {
        Error::Transport(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Error {
        Error::Protocol(msg.into())
    }

    pub(crate) fn server(msg: impl Into<String>) -> Error {
        Error::Server(msg.into())
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Error {
        Error::Usage(msg.into())
    }
}

pub type RedisResult<T> = Result<T, Error>;

/// Creates a client backed by a single connection. The connection task is
/// spawned immediately; commands submitted before the TCP connect finishes
/// are queued and served once it does.
pub fn create_client(config: RedisConfig) -> Connection {
    Connection::spawn(config.host, config.port, config.options, None)
}

/// Creates a pool of `config.pool_size` connections, all connecting
/// concurrently. Commands are routed to the first idle member.
pub fn create_pool(config: RedisConfig) -> Pool {
    let size = config.pool_size.unwrap_or(config::DEFAULT_POOL_SIZE);
    Pool::spawn(config.host, config.port, config.options, size)
}
