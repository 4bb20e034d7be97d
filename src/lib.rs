//! Pooled FreeSWITCH Event Socket (ESL) transport for Rust
//!
//! This crate keeps a bounded pool of authenticated ESL connections to one
//! FreeSWITCH node and fans decoded events out to registered callbacks.
//!
//! # Architecture
//!
//! - [`protocol`]: frame reading and writing (blank-line-terminated headers,
//!   optional `Content-Length` body)
//! - [`Transport`]: one authenticated socket, one frame at a time
//! - [`Pool`]: bounded acquire/release with backpressure, background health
//!   checks and idle eviction
//! - [`EventDispatcher`]: listener fan-out on a fixed set of worker tasks
//! - [`EventProcessor`]: [`Decoder`] + dispatcher + per-event handlers
//! - [`EslClient`]: `api` / `bgapi` / `send` over the pool
//!
//! # Examples
//!
//! ## Commands
//!
//! ```rust,no_run
//! use freeswitch_esl_pool::{EslClient, EslError, PoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let mut config = PoolConfig::new("localhost", 8021);
//!     config.max_open = 4;
//!     config.max_idle = 2;
//!
//!     let client = EslClient::connect(config).await?;
//!     let response = client.api("status").await?;
//!     println!("Status: {}", response.body().unwrap_or("No body"));
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Raw transports
//!
//! ```rust,no_run
//! use freeswitch_esl_pool::{EslError, Pool, PoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let pool = Pool::new(PoolConfig::new("localhost", 8021)).await?;
//!
//!     let transport = pool.get().await?;
//!     transport.write_frame(b"api uptime").await?;
//!     let frame = transport.read_frame().await?;
//!     println!("{}", String::from_utf8_lossy(frame.body()));
//!     pool.put(transport).await;
//!
//!     println!("{:?}", pool.stats());
//!     pool.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Events
//!
//! ```rust,no_run
//! use freeswitch_esl_pool::EventProcessor;
//!
//! #[tokio::main]
//! async fn main() {
//!     let processor = EventProcessor::with_defaults();
//!
//!     processor.dispatcher().register("*", |event| {
//!         println!("event: {}", event.name());
//!     });
//!     processor.register_handler("CHANNEL_HANGUP", |event| async move {
//!         println!("hangup: {}", event.unique_id().unwrap_or("?"));
//!     });
//!
//!     let frame = b"Content-Length: 28\nContent-Type: text/event-plain\n\nEvent-Name: CHANNEL_HANGUP\n\n";
//!     processor.process(frame).await.unwrap();
//! }
//! ```

#[macro_use]
mod macros;

pub mod client;
pub mod command;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod headers;
pub mod pool;
pub mod processor;
pub mod protocol;
pub mod transport;

pub use client::{ClientOptions, EslClient};
pub use command::{Command, CommandResult, CommandType, EslResponse, ReplyStatus};
pub use config::PoolConfig;
pub use constants::{DEFAULT_ESL_PASSWORD, DEFAULT_ESL_PORT};
pub use decoder::{Decoder, EslDecoder};
pub use dispatcher::{DispatcherConfig, EventDispatcher, Listener};
pub use error::{EslError, EslResult};
pub use event::EslEvent;
pub use headers::{ContentType, Header};
pub use pool::{Pool, PoolStats};
pub use processor::{EventHandler, EventProcessor};
pub use protocol::Frame;
pub use tokio_util::sync::CancellationToken;
pub use transport::Transport;
