//! # Dovecote
//!
//! A lightweight publish/subscribe message broker speaking a line-oriented
//! text protocol over TCP.
//!
//! Clients address messages to hierarchical subjects (`foo.bar.baz`) and
//! subscribe with patterns using the single-token wildcard `*` or the
//! trailing multi-token wildcard `>`, optionally load-balanced through
//! queue groups.
//!
//! ## Anatomy
//!
//! - **Parser** (`parser`): resumable byte-level state machine turning
//!   arbitrary TCP fragments into protocol operations
//! - **Subject index** (`dovecote_core::sublist`): wildcard trie with a
//!   bounded match cache
//! - **Sessions** (`session`): per-connection delivery pipeline with
//!   batched flushes, write deadlines, and slow-consumer eviction
//! - **Hub** (`hub`): registry, auth policy, counters, accept loop
//!
//! ## Quick start
//!
//! ```no_run
//! use dovecote::{Hub, ServerOptions};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let hub = Hub::new(ServerOptions::default());
//!     let listener = TcpListener::bind(("127.0.0.1", 4222)).await?;
//!     hub.serve(listener).await
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod dev_tracing;
pub mod hub;
pub mod parser;
pub mod session;

pub use hub::{Hub, HubStats};
pub use session::{ConnectOpts, Session, SessionStats, Subscription};

// Re-export the engine surface downstream users need.
pub use dovecote_core::error::{DovecoteError, Result};
pub use dovecote_core::options::ServerOptions;
pub use dovecote_core::{subject, sublist};
