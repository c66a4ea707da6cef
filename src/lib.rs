// Copyright 2026 Highway RPC Developers

//! Highway: a binary RPC transport over TCP
//!
//! Highway moves request and response frames between a client and a server
//! over long-lived connections. Many calls share one connection; each call
//! is matched to its response by a correlation id.
//!
//! Protocol definition
//!
//! Every Highway frame has the following structure:
//!
//! * MAGIC             7 bytes, the ASCII string "highway".
//!
//! * CORRID0...CORRID7 8-byte big-endian unsigned integer, the correlation id
//!                     of the call this frame belongs to.
//!
//! * TLEN0...TLEN3     4-byte big-endian unsigned integer, the combined length
//!                     of the control header and the body.
//!
//! * HLEN0...HLEN3     4-byte big-endian unsigned integer, the length of the
//!                     control header.
//!
//! * HEADER            The control header, a JSON object whose "type" field
//!                     says whether this is a login, a request or a response.
//!
//! * BODY              Opaque payload of `TLEN - HLEN` bytes.
//!
//! Handshake: the first frame on a new connection is a login message with
//! correlation id 0. The server replies with a response carrying status 200
//! when it accepts the connection; any other reply ends it.
//!
//! Correlation ids: each [`client::ClientRegistry`] allocates ids from its
//! own counter, so calls made through one registry never share an id while
//! outstanding. A call with id `n` through a pool of `N` connections
//! always travels on connection `n % N`.
//!
//! Two client flavors are provided. [`client::ClientRegistry`] multiplexes
//! concurrent calls over a small pool of connections per destination.
//! [`scheduler::Scheduler`] gives each destination a bounded job queue and a
//! set of workers that each run one call at a time on their own connection.

#![allow(missing_docs)]

use slog::{o, Drain, Logger};

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod invocation;
pub mod message;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod transport;

pub use crate::client::{ClientRegistry, Resolver, StaticResolver};
pub use crate::config::{ClientConfig, QueueFullPolicy, SchedulerConfig, ServerConfig};
pub use crate::dispatch::{DispatchError, DispatchResult, Dispatcher, Router};
pub use crate::error::{HighwayError, Result};
pub use crate::message::{Request, Response, STATUS_OK, STATUS_SERVER_ERROR};
pub use crate::protocol::{Frame, HighwayCodec};
pub use crate::scheduler::{JobHandle, Scheduler};
pub use crate::server::{listen, Server};
pub use crate::transport::{Acceptor, Connector};

/// Components take an optional logger; without one they log through the
/// `log` facade.
pub(crate) fn logger_or_stdlog(log: Option<&Logger>) -> Logger {
    log.cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
}
