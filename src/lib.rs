//! Time-bounded topic buffers shared between processes over request/reply
//! sockets.
//!
//! A producer registers topics on a [`Responder`] and stores timestamped
//! payloads; each topic keeps only entries within its retention window.
//! Consumers use a [`Requester`] to peek at or pop entries from either end.

pub mod core;
pub mod ipc;

pub use crate::core::{
    unzip_entries, Clock, Command, End, Entry, Error, Payload, RequesterConfig,
    ResponderConfig, Result, SyncedClock, TopicConfig,
};
pub use crate::ipc::{Endpoint, RequestHandler, Requester, Responder};
