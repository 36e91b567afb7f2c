//! Building blocks: wire codec, retention buffers, clocks, configuration.
//!
//! Nothing in here touches a socket; the [`crate::ipc`] layer wires these
//! pieces to the transport.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod retention;
pub mod wire;

pub use clock::{steady_clock_us, system_clock_us, Clock, ManualClock, QuantaClock, SyncedClock, SystemClock};
pub use config::{RequesterConfig, ResponderConfig, TopicConfig};
pub use entry::{unzip_entries, Entry, Payload};
pub use error::{Error, Result};
pub use retention::{RetentionBuffer, TopicRegistry};
pub use wire::{Command, End, EndSelector, Message};
