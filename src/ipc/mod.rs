//! Request/reply serving of topic buffers between processes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Applications (producers, consumers, CLI)                │
//! ├──────────────────────────────────────────────────────────┤
//! │  Responder / Requester                ← YOU ARE HERE     │
//! ├──────────────────────────────────────────────────────────┤
//! │  Transport (length-framed TCP and Unix sockets)          │
//! ├──────────────────────────────────────────────────────────┤
//! │  Core (wire codec, retention buffers, synced clock)      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`Responder`] owns named topics and answers requests on a background
//! thread. A [`Requester`] sends one request at a time and waits for its reply.
//!
//! ```no_run
//! use feedwire::core::End;
//! use feedwire::ipc::{Requester, Responder};
//!
//! // Producer process
//! let responder = Responder::bind("camera", "ipc:///tmp/feeds/camera")?;
//! responder.add_topic("frame", 1.0)?;
//! responder.put("frame", &b"jpeg bytes"[..])?;
//!
//! // Consumer process
//! let mut requester = Requester::connect("viewer", "ipc:///tmp/feeds/camera")?;
//! for entry in requester.peek("frame", End::Latest, 1)? {
//!     println!("{} bytes at t={}", entry.payload.len(), entry.timestamp);
//! }
//! # Ok::<(), feedwire::core::Error>(())
//! ```

pub mod requester;
pub mod responder;
pub mod transport;

pub use requester::Requester;
pub use responder::{RequestHandler, Responder, UNKNOWN_TOPIC};
pub use transport::{Endpoint, ReplySocket, RequestSocket};
