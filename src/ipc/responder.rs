//! Topic server: owns the retention buffers and answers peek/pop requests.
//!
//! ```text
//!  producer ──put()──►┌──────────────────────────┐
//!                     │ Mutex<TopicRegistry>     │◄──peek/pop── background thread ◄──► ReplySocket
//!  local reader ─────►└──────────────────────────┘
//! ```
//!
//! The embedding application talks to the registry directly; remote
//! requesters reach it through a dedicated thread that owns the socket. Both
//! paths take the same lock, and only for the registry operation itself.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};

use crate::core::config::{ResponderConfig, DEFAULT_POLL_TIMEOUT_MS};
use crate::core::wire::{
    batch_encoded_len, validate_topic, Command, End, EndSelector, Message, FIXED_HEADER_LEN,
};
use crate::core::{Clock, Entry, Error, Payload, QuantaClock, Result, SyncedClock, TopicRegistry};
use crate::ipc::transport::{Endpoint, ReplySocket, MAX_FRAME_LEN};

/// Topic used in error replies to frames that could not be decoded.
pub const UNKNOWN_TOPIC: &str = "unknown";

/// Serves REQUEST_WITH_DATA: turns a request payload into a reply payload.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, payload: &[u8]) -> Vec<u8>;
}

impl<F> RequestHandler for F
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    fn handle(&self, payload: &[u8]) -> Vec<u8> {
        self(payload)
    }
}

struct Shared<C: Clock> {
    name: String,
    registry: Mutex<TopicRegistry>,
    clock: SyncedClock<C>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    /// Largest encoded reply the transport will carry.
    max_reply_len: usize,
}

impl<C: Clock> Shared<C> {
    fn registry(&self) -> Result<MutexGuard<'_, TopicRegistry>> {
        self.registry
            .lock()
            .map_err(|_| Error::LockPoisoned("topic registry"))
    }

    fn check_reply_len(&self, topic: &str, entries: &[Entry]) -> Result<()> {
        let reply_len = FIXED_HEADER_LEN + topic.len() + batch_encoded_len(entries);
        if reply_len > self.max_reply_len {
            return Err(Error::InvalidArgument(format!(
                "reply of {} entries needs {reply_len} bytes, over the {}-byte frame limit; request fewer entries",
                entries.len(),
                self.max_reply_len
            )));
        }
        Ok(())
    }

    /// Peeks or pops under one lock acquisition. A pop only removes entries
    /// once their reply is known to fit in a frame.
    fn retrieve(&self, command: Command, topic: &str, end: End, n: i32) -> Result<Vec<Entry>> {
        let result = {
            let mut registry = self.registry()?;
            registry.peek(topic, end, n).and_then(|selected| {
                self.check_reply_len(topic, &selected)?;
                match command {
                    Command::PopData => registry.pop(topic, end, n),
                    _ => Ok(selected),
                }
            })
        };
        match result {
            Err(Error::UnknownTopic(_)) => {
                warn!(
                    "[{}] {command} on unknown topic `{topic}`; call add_topic first",
                    self.name
                );
                Ok(Vec::new())
            }
            other => other,
        }
    }

    fn handler(&self) -> Result<Option<Arc<dyn RequestHandler>>> {
        let guard = self
            .handler
            .read()
            .map_err(|_| Error::LockPoisoned("request handler"))?;
        Ok(guard.clone())
    }

    /// Builds the reply for one decoded request.
    fn dispatch(&self, request: &Message) -> Result<Message> {
        match request.command {
            Command::PeekData | Command::PopData => {
                let end = End::try_from(request.end);
                let count = request.count();
                let (end, n) = match (end, count) {
                    (Ok(end), Ok(n)) => (end, n),
                    (end, count) => {
                        let problems: Vec<String> = [end.err(), count.err()]
                            .into_iter()
                            .flatten()
                            .map(|err| match err {
                                Error::InvalidArgument(problem) => problem,
                                other => other.to_string(),
                            })
                            .collect();
                        return Err(Error::InvalidArgument(problems.join("; ")));
                    }
                };
                let entries = self.retrieve(request.command, &request.topic, end, n)?;
                Message::batch(
                    request.topic.as_str(),
                    request.command,
                    request.end,
                    self.clock.timestamp(),
                    &entries,
                )
            }
            Command::RequestWithData => {
                let handler = self.handler()?.ok_or(Error::HandlerNotConfigured)?;
                let reply = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&request.body)))
                    .map_err(|cause| Error::HandlerPanicked(panic_message(cause.as_ref())))?;
                Ok(Message::flat(
                    request.topic.as_str(),
                    Command::RequestWithData,
                    EndSelector::None,
                    self.clock.timestamp(),
                    reply,
                ))
            }
            other => Err(Error::InvalidArgument(format!(
                "unsupported command {other} (code {})",
                other.code()
            ))),
        }
    }

    /// Answers one raw request frame. Every failure becomes an ERROR reply.
    fn reply_to(&self, frame: &[u8]) -> Vec<u8> {
        let (topic, result) = match Message::decode(frame) {
            Ok(request) => {
                let result = self.dispatch(&request);
                (request.topic, result)
            }
            Err(err) => {
                let topic = Message::decode_topic(frame).unwrap_or_else(|| UNKNOWN_TOPIC.to_string());
                (topic, Err(err))
            }
        };
        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                error!("[{}] request on `{topic}` failed: {err}", self.name);
                Message::error(topic, self.clock.timestamp(), &err.to_string())
            }
        };
        let encoded = reply.encode().and_then(|bytes| {
            if bytes.len() > self.max_reply_len {
                return Err(Error::InvalidArgument(format!(
                    "reply of {} bytes exceeds the {}-byte frame limit",
                    bytes.len(),
                    self.max_reply_len
                )));
            }
            Ok(bytes)
        });
        match encoded {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("[{}] cannot send reply: {err}", self.name);
                Message::error(reply.topic, self.clock.timestamp(), &err.to_string())
                    .encode()
                    .unwrap_or_default()
            }
        }
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = cause.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = cause.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn serve<C: Clock>(
    shared: Arc<Shared<C>>,
    mut socket: ReplySocket,
    shutdown: Arc<AtomicBool>,
    poll_timeout: Duration,
) -> ReplySocket {
    while !shutdown.load(Ordering::Acquire) {
        match socket.poll(poll_timeout) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                error!("[{}] poll failed: {err}", shared.name);
                thread::sleep(Duration::from_millis(50));
                continue;
            }
        }
        let frame = match socket.recv() {
            Ok(frame) => frame,
            Err(err) => {
                error!("[{}] receive failed: {err}", shared.name);
                continue;
            }
        };
        let reply = shared.reply_to(&frame);
        if let Err(err) = socket.send(&reply) {
            warn!("[{}] reply not delivered: {err}", shared.name);
        }
    }
    socket
}

/// Holds named topics and serves them to remote [`crate::ipc::Requester`]s.
///
/// Dropping the responder stops its thread and closes the socket.
pub struct Responder<C: Clock = QuantaClock> {
    shared: Arc<Shared<C>>,
    endpoint: Endpoint,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<ReplySocket>>,
}

impl Responder<QuantaClock> {
    /// Binds `endpoint` and starts serving with the default poll timeout.
    pub fn bind(name: impl Into<String>, endpoint: &str) -> Result<Self> {
        Self::bind_with_clock(
            name,
            endpoint,
            Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            QuantaClock::new(),
        )
    }

    /// Binds the configured endpoint and registers the configured topics.
    pub fn from_config(config: &ResponderConfig) -> Result<Self> {
        Self::from_config_with_clock(config, QuantaClock::new())
    }
}

impl<C: Clock> Responder<C> {
    pub fn bind_with_clock(
        name: impl Into<String>,
        endpoint: &str,
        poll_timeout: Duration,
        clock: C,
    ) -> Result<Self> {
        Self::spawn(name.into(), endpoint, poll_timeout, clock, MAX_FRAME_LEN)
    }

    fn spawn(
        name: String,
        endpoint: &str,
        poll_timeout: Duration,
        clock: C,
        max_reply_len: usize,
    ) -> Result<Self> {
        let endpoint = Endpoint::parse(endpoint)?;
        let socket = ReplySocket::bind(&endpoint)?;
        let endpoint = socket.local_endpoint()?;

        let shared = Arc::new(Shared {
            name: name.clone(),
            registry: Mutex::new(TopicRegistry::new()),
            clock: SyncedClock::new(clock),
            handler: RwLock::new(None),
            max_reply_len,
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = {
            let shared = Arc::clone(&shared);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name(format!("{name}-responder"))
                .spawn(move || serve(shared, socket, shutdown, poll_timeout))?
        };
        info!("[{name}] serving on {endpoint}");

        Ok(Self {
            shared,
            endpoint,
            shutdown,
            worker: Some(worker),
        })
    }

    pub fn from_config_with_clock(config: &ResponderConfig, clock: C) -> Result<Self> {
        let responder =
            Self::bind_with_clock(config.name.as_str(), &config.endpoint, config.poll_timeout(), clock)?;
        for topic in &config.topics {
            responder.add_topic(&topic.name, topic.max_remaining_time)?;
        }
        Ok(responder)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The bound endpoint, with an ephemeral TCP port resolved.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Registers a topic. Registering an existing name keeps its buffer as is.
    pub fn add_topic(&self, name: &str, max_remaining_time: f64) -> Result<()> {
        let added = self.shared.registry()?.add_topic(name, max_remaining_time)?;
        if added {
            info!(
                "[{}] added topic `{name}` with max remaining time {max_remaining_time}s",
                self.shared.name
            );
        } else {
            warn!(
                "[{}] topic `{name}` already exists; ignoring the request to add it again",
                self.shared.name
            );
        }
        Ok(())
    }

    /// Stores `payload` in `topic`, stamped with the current timestamp.
    /// Data for an unregistered topic is logged and dropped.
    pub fn put(&self, topic: &str, payload: impl Into<Payload>) -> Result<()> {
        let mut registry = self.shared.registry()?;
        match registry.put(topic, payload, self.shared.clock.timestamp()) {
            Ok(_) => Ok(()),
            Err(Error::UnknownTopic(_)) => {
                warn!(
                    "[{}] received data for unknown topic `{topic}`; call add_topic first",
                    self.shared.name
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Reads up to `n` entries from `end` without removing them. Unknown
    /// topics read as empty.
    pub fn peek(&self, topic: &str, end: End, n: i32) -> Result<Vec<Entry>> {
        validate_topic(topic).map_err(Error::InvalidArgument)?;
        self.shared.retrieve(Command::PeekData, topic, end, n)
    }

    /// Like [`Responder::peek`], removing the returned entries.
    pub fn pop(&self, topic: &str, end: End, n: i32) -> Result<Vec<Entry>> {
        validate_topic(topic).map_err(Error::InvalidArgument)?;
        self.shared.retrieve(Command::PopData, topic, end, n)
    }

    /// Current entry count per topic.
    pub fn topic_status(&self) -> Result<HashMap<String, usize>> {
        Ok(self.shared.registry()?.status())
    }

    pub fn topic_names(&self) -> Result<Vec<String>> {
        Ok(self.shared.registry()?.names())
    }

    /// Seconds on this responder's synchronized timeline.
    pub fn current_timestamp(&self) -> f64 {
        self.shared.clock.timestamp()
    }

    /// Re-anchors the timeline at `reference_wall_us` (microseconds since the
    /// UNIX epoch) and drops all stored entries, whose timestamps belong to
    /// the old timeline.
    pub fn resync(&self, reference_wall_us: i64) -> Result<()> {
        let mut registry = self.shared.registry()?;
        info!(
            "[{}] resetting start time; clearing all data stored before it",
            self.shared.name
        );
        registry.clear_all();
        self.shared.clock.reset_start_time(reference_wall_us);
        Ok(())
    }

    /// Installs the REQUEST_WITH_DATA handler, replacing any previous one.
    pub fn set_handler(&self, handler: impl RequestHandler) -> Result<()> {
        let mut guard = self
            .shared
            .handler
            .write()
            .map_err(|_| Error::LockPoisoned("request handler"))?;
        *guard = Some(Arc::new(handler));
        Ok(())
    }

    pub fn clear_handler(&self) -> Result<()> {
        let mut guard = self
            .shared
            .handler
            .write()
            .map_err(|_| Error::LockPoisoned("request handler"))?;
        *guard = None;
        Ok(())
    }

    /// Stops the background thread, waits for it, then closes the socket.
    /// Returns within one poll timeout.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.shutdown.store(true, Ordering::Release);
        let socket = worker
            .join()
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::Other, "responder thread panicked")))?;
        drop(socket);
        info!("[{}] stopped serving {}", self.shared.name, self.endpoint);
        Ok(())
    }
}

impl<C: Clock> Drop for Responder<C> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("[{}] shutdown failed: {err}", self.shared.name);
        }
    }
}
