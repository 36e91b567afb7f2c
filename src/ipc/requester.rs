use std::time::Duration;

use log::{debug, info};

use crate::core::config::RequesterConfig;
use crate::core::wire::{validate_topic, Command, End, EndSelector, Message};
use crate::core::{Clock, Entry, Error, Payload, QuantaClock, Result, SyncedClock};
use crate::ipc::transport::{Endpoint, RequestSocket};

/// Client side of the protocol: one outstanding request at a time against a
/// single responder.
///
/// The connection is opened lazily on the first request and reopened after a
/// transport failure.
pub struct Requester<C: Clock = QuantaClock> {
    name: String,
    socket: RequestSocket,
    clock: SyncedClock<C>,
    last_retrieved: Vec<Entry>,
}

impl Requester<QuantaClock> {
    pub fn connect(name: impl Into<String>, endpoint: &str) -> Result<Self> {
        Self::connect_with_clock(name, endpoint, QuantaClock::new())
    }

    pub fn from_config(config: &RequesterConfig) -> Result<Self> {
        let mut requester = Self::connect(config.name.as_str(), &config.endpoint)?;
        requester.set_timeout(config.timeout())?;
        Ok(requester)
    }
}

impl<C: Clock> Requester<C> {
    pub fn connect_with_clock(name: impl Into<String>, endpoint: &str, clock: C) -> Result<Self> {
        let name = name.into();
        let endpoint = Endpoint::parse(endpoint)?;
        info!("[{name}] requesting from {endpoint}");
        Ok(Self {
            name,
            socket: RequestSocket::connect(&endpoint),
            clock: SyncedClock::new(clock),
            last_retrieved: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.socket.endpoint()
    }

    /// Bounds each request/reply exchange. `None` waits indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.socket.set_timeout(timeout)
    }

    /// Reads up to `n` entries of `topic` from `end` without removing them.
    /// Negative `n` asks for everything.
    pub fn peek(&mut self, topic: &str, end: End, n: i32) -> Result<Vec<Entry>> {
        self.retrieve(Command::PeekData, topic, end, n)
    }

    /// Like [`Requester::peek`], removing the returned entries on the responder.
    pub fn pop(&mut self, topic: &str, end: End, n: i32) -> Result<Vec<Entry>> {
        self.retrieve(Command::PopData, topic, end, n)
    }

    /// Sends `payload` to the responder's request handler and returns its reply.
    pub fn request_with_data(&mut self, topic: &str, payload: &[u8]) -> Result<Payload> {
        validate_topic(topic).map_err(Error::InvalidArgument)?;
        let request = Message::flat(
            topic,
            Command::RequestWithData,
            EndSelector::None,
            self.clock.timestamp(),
            payload,
        );
        let reply = self.exchange(&request)?;
        let payload = Payload::from(reply.body);
        self.last_retrieved = vec![Entry::new(payload.clone(), reply.timestamp)];
        Ok(payload)
    }

    /// Entries returned by the most recent successful peek or pop, or the
    /// reply of the most recent `request_with_data`.
    pub fn last_retrieved(&self) -> &[Entry] {
        &self.last_retrieved
    }

    pub fn current_timestamp(&self) -> f64 {
        self.clock.timestamp()
    }

    /// Re-anchors the timeline at `reference_wall_us` and forgets the
    /// last retrieved entries.
    pub fn resync(&mut self, reference_wall_us: i64) {
        info!(
            "[{}] resetting start time; clearing last retrieved entries",
            self.name
        );
        self.last_retrieved.clear();
        self.clock.reset_start_time(reference_wall_us);
    }

    fn retrieve(&mut self, command: Command, topic: &str, end: End, n: i32) -> Result<Vec<Entry>> {
        validate_topic(topic).map_err(Error::InvalidArgument)?;
        let request = Message::request(topic, command, end, self.clock.timestamp(), n);
        let reply = self.exchange(&request)?;
        let entries = reply.entries()?;
        if entries.is_empty() {
            debug!("[{}] {command} `{topic}` returned no entries", self.name);
        }
        self.last_retrieved = entries.clone();
        Ok(entries)
    }

    fn exchange(&mut self, request: &Message) -> Result<Message> {
        let frame = request.encode()?;
        let reply = Message::decode(&self.socket.request(&frame)?)?;
        if reply.command == Command::Error {
            return Err(Error::RemoteError(reply.text()));
        }
        if reply.command != request.command {
            return Err(Error::ProtocolMismatch {
                sent: request.command,
                received: reply.command,
            });
        }
        Ok(reply)
    }
}
