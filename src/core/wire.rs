//! Byte framing for requests and replies.
//!
//! A frame is a single message; there is no streaming or partial decode.
//!
//! ```text
//! [u8  topic_len N] [N bytes topic, UTF-8]
//! [i8  command]
//! [u8  end selector]
//! [f64 timestamp]
//! [body ..]
//! ```
//!
//! The body is either a flat payload (REQUEST_WITH_DATA, ERROR), a 4-byte
//! signed count (PEEK_DATA / POP_DATA requests) or a batch (PEEK_DATA /
//! POP_DATA replies):
//!
//! ```text
//! [u32 block_count]
//! block_count x ([u32 block_len] [f64 block_timestamp])
//! [block payloads, concatenated in order]
//! ```
//!
//! All scalars are little-endian.

use std::fmt;
use std::str::FromStr;

use crate::core::entry::{Entry, Payload};
use crate::core::{Error, Result};

pub const MAX_TOPIC_LEN: usize = u8::MAX as usize;
/// Header bytes besides the topic itself: topic length, command, end selector, timestamp.
pub const FIXED_HEADER_LEN: usize = 1 + 1 + 1 + 8;
pub const COUNT_LEN: usize = 4;
pub const BLOCK_INDEX_LEN: usize = 4 + 8;

/// Request/reply command carried in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    PeekData,
    PopData,
    RequestWithData,
    SynchronizeTime,
    Error,
    Unknown,
    /// A code this build does not know about; answered with an error reply.
    Unrecognized(i8),
}

impl Command {
    pub const fn code(self) -> i8 {
        match self {
            Command::PeekData => 1,
            Command::PopData => 2,
            Command::RequestWithData => 3,
            Command::SynchronizeTime => 4,
            Command::Error => -1,
            Command::Unknown => 0,
            Command::Unrecognized(code) => code,
        }
    }

    pub const fn from_code(code: i8) -> Self {
        match code {
            1 => Command::PeekData,
            2 => Command::PopData,
            3 => Command::RequestWithData,
            4 => Command::SynchronizeTime,
            -1 => Command::Error,
            0 => Command::Unknown,
            other => Command::Unrecognized(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::PeekData => f.write_str("PEEK_DATA"),
            Command::PopData => f.write_str("POP_DATA"),
            Command::RequestWithData => f.write_str("REQUEST_WITH_DATA"),
            Command::SynchronizeTime => f.write_str("SYNCHRONIZE_TIME"),
            Command::Error => f.write_str("ERROR"),
            Command::Unknown => f.write_str("UNKNOWN"),
            Command::Unrecognized(code) => write!(f, "UNRECOGNIZED({code})"),
        }
    }
}

/// End-selector as carried on the wire. `None` is only valid for commands
/// that do not peek or pop.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndSelector {
    None = 0,
    Earliest = 1,
    Latest = 2,
}

impl EndSelector {
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(EndSelector::None),
            1 => Ok(EndSelector::Earliest),
            2 => Ok(EndSelector::Latest),
            other => Err(Error::MalformedMessage(format!(
                "unknown end selector code {other}"
            ))),
        }
    }
}

/// Which end of a retention buffer a peek or pop works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum End {
    Earliest,
    Latest,
}

impl From<End> for EndSelector {
    fn from(end: End) -> Self {
        match end {
            End::Earliest => EndSelector::Earliest,
            End::Latest => EndSelector::Latest,
        }
    }
}

impl TryFrom<EndSelector> for End {
    type Error = Error;

    fn try_from(selector: EndSelector) -> Result<Self> {
        match selector {
            EndSelector::Earliest => Ok(End::Earliest),
            EndSelector::Latest => Ok(End::Latest),
            EndSelector::None => Err(Error::InvalidArgument(
                "end selector cannot be NONE for peek or pop".to_string(),
            )),
        }
    }
}

impl FromStr for End {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(End::Earliest),
            "latest" => Ok(End::Latest),
            other => Err(Error::InvalidArgument(format!(
                "end must be `earliest` or `latest`, got `{other}`"
            ))),
        }
    }
}

impl fmt::Display for End {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            End::Earliest => f.write_str("earliest"),
            End::Latest => f.write_str("latest"),
        }
    }
}

/// Checks the topic constraints shared by the codec and the public APIs.
pub fn validate_topic(topic: &str) -> std::result::Result<(), String> {
    if topic.is_empty() {
        return Err("topic cannot be empty".to_string());
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(format!(
            "topic is {} bytes, at most {MAX_TOPIC_LEN} allowed",
            topic.len()
        ));
    }
    Ok(())
}

/// The wire unit. Whether `body` holds a flat payload, a count or a batch is
/// decided by `command` and by which side of the exchange reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub command: Command,
    pub end: EndSelector,
    pub timestamp: f64,
    pub body: Vec<u8>,
}

impl Message {
    /// A message with a flat payload body.
    pub fn flat(
        topic: impl Into<String>,
        command: Command,
        end: EndSelector,
        timestamp: f64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            command,
            end,
            timestamp,
            body: payload.into(),
        }
    }

    /// A peek or pop request carrying the entry count `n`.
    pub fn request(topic: impl Into<String>, command: Command, end: End, timestamp: f64, n: i32) -> Self {
        Self::flat(topic, command, end.into(), timestamp, encode_count(n))
    }

    /// A reply carrying a batch of entries.
    pub fn batch(
        topic: impl Into<String>,
        command: Command,
        end: EndSelector,
        timestamp: f64,
        entries: &[Entry],
    ) -> Result<Self> {
        Ok(Self::flat(topic, command, end, timestamp, encode_batch(entries)?))
    }

    /// An ERROR reply whose payload is the human-readable `text`.
    pub fn error(topic: impl Into<String>, timestamp: f64, text: &str) -> Self {
        Self::flat(topic, Command::Error, EndSelector::None, timestamp, text.as_bytes())
    }

    /// Reads the body as a peek/pop count.
    pub fn count(&self) -> Result<i32> {
        decode_count(&self.body)
    }

    /// Reads the body as a batch of entries.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        decode_batch(&self.body)
    }

    /// Reads the body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.topic.len() + self.body.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        validate_topic(&self.topic).map_err(Error::MalformedMessage)?;
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.topic.len() as u8);
        buf.extend_from_slice(self.topic.as_bytes());
        buf.extend_from_slice(&self.command.code().to_le_bytes());
        buf.push(self.end.code());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Reads only the topic of `frame`, for addressing an error reply to a
    /// frame whose remaining header or body failed to decode.
    pub fn decode_topic(frame: &[u8]) -> Option<String> {
        let topic_len = *frame.first()? as usize;
        let topic = std::str::from_utf8(frame.get(1..1 + topic_len)?).ok()?;
        validate_topic(topic).ok()?;
        Some(topic.to_string())
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let topic_len = match frame.first() {
            Some(len) => *len as usize,
            None => return Err(Error::MalformedMessage("empty frame".to_string())),
        };
        let header_len = FIXED_HEADER_LEN + topic_len;
        if frame.len() < header_len {
            return Err(Error::MalformedMessage(format!(
                "frame of {} bytes is shorter than its {header_len}-byte header",
                frame.len()
            )));
        }
        let topic = std::str::from_utf8(&frame[1..1 + topic_len])
            .map_err(|_| Error::MalformedMessage("topic is not valid UTF-8".to_string()))?;
        validate_topic(topic).map_err(Error::MalformedMessage)?;

        let mut offset = 1 + topic_len;
        let command = Command::from_code(i8::from_le_bytes(read_array(frame, offset)?));
        offset += 1;
        let end = EndSelector::from_code(frame[offset])?;
        offset += 1;
        let timestamp = f64::from_le_bytes(read_array(frame, offset)?);
        offset += 8;

        Ok(Self {
            topic: topic.to_string(),
            command,
            end,
            timestamp,
            body: frame[offset..].to_vec(),
        })
    }
}

pub fn encode_count(n: i32) -> [u8; COUNT_LEN] {
    n.to_le_bytes()
}

pub fn decode_count(body: &[u8]) -> Result<i32> {
    let bytes: [u8; COUNT_LEN] = body.try_into().map_err(|_| {
        Error::InvalidArgument(format!(
            "count field must be exactly {COUNT_LEN} bytes, got {} bytes",
            body.len()
        ))
    })?;
    Ok(i32::from_le_bytes(bytes))
}

/// Size of the batch body `encode_batch` would produce for `entries`.
pub fn batch_encoded_len(entries: &[Entry]) -> usize {
    let payload_len: usize = entries.iter().map(|entry| entry.payload.len()).sum();
    COUNT_LEN + entries.len() * BLOCK_INDEX_LEN + payload_len
}

pub fn encode_batch(entries: &[Entry]) -> Result<Vec<u8>> {
    let block_count = u32::try_from(entries.len())
        .map_err(|_| Error::InvalidArgument(format!("{} blocks exceed u32 range", entries.len())))?;
    let mut buf = Vec::with_capacity(batch_encoded_len(entries));
    buf.extend_from_slice(&block_count.to_le_bytes());
    for entry in entries {
        let len = u32::try_from(entry.payload.len()).map_err(|_| {
            Error::InvalidArgument(format!("block of {} bytes exceeds u32 range", entry.payload.len()))
        })?;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&entry.timestamp.to_le_bytes());
    }
    for entry in entries {
        buf.extend_from_slice(&entry.payload);
    }
    Ok(buf)
}

pub fn decode_batch(body: &[u8]) -> Result<Vec<Entry>> {
    let block_count = u32::from_le_bytes(read_array(body, 0)?) as usize;
    let data_start = block_count
        .checked_mul(BLOCK_INDEX_LEN)
        .and_then(|index_len| index_len.checked_add(4))
        .filter(|&start| start <= body.len())
        .ok_or_else(|| {
            Error::MalformedMessage(format!(
                "batch declares {block_count} blocks but body is {} bytes",
                body.len()
            ))
        })?;

    let mut entries = Vec::with_capacity(block_count);
    let mut cursor = data_start;
    for i in 0..block_count {
        let index = 4 + i * BLOCK_INDEX_LEN;
        let len = u32::from_le_bytes(read_array(body, index)?) as usize;
        let timestamp = f64::from_le_bytes(read_array(body, index + 4)?);
        let end = cursor
            .checked_add(len)
            .filter(|&end| end <= body.len())
            .ok_or_else(|| {
                Error::MalformedMessage(format!(
                    "block {i} of {len} bytes overruns the {}-byte body",
                    body.len()
                ))
            })?;
        let payload: Payload = body[cursor..end].into();
        entries.push(Entry { payload, timestamp });
        cursor = end;
    }
    if cursor != body.len() {
        return Err(Error::MalformedMessage(format!(
            "{} trailing bytes after last block",
            body.len() - cursor
        )));
    }
    Ok(entries)
}

fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    buf.get(offset..offset + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            Error::MalformedMessage(format!(
                "need {N} bytes at offset {offset}, buffer is {} bytes",
                buf.len()
            ))
        })
}
