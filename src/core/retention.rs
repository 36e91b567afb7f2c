use std::collections::{HashMap, VecDeque};

use crate::core::entry::{Entry, Payload};
use crate::core::wire::{validate_topic, End};
use crate::core::{Error, Result};

/// Double-ended, time-bounded history of one topic.
///
/// Entries are kept in arrival order, oldest at the head. Every `add` evicts
/// from the head until the oldest remaining entry is at most
/// `max_remaining_time` seconds older than the entry just added.
#[derive(Debug, Clone)]
pub struct RetentionBuffer {
    name: String,
    max_remaining_time: f64,
    entries: VecDeque<Entry>,
}

impl RetentionBuffer {
    /// A non-positive `max_remaining_time` keeps only entries sharing the
    /// latest timestamp.
    pub fn new(name: impl Into<String>, max_remaining_time: f64) -> Self {
        Self {
            name: name.into(),
            max_remaining_time: max_remaining_time.max(0.0),
            entries: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_remaining_time(&self) -> f64 {
        self.max_remaining_time
    }

    /// Appends at the tail and returns how many entries were evicted.
    pub fn add(&mut self, payload: impl Into<Payload>, timestamp: f64) -> usize {
        self.entries.push_back(Entry::new(payload, timestamp));
        let mut evicted = 0;
        while let Some(head) = self.entries.front() {
            if timestamp - head.timestamp > self.max_remaining_time {
                self.entries.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }

    /// Returns up to `n` entries from `end` in oldest-to-newest order.
    ///
    /// Negative `n`, or `n` beyond the current size, selects everything.
    pub fn peek(&self, end: End, n: i32) -> Vec<Entry> {
        let take = self.selection_len(n);
        let skip = match end {
            End::Earliest => 0,
            End::Latest => self.entries.len() - take,
        };
        self.entries.iter().skip(skip).take(take).cloned().collect()
    }

    /// Same selection as [`RetentionBuffer::peek`], removing what it returns.
    pub fn pop(&mut self, end: End, n: i32) -> Vec<Entry> {
        let take = self.selection_len(n);
        match end {
            End::Earliest => self.entries.drain(..take).collect(),
            End::Latest => {
                let start = self.entries.len() - take;
                self.entries.drain(start..).collect()
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    fn selection_len(&self, n: i32) -> usize {
        match usize::try_from(n) {
            Ok(n) => n.min(self.entries.len()),
            Err(_) => self.entries.len(),
        }
    }
}

/// Topic name to retention buffer mapping.
///
/// Not synchronized itself; the responder keeps it behind one mutex.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: HashMap<String, RetentionBuffer>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`. Returns `Ok(false)` if it already existed, in which
    /// case its buffer is left untouched.
    pub fn add_topic(&mut self, name: &str, max_remaining_time: f64) -> Result<bool> {
        validate_topic(name).map_err(Error::InvalidArgument)?;
        if self.topics.contains_key(name) {
            return Ok(false);
        }
        self.topics
            .insert(name.to_string(), RetentionBuffer::new(name, max_remaining_time));
        Ok(true)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&RetentionBuffer> {
        self.topics
            .get(name)
            .ok_or_else(|| Error::UnknownTopic(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut RetentionBuffer> {
        self.topics
            .get_mut(name)
            .ok_or_else(|| Error::UnknownTopic(name.to_string()))
    }

    pub fn put(&mut self, name: &str, payload: impl Into<Payload>, timestamp: f64) -> Result<usize> {
        Ok(self.get_mut(name)?.add(payload, timestamp))
    }

    pub fn peek(&self, name: &str, end: End, n: i32) -> Result<Vec<Entry>> {
        Ok(self.get(name)?.peek(end, n))
    }

    pub fn pop(&mut self, name: &str, end: End, n: i32) -> Result<Vec<Entry>> {
        Ok(self.get_mut(name)?.pop(end, n))
    }

    /// Current entry count per topic.
    pub fn status(&self) -> HashMap<String, usize> {
        self.topics
            .iter()
            .map(|(name, buffer)| (name.clone(), buffer.len()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn clear_all(&mut self) {
        for buffer in self.topics.values_mut() {
            buffer.clear();
        }
    }
}
