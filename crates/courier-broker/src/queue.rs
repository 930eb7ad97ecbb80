use bytes::Bytes;
use courier_core::{Headers, QueueId};
use std::collections::VecDeque;

/// A message waiting in a queue or held unacknowledged by a consumer.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub headers: Headers,
    pub payload: Bytes,
    pub redelivered: bool,
}

impl QueuedMessage {
    pub fn new(headers: Headers, payload: Bytes) -> Self {
        QueuedMessage {
            headers,
            payload,
            redelivered: false,
        }
    }
}

/// FIFO buffer plus the round-robin ring of consumers attached to it.
pub struct MessageQueue {
    name: QueueId,
    messages: VecDeque<QueuedMessage>,
    consumers: Vec<String>,
    cursor: usize,
    exclusive: bool,
    owner: Option<String>,
}

impl MessageQueue {
    pub fn new(name: QueueId) -> Self {
        MessageQueue {
            name,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            exclusive: false,
            owner: None,
        }
    }

    /// Queue that accepts a single consumer and dies with it.
    pub fn exclusive(name: QueueId) -> Self {
        MessageQueue {
            exclusive: true,
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &QueueId {
        &self.name
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Push a new message at the tail.
    pub fn push(&mut self, message: QueuedMessage) {
        self.messages.push_back(message);
    }

    /// Return a message to the head, flagged as redelivered.
    pub fn requeue(&mut self, mut message: QueuedMessage) {
        message.redelivered = true;
        self.messages.push_front(message);
    }

    /// Put back a message that never reached its consumer.
    pub fn restore(&mut self, message: QueuedMessage) {
        self.messages.push_front(message);
    }

    /// Drop every ready message, returning how many there were.
    pub fn purge(&mut self) -> usize {
        let count = self.messages.len();
        self.messages.clear();
        count
    }

    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Attach a consumer. Returns false when an exclusive queue already has one.
    pub fn attach(&mut self, consumer_tag: &str) -> bool {
        if self.exclusive {
            if self.owner.is_some() {
                return false;
            }
            self.owner = Some(consumer_tag.to_string());
        }
        self.consumers.push(consumer_tag.to_string());
        true
    }

    pub fn detach(&mut self, consumer_tag: &str) {
        if let Some(pos) = self.consumers.iter().position(|c| c == consumer_tag) {
            self.consumers.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
        }
        if self.cursor >= self.consumers.len() {
            self.cursor = 0;
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Pick the next consumer in round-robin order that `eligible` accepts,
    /// advancing the cursor past it.
    pub fn next_consumer<F>(&mut self, eligible: F) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        let count = self.consumers.len();
        for offset in 0..count {
            let idx = (self.cursor + offset) % count;
            if eligible(&self.consumers[idx]) {
                self.cursor = (idx + 1) % count;
                return Some(self.consumers[idx].clone());
            }
        }
        None
    }
}
