//! Outbound messages and the per-step send queue

/// One encoded unit ready to go on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    bytes: Vec<u8>,
}

impl Message {
    /// Wrap encoded bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if the message carries no bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Ordered messages of one step attempt plus the send cursor through them
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: Vec<Message>,
    /// Message currently being sent
    index: usize,
    /// Offset into `messages[index]`
    offset: usize,
    /// Bytes handed to the transport so far
    sent: usize,
}

impl OutboundQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Append several messages in order
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    /// Drop all messages and rewind the cursor
    pub fn clear(&mut self) {
        self.messages.clear();
        self.index = 0;
        self.offset = 0;
        self.sent = 0;
    }

    /// Queued messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Sum of all message lengths
    pub fn total_len(&self) -> usize {
        self.messages.iter().map(Message::len).sum()
    }

    /// Bytes sent so far (the send cursor)
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// True once every byte of every message has been sent
    pub fn is_drained(&self) -> bool {
        self.index >= self.messages.len()
    }

    /// Unsent remainder of the current message, empty when drained
    pub fn pending(&self) -> &[u8] {
        match self.messages.get(self.index) {
            Some(message) => &message.as_bytes()[self.offset..],
            None => &[],
        }
    }

    /// Move the cursor forward by `n` bytes of the current message
    ///
    /// Crossing the end of a message moves on to the next one; empty
    /// messages are skipped.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.pending().len());
        self.offset += n;
        self.sent += n;
        while let Some(message) = self.messages.get(self.index) {
            if self.offset < message.len() {
                break;
            }
            self.index += 1;
            self.offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_walks_across_messages() {
        let mut queue = OutboundQueue::new();
        queue.push(Message::new(vec![1, 2, 3]));
        queue.push(Message::new(vec![4, 5]));
        assert_eq!(queue.total_len(), 5);

        queue.advance(2);
        assert_eq!(queue.pending(), &[3]);
        queue.advance(1);
        assert_eq!(queue.pending(), &[4, 5]);
        assert!(!queue.is_drained());
        queue.advance(2);
        assert!(queue.is_drained());
        assert_eq!(queue.sent(), 5);
        assert!(queue.pending().is_empty());
    }

    #[test]
    fn test_empty_messages_are_skipped() {
        let mut queue = OutboundQueue::new();
        queue.push(Message::new(vec![9]));
        queue.push(Message::new(Vec::new()));
        queue.push(Message::new(vec![7]));

        queue.advance(1);
        assert_eq!(queue.pending(), &[7]);
    }

    #[test]
    fn test_advance_is_clamped_to_current_message() {
        let mut queue = OutboundQueue::new();
        queue.push(Message::new(vec![1, 2]));
        queue.push(Message::new(vec![3]));

        queue.advance(10);
        assert_eq!(queue.sent(), 2);
        assert_eq!(queue.pending(), &[3]);
    }

    #[test]
    fn test_clear_resets_cursor() {
        let mut queue = OutboundQueue::new();
        queue.push(Message::new(vec![1, 2]));
        queue.advance(2);
        queue.clear();

        assert!(queue.is_empty());
        assert!(queue.is_drained());
        assert_eq!(queue.sent(), 0);
    }
}
