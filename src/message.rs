use bytes::Bytes;

/// A discrete message: a header chunk and a body chunk, both
/// reference-counted. Moving a message with [`Message::take`] transfers both
/// chunks and leaves the source empty, so a staged message can change hands
/// without copying payload bytes.
///
/// A frame received off the wire arrives entirely in `body` with an empty
/// header; the header chunk exists for protocol shells that prepend routing
/// data of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub hdr: Bytes,
    pub body: Bytes,
}

impl Message {
    pub fn new() -> Message {
        Message {
            hdr: Bytes::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(body: Bytes) -> Message {
        Message {
            hdr: Bytes::new(),
            body,
        }
    }

    /// Total payload size: header plus body.
    pub fn len(&self) -> usize {
        self.hdr.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hdr.is_empty() && self.body.is_empty()
    }

    /// Move the message out, leaving this one empty.
    pub fn take(&mut self) -> Message {
        std::mem::take(self)
    }
}

impl From<&[u8]> for Message {
    fn from(body: &[u8]) -> Message {
        Message::with_body(Bytes::copy_from_slice(body))
    }
}

impl From<Vec<u8>> for Message {
    fn from(body: Vec<u8>) -> Message {
        Message::with_body(Bytes::from(body))
    }
}

#[cfg(test)]
mod test {
    use super::Message;
    use bytes::Bytes;

    #[test]
    fn take_empties_the_source() {
        let mut msg = Message {
            hdr: Bytes::from_static(b"hd"),
            body: Bytes::from_static(b"payload"),
        };

        let moved = msg.take();

        assert_eq!(moved.len(), 9);
        assert!(msg.is_empty());
        assert_eq!(moved.body, Bytes::from_static(b"payload"));
    }

    #[test]
    fn zero_length_is_legal() {
        let msg = Message::new();
        assert_eq!(msg.len(), 0);
        assert!(msg.is_empty());
    }
}
