//! Wire protocol shared by the broker and the controller client.
//!
//! Requests are single newline-terminated lines of at most
//! [`MAX_COMMAND_LEN`] bytes before the terminator. Replies are framed in an
//! envelope the device emits itself:
//!
//! ```text
//! #START\r\n
//! <zero or more \r\n-terminated body lines>
//! #STOP\r\n
//! ```
//!
//! On a device fault the broker substitutes the device's envelope with the
//! literal [`ERROR_ENVELOPE`]. End-of-message is keyed on the
//! [`STOP_SENTINEL`] suffix of the accumulated reply, never on a single read,
//! so a trailer split across reads is still detected.

use bytes::BytesMut;

/// Reply trailer the end-of-message detector keys on.
pub const STOP_SENTINEL: &[u8] = b"\r\n#STOP\r\n";

/// Header emitted by the device at the start of a successful reply.
pub const START_HEADER: &[u8] = b"#START\r\n";

/// Header marking a failed request.
pub const ERROR_HEADER: &[u8] = b"#ERROR\r\n";

/// Complete envelope synthesized by the broker on timeout or port error.
pub const ERROR_ENVELOPE: &[u8] = b"#ERROR\r\n#STOP\r\n";

/// Size of the per-connection command accumulator.
pub const CMD_BUFFER_SIZE: usize = 64;

/// Longest accepted command, exclusive of the `\n` terminator.
pub const MAX_COMMAND_LEN: usize = CMD_BUFFER_SIZE - 1;

/// Accumulates reply bytes and recognizes end-of-message.
///
/// The buffer only exists to detect the [`STOP_SENTINEL`] suffix; the bytes
/// themselves are streamed to the requester verbatim as they arrive.
#[derive(Debug, Default)]
pub struct ResponseFramer {
    buf: BytesMut,
}

impl ResponseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of reply bytes. Returns `true` when the accumulated
    /// reply now ends with the stop sentinel.
    pub fn extend(&mut self, chunk: &[u8]) -> bool {
        self.buf.extend_from_slice(chunk);
        self.buf.ends_with(STOP_SENTINEL)
    }

    /// Discard the accumulated reply, ready for the next command.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// A fully received reply, classified for client-side presentation.
#[derive(Debug, PartialEq, Eq)]
pub enum Envelope {
    /// `#START` header seen; body lines between header and trailer.
    Success { body: Vec<String> },
    /// `#ERROR` header seen; body (if any) is error detail.
    Failure { detail: Vec<String> },
    /// Body content arrived without a `#START` header.
    Unframed { body: Vec<String> },
}

impl Envelope {
    /// Classify a complete reply (everything up to and including the
    /// `#STOP\r\n` trailer) per the client-side rules: an `#ERROR` header
    /// means the request failed, a missing `#START` header is a warning
    /// condition, and body lines pass through verbatim.
    pub fn parse(reply: &[u8]) -> Envelope {
        let text = String::from_utf8_lossy(reply);
        let mut lines: Vec<&str> = text.split("\r\n").collect();
        // Drop the empty split artifact after the final \r\n and the trailer.
        if lines.last() == Some(&"") {
            lines.pop();
        }
        if lines.last() == Some(&"#STOP") {
            lines.pop();
        }

        match lines.first().copied() {
            Some("#START") => Envelope::Success {
                body: lines[1..].iter().map(|l| (*l).to_string()).collect(),
            },
            Some("#ERROR") => Envelope::Failure {
                detail: lines[1..].iter().map(|l| (*l).to_string()).collect(),
            },
            _ => Envelope::Unframed {
                body: lines.iter().map(|l| (*l).to_string()).collect(),
            },
        }
    }
}
