//! Client listener: filesystem socket intake and per-connection framing.
//!
//! The listener owns nothing but the accept loop; each accepted connection
//! gets its own task that frames newline-terminated commands out of a
//! 64-byte accumulator and forwards them to the broker, while draining reply
//! bytes the broker pushes over the connection's channel. The broker closes
//! a connection by dropping its reply sender; the task observes the closed
//! channel and drops the socket.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::Event;
use crate::protocol::{CMD_BUFFER_SIZE, MAX_COMMAND_LEN};
use crate::scheduler::ClientId;

/// Remove any stale socket file at `path`, then bind the listener.
pub fn bind(path: &Path) -> Result<UnixListener, String> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(format!("remove stale socket {}: {e}", path.display())),
    }

    UnixListener::bind(path).map_err(|e| format!("bind {}: {e}", path.display()))
}

/// Accept connections until the broker goes away.
pub async fn run(listener: UnixListener, events: mpsc::Sender<Event>) {
    let mut next_id: ClientId = 1;
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let id = next_id;
                next_id += 1;

                let (reply_tx, reply_rx) = mpsc::unbounded_channel();
                if events
                    .send(Event::Connected {
                        id,
                        reply: reply_tx,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::spawn(handle_connection(stream, id, events.clone(), reply_rx));
            }
            Err(e) => {
                warn!("Accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    id: ClientId,
    events: mpsc::Sender<Event>,
    mut replies: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut acc = CommandBuffer::new();

    loop {
        tokio::select! {
            result = reader.read(acc.space()) => match result {
                Ok(0) => break,
                Ok(n) => {
                    acc.advance(n);
                    while let Some(line) = acc.next_command() {
                        if events.send(Event::Command { id, line }).await.is_err() {
                            return;
                        }
                    }
                    if acc.is_full() {
                        warn!(
                            "Client {id}: command exceeds {MAX_COMMAND_LEN} bytes \
                             without a terminator, closing connection"
                        );
                        break;
                    }
                }
                Err(e) => {
                    debug!("Client {id} read error: {e}");
                    break;
                }
            },
            chunk = replies.recv() => {
                if !forward_reply(&mut writer, chunk).await {
                    break;
                }
            }
        }
    }

    let _ = events.send(Event::Disconnected { id }).await;
}

/// Write one reply chunk; `false` ends the connection (closed channel or
/// write failure).
async fn forward_reply(writer: &mut OwnedWriteHalf, chunk: Option<Vec<u8>>) -> bool {
    match chunk {
        Some(chunk) => writer.write_all(&chunk).await.is_ok(),
        None => false,
    }
}

/// Fixed 64-byte command accumulator.
///
/// Holds at most one partial command between reads; bytes past a complete
/// command stay buffered for the next one. Filling all 64 bytes without a
/// newline is a protocol violation.
struct CommandBuffer {
    buf: [u8; CMD_BUFFER_SIZE],
    len: usize,
}

impl CommandBuffer {
    fn new() -> Self {
        Self {
            buf: [0; CMD_BUFFER_SIZE],
            len: 0,
        }
    }

    /// Free space to read into. Non-empty as long as the connection lives;
    /// a full buffer closes it before the next read.
    fn space(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    fn advance(&mut self, n: usize) {
        self.len += n;
        debug_assert!(self.len <= CMD_BUFFER_SIZE);
    }

    /// Extract the next newline-terminated command, terminator included.
    fn next_command(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf[..self.len].iter().position(|&b| b == b'\n')?;
        let line = self.buf[..=pos].to_vec();
        self.buf.copy_within(pos + 1..self.len, 0);
        self.len -= pos + 1;
        Some(line)
    }

    fn is_full(&self) -> bool {
        self.len == CMD_BUFFER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(acc: &mut CommandBuffer, bytes: &[u8]) {
        acc.space()[..bytes.len()].copy_from_slice(bytes);
        acc.advance(bytes.len());
    }

    #[test]
    fn test_extracts_single_command() {
        let mut acc = CommandBuffer::new();
        fill(&mut acc, b"PING\n");
        assert_eq!(acc.next_command().as_deref(), Some(&b"PING\n"[..]));
        assert_eq!(acc.next_command(), None);
        assert_eq!(acc.len, 0);
    }

    #[test]
    fn test_pipelined_commands_in_one_read() {
        let mut acc = CommandBuffer::new();
        fill(&mut acc, b"A 1\nB 2\npartial");
        assert_eq!(acc.next_command().as_deref(), Some(&b"A 1\n"[..]));
        assert_eq!(acc.next_command().as_deref(), Some(&b"B 2\n"[..]));
        assert_eq!(acc.next_command(), None);
        // The trailing partial command waits for its terminator.
        assert_eq!(&acc.buf[..acc.len], b"partial");
    }

    #[test]
    fn test_command_split_across_reads() {
        let mut acc = CommandBuffer::new();
        fill(&mut acc, b"GET rx_po");
        assert_eq!(acc.next_command(), None);
        fill(&mut acc, b"wer\n");
        assert_eq!(acc.next_command().as_deref(), Some(&b"GET rx_power\n"[..]));
    }

    #[test]
    fn test_63_byte_command_accepted() {
        let mut acc = CommandBuffer::new();
        let mut cmd = vec![b'x'; MAX_COMMAND_LEN];
        cmd.push(b'\n');
        // Fills the buffer to exactly 64 bytes, but the terminator makes it
        // a complete command; extraction runs before the overflow check.
        fill(&mut acc, &cmd);
        assert_eq!(acc.next_command().unwrap(), cmd);
        assert!(!acc.is_full());
    }

    #[test]
    fn test_64_bytes_without_newline_is_violation() {
        let mut acc = CommandBuffer::new();
        fill(&mut acc, &[b'x'; CMD_BUFFER_SIZE]);
        assert_eq!(acc.next_command(), None);
        assert!(acc.is_full());
    }

    #[test]
    fn test_space_shrinks_with_fill() {
        let mut acc = CommandBuffer::new();
        assert_eq!(acc.space().len(), CMD_BUFFER_SIZE);
        fill(&mut acc, b"abc");
        assert_eq!(acc.space().len(), CMD_BUFFER_SIZE - 3);
    }
}
