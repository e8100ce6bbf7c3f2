//! Controller client mode: the binary without `-d`.
//!
//! Connects to the broker's socket, reads commands line-by-line from stdin
//! and prints each reply. Replies carry the device's envelope; an `#ERROR`
//! header means the request failed and any body lines are error detail,
//! while body content without a `#START` header is reported as a warning.

use std::path::Path;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;

use crate::config::Config;
use crate::protocol::{Envelope, MAX_COMMAND_LEN, STOP_SENTINEL};

pub async fn run(config: &Config) -> Result<(), String> {
    let socket = Path::new(&config.broker.socket);
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| format!("connect {}: {e}", socket.display()))?;
    let (mut reader, mut writer) = stream.into_split();

    eprintln!("Connected to broker at {}", socket.display());

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin
        .next_line()
        .await
        .map_err(|e| format!("stdin: {e}"))?
    {
        let command = line.trim_end();
        if command.is_empty() {
            continue;
        }
        if command.len() > MAX_COMMAND_LEN {
            eprintln!(
                "command too long: {} bytes (limit {MAX_COMMAND_LEN})",
                command.len()
            );
            continue;
        }

        writer
            .write_all(format!("{command}\n").as_bytes())
            .await
            .map_err(|e| format!("write: {e}"))?;

        let reply = read_envelope(&mut reader).await?;
        match Envelope::parse(&reply) {
            Envelope::Success { body } => {
                for line in body {
                    println!("{line}");
                }
            }
            Envelope::Failure { detail } => {
                eprintln!("request failed");
                for line in detail {
                    eprintln!("  {line}");
                }
            }
            Envelope::Unframed { body } => {
                eprintln!("warning: reply body without #START header");
                for line in body {
                    println!("{line}");
                }
            }
        }
    }

    Ok(())
}

/// Accumulate reply bytes until the `\r\n#STOP\r\n` trailer arrives.
async fn read_envelope(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, String> {
    let mut reply = BytesMut::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| format!("read: {e}"))?;
        if n == 0 {
            return Err("broker closed the connection".to_string());
        }
        reply.extend_from_slice(&chunk[..n]);
        if reply.ends_with(STOP_SENTINEL) {
            return Ok(reply.to_vec());
        }
    }
}
