//! # TCP Server
//!
//! Accept framed connections, split complete frames out of the read buffer,
//! and answer each command with a framed response.

use std::net::SocketAddr;

use bytes::BytesMut;
use hsm_common::FrameCodec;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Check value reported by the diagnostics command.
const LMK_CHECK_VALUE: &str = "2668613500000000";
const FIRMWARE_VERSION: &str = "0007-E000";

/// Error code for malformed command data.
const ERR_INVALID_INPUT: &str = "15";
/// Error code for unsupported commands.
const ERR_UNSUPPORTED: &str = "68";

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Accepts connections forever, one task per connection. Errors on a
/// single peer are logged and never stop the loop.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "cannot set TCP_NODELAY");
        }
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer).await {
                debug!(%peer, error = %err, "connection ended with error");
            }
        });
    }
}

/// Handles a single client connection until it closes or misbehaves.
pub async fn handle_connection(mut stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
    let codec = FrameCodec::default();
    let mut buffer = BytesMut::with_capacity(4 * 1024);
    debug!(%peer, "client connected");

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        loop {
            match codec.frame_len(&buffer, codec.max_body_len()) {
                Ok(Some(total)) => {
                    let frame = buffer.split_to(total);
                    let command = String::from_utf8_lossy(&frame[codec.width()..]);
                    let reply = dispatch_command(&command);
                    debug!(%peer, command = %command, reply = %reply, "command handled");

                    let framed = codec
                        .encode(&reply)
                        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
                    stream.write_all(&framed).await?;
                }
                Ok(None) => break,
                Err(err) => {
                    info!(%peer, error = %err, "malformed frame, closing connection");
                    return Ok(());
                }
            }
        }
    }

    debug!(%peer, "client disconnected");
    Ok(())
}

/// Produces the unframed response body for an unframed command.
pub fn dispatch_command(command: &str) -> String {
    let Some(code) = command.get(..2) else {
        return format!("ZZ{}", ERR_INVALID_INPUT);
    };

    match code {
        "NC" => format!("ND00{}{}", LMK_CHECK_VALUE, FIRMWARE_VERSION),
        "NO" => handle_random(command),
        _ => format!("{}{}", response_code_for(code), ERR_UNSUPPORTED),
    }
}

// "NOX" followed by a three-digit decimal count of hex digits.
fn handle_random(command: &str) -> String {
    let count = command
        .get(3..)
        .filter(|digits| digits.len() == 3)
        .and_then(|digits| digits.parse::<usize>().ok());

    match count {
        Some(count) => {
            let mut rng = rand::thread_rng();
            let payload: String = (0..count)
                .map(|_| HEX_DIGITS[rng.gen_range(0..HEX_DIGITS.len())] as char)
                .collect();
            format!("NP00{}", payload)
        }
        None => format!("NP{}", ERR_INVALID_INPUT),
    }
}

// Response code is the command code with its second character advanced by one.
fn response_code_for(code: &str) -> String {
    let bytes = code.as_bytes();
    let next = match bytes[1] {
        b'Z' => b'A',
        b'z' => b'a',
        b'9' => b'0',
        other if other.is_ascii_alphanumeric() => other + 1,
        _ => b'Z',
    };
    let first = if bytes[0].is_ascii_graphic() { bytes[0] } else { b'Z' };
    [first as char, next as char].iter().collect()
}
