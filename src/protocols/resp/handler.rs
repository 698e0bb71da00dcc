//! RESP protocol connection handler.
//!
//! Reads request frames from a client stream, runs each one through the
//! dispatcher with the connection's own session, and writes the replies
//! back in order. Replies to pipelined requests that arrive in one read are
//! batched into a single write.

use super::command::Command;
use super::parser::{parse, Frame, ParseResult};
use crate::dispatcher::Dispatcher;
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Serve one client until it disconnects or sends QUIT.
pub async fn handle_connection<S>(mut stream: S, dispatcher: Arc<Dispatcher>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut out = BytesMut::with_capacity(BUFFER_SIZE);
    let mut session = dispatcher.new_session();

    loop {
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                trace!("Connection closed by client");
            } else {
                debug!(pending = buffer.len(), "Connection closed with incomplete frame");
            }
            return Ok(());
        }

        // Run every complete frame in the buffer
        let mut close = false;
        while !close {
            match parse(&buffer) {
                // Empty requests (blank inline lines, `*0`) get no reply
                ParseResult::Complete(Frame::Array(Some(words)), consumed) if words.is_empty() => {
                    buffer.advance(consumed);
                }
                ParseResult::Complete(frame, consumed) => {
                    buffer.advance(consumed);
                    trace!(?frame, "Processing RESP command");

                    match Command::from_frame(frame) {
                        Ok(cmd) => {
                            let reply = dispatcher.dispatch(&mut session, cmd).await;
                            reply.frame.encode_into(&mut out);
                            close = reply.close;
                        }
                        Err(msg) => Frame::error(msg).encode_into(&mut out),
                    }
                }
                ParseResult::Incomplete => break,
                ParseResult::Error(e) => {
                    debug!(error = %e, "RESP parse error");
                    Frame::error(format!("ERR Protocol error: {e}")).encode_into(&mut out);
                    buffer.clear();
                    break;
                }
            }
        }

        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }

        if close {
            stream.shutdown().await?;
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use tokio_test::io::Builder;

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(Arc::new(MemoryStorage::new()), None))
    }

    #[tokio::test]
    async fn test_request_reply() {
        let stream = Builder::new()
            .read(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .write(b"+OK\r\n")
            .read(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .write(b"$1\r\nv\r\n")
            .build();

        handle_connection(stream, dispatcher()).await.unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_requests_share_one_write() {
        let stream = Builder::new()
            .read(b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nPING\r\n$2\r\nhi\r\n")
            .write(b"+PONG\r\n$2\r\nhi\r\n")
            .build();

        handle_connection(stream, dispatcher()).await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let stream = Builder::new()
            .read(b"*2\r\n$4\r\nECHO")
            .read(b"\r\n$1\r\nx\r\n")
            .write(b"-ERR unknown command 'ECHO'\r\n")
            .build();

        handle_connection(stream, dispatcher()).await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_stops_processing() {
        // The PING after QUIT is never answered
        let stream = Builder::new()
            .read(b"*1\r\n$4\r\nQUIT\r\n*1\r\n$4\r\nPING\r\n")
            .write(b"+OK\r\n")
            .build();

        handle_connection(stream, dispatcher()).await.unwrap();
    }

    #[tokio::test]
    async fn test_inline_and_protocol_errors() {
        let stream = Builder::new()
            .read(b"PING\r\n\r\n")
            .write(b"+PONG\r\n")
            .read(b":5\r\n")
            .write(b"-ERR Protocol error: expected array of bulk strings\r\n")
            .read(b"$abc\r\n")
            .write(b"-ERR Protocol error: invalid bulk length: abc\r\n")
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .build();

        handle_connection(stream, dispatcher()).await.unwrap();
    }

    #[tokio::test]
    async fn test_deeply_nested_request_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(handle_connection(server, dispatcher()));

        client.write_all(&b"*1\r\n".repeat(100_000)).await.unwrap();
        let mut reply = vec![0u8; 64];
        let n = client.read(&mut reply).await.unwrap();
        assert!(
            reply[..n].starts_with(b"-ERR Protocol error: expected '$', got '*'\r\n"),
            "{:?}",
            String::from_utf8_lossy(&reply[..n])
        );

        drop(client);
        // The handler task finishes once the client goes away
        let _ = task.await.unwrap();
    }
}
