use std::pin::Pin;
use std::task::{Context, Poll};

use base64::Engine;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::core::config::NodeConfig;
use crate::core::dialer::BoxedConn;
use crate::core::errors::CoreError;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

/// Performs the HTTP/1.1 Upgrade handshake (§4.D.5) and returns a stream
/// that frames reads/writes as WebSocket binary messages.
///
/// Modeled as two background tasks pumping channels rather than a
/// hand-rolled poll-based frame decoder: `§9`'s design notes call out that
/// the single-flight "ready latch" is equally well expressed as a
/// completion future, a oneshot channel, or a condvar, and the same
/// applies here — an `AsyncRead`/`AsyncWrite` impl that needs to run a
/// multi-step protocol (frame header, extended length, mask, payload) per
/// logical read is naturally a coroutine, and `tokio::sync::mpsc` is the
/// coroutine primitive this codebase already reaches for.
pub async fn upgrade(cfg: &NodeConfig, mut conn: BoxedConn) -> Result<BoxedConn, CoreError> {
    let mut key_bytes = [0u8; 16];
    rand::rng().fill(&mut key_bytes);
    let key = base64::engine::general_purpose::STANDARD.encode(key_bytes);

    let host = &cfg.tls.server_name;
    let path = if cfg.transport.path.is_empty() { "/" } else { &cfg.transport.path };

    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         User-Agent: Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36\r\n"
    );
    for (k, v) in &cfg.transport.headers {
        request.push_str(&format!("{k}: {v}\r\n"));
    }
    request.push_str("\r\n");

    conn.write_all(request.as_bytes())
        .await
        .map_err(|e| CoreError::transport(format!("ws upgrade write: {e}")))?;

    let status_line = read_status_line(&mut conn).await?;
    if !status_line.contains("101") {
        return Err(CoreError::transport(format!("unexpected upgrade status: {status_line}")));
    }

    Ok(Box::new(WsStream::spawn(conn)))
}

async fn read_status_line(conn: &mut BoxedConn) -> Result<String, CoreError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        conn.read_exact(&mut byte)
            .await
            .map_err(|e| CoreError::transport(format!("ws upgrade read: {e}")))?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() > 8192 {
            return Err(CoreError::transport("ws upgrade status line too long"));
        }
    }

    // Consume the remaining response headers up to the blank line
    // terminator; their contents are not validated beyond the status.
    let mut header_buf = Vec::new();
    loop {
        conn.read_exact(&mut byte)
            .await
            .map_err(|e| CoreError::transport(format!("ws upgrade read: {e}")))?;
        header_buf.push(byte[0]);
        if header_buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if header_buf.len() > 64 * 1024 {
            return Err(CoreError::transport("ws upgrade headers too long"));
        }
    }

    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

/// Frames a masked-client/any-server WebSocket binary stream over an
/// underlying byte stream (§4.D.5, P7). Control frames (Ping/Pong/Close)
/// are consumed transparently by the reader task; Close ends the read
/// side (EOF).
struct WsStream {
    read_rx: mpsc::Receiver<Vec<u8>>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    current: Vec<u8>,
    current_pos: usize,
    eof: bool,
}

impl WsStream {
    fn spawn(conn: BoxedConn) -> Self {
        let (read_half, write_half) = tokio::io::split(conn);

        let (read_tx, read_rx) = mpsc::channel::<Vec<u8>>(64);
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // The writer owns `write_half` exclusively; outgoing frames and
        // auto-generated Pong replies share the same channel so frame
        // ordering on the wire matches send order.
        let pong_tx = write_tx.clone();
        tokio::spawn(write_loop(write_half, write_rx));
        tokio::spawn(read_loop(read_half, read_tx, pong_tx));

        Self {
            read_rx,
            write_tx,
            current: Vec::new(),
            current_pos: 0,
            eof: false,
        }
    }
}

async fn write_loop(mut write_half: WriteHalf<BoxedConn>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    mut read_half: ReadHalf<BoxedConn>,
    tx: mpsc::Sender<Vec<u8>>,
    pong_tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(frame)) => match frame.opcode {
                OPCODE_BINARY | OPCODE_CONTINUATION => {
                    if tx.send(frame.payload).await.is_err() {
                        return;
                    }
                }
                OPCODE_PING => {
                    let mut pong = Vec::new();
                    encode_masked_frame(OPCODE_PONG, &frame.payload, &mut pong);
                    let _ = pong_tx.send(pong);
                }
                OPCODE_PONG => {}
                OPCODE_CLOSE => return,
                _ => {}
            },
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(%err, "ws: read loop ended");
                return;
            }
        }
    }
}

impl tokio::io::AsyncRead for WsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.current_pos < this.current.len() {
                let n = std::cmp::min(out.remaining(), this.current.len() - this.current_pos);
                out.put_slice(&this.current[this.current_pos..this.current_pos + n]);
                this.current_pos += n;
                if this.current_pos == this.current.len() {
                    this.current.clear();
                    this.current_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match this.read_rx.poll_recv(cx) {
                Poll::Ready(Some(payload)) => {
                    this.current = payload;
                    this.current_pos = 0;
                }
                Poll::Ready(None) => {
                    this.eof = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let mut frame = Vec::new();
        encode_masked_frame(OPCODE_BINARY, buf, &mut frame);
        self.get_mut()
            .write_tx
            .send(frame)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "ws writer closed"))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut close_frame = Vec::new();
        encode_masked_frame(OPCODE_CLOSE, &[], &mut close_frame);
        let _ = self.get_mut().write_tx.send(close_frame);
        Poll::Ready(Ok(()))
    }
}

fn encode_masked_frame(opcode: u8, payload: &[u8], out: &mut Vec<u8>) {
    out.push(0x80 | opcode);

    let masked_len_byte = 0x80; // client frames must be masked
    let len = payload.len();
    if len < 126 {
        out.push(masked_len_byte | len as u8);
    } else if len <= 0xFFFF {
        out.push(masked_len_byte | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(masked_len_byte | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    let mut mask = [0u8; 4];
    rand::rng().fill(&mut mask);
    out.extend_from_slice(&mask);

    let start = out.len();
    out.extend_from_slice(payload);
    for (i, b) in out[start..].iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

struct Frame {
    opcode: u8,
    payload: Vec<u8>,
}

async fn read_frame(read_half: &mut ReadHalf<BoxedConn>) -> std::io::Result<Option<Frame>> {
    let mut header = [0u8; 2];
    if let Err(e) = read_half.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e);
    }

    let opcode = header[0] & 0x0F;
    let masked = header[1] & 0x80 != 0;
    let mut len = (header[1] & 0x7F) as u64;

    if len == 126 {
        let mut ext = [0u8; 2];
        read_half.read_exact(&mut ext).await?;
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        read_half.read_exact(&mut ext).await?;
        len = u64::from_be_bytes(ext);
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        read_half.read_exact(&mut m).await?;
        Some(m)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    read_half.read_exact(&mut payload).await?;
    if let Some(mask) = mask {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
    }

    Ok(Some(Frame { opcode, payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_frame_roundtrips_with_server_decode() {
        let mut out = Vec::new();
        encode_masked_frame(OPCODE_BINARY, b"hello world", &mut out);

        assert_eq!(out[0], 0x80 | OPCODE_BINARY);
        assert_eq!(out[1] & 0x80, 0x80);
        let len = (out[1] & 0x7F) as usize;
        assert_eq!(len, 11);

        let mask = [out[2], out[3], out[4], out[5]];
        let mut payload = out[6..].to_vec();
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
        assert_eq!(payload, b"hello world");
    }

    #[tokio::test]
    async fn ws_stream_round_trips_through_duplex_server() {
        use tokio::io::{AsyncReadExt, duplex};

        let (client_raw, server_raw) = duplex(8192);
        let client: BoxedConn = Box::new(client_raw);
        let mut client = WsStream::spawn(client);
        let mut server = server_raw;

        client.write_all(b"ping-payload").await.unwrap();

        // Server reads the raw masked frame and decodes it by hand, the
        // way a conforming WebSocket server would.
        let mut header = [0u8; 2];
        server.read_exact(&mut header).await.unwrap();
        let len = (header[1] & 0x7F) as usize;
        let mut mask = [0u8; 4];
        server.read_exact(&mut mask).await.unwrap();
        let mut payload = vec![0u8; len];
        server.read_exact(&mut payload).await.unwrap();
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
        assert_eq!(payload, b"ping-payload");

        // Server echoes back an unmasked binary frame; client must decode
        // it transparently.
        let mut echo = Vec::new();
        echo.push(0x80 | OPCODE_BINARY);
        echo.push(payload.len() as u8);
        echo.extend_from_slice(&payload);
        server.write_all(&echo).await.unwrap();

        let mut recv_buf = vec![0u8; payload.len()];
        client.read_exact(&mut recv_buf).await.unwrap();
        assert_eq!(recv_buf, b"ping-payload");
    }
}
