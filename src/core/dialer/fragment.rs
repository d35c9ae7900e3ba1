use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Splits the first TLS ClientHello write into two TCP writes at a random
/// offset, defeating passive SNI sniffing on the first record boundary
/// (§4.D.2, P8). One-shot: every later write passes straight through.
pub struct FragmentShim<S> {
    inner: S,
    done: bool,
    pending_jitter: Option<Pin<Box<Sleep>>>,
}

impl<S> FragmentShim<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            done: false,
            pending_jitter: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentShim<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentShim<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        if let Some(sleep) = self.pending_jitter.as_mut() {
            match sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.pending_jitter = None;
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        if !self.done && buf.len() > 50 && buf[0] == 0x16 {
            self.done = true;
            let cut = rand::rng().random_range(5..15);
            match Pin::new(&mut self.inner).poll_write(cx, &buf[..cut]) {
                Poll::Ready(Ok(n)) => {
                    let jitter_ms = rand::rng().random_range(0..5);
                    self.pending_jitter = Some(Box::pin(tokio::time::sleep(std::time::Duration::from_millis(jitter_ms))));
                    Poll::Ready(Ok(n))
                }
                other => other,
            }
        } else {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    #[tokio::test]
    async fn splits_first_tls_record_write() {
        let (client, mut server) = duplex(4096);
        let mut shim = FragmentShim::new(client);

        let mut payload = vec![0x16u8];
        payload.extend(std::iter::repeat(0xAAu8).take(100));

        shim.write_all(&payload).await.unwrap();
        shim.flush().await.unwrap();

        let mut received = vec![0u8; payload.len()];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn passes_through_non_handshake_writes_untouched() {
        let (client, mut server) = duplex(4096);
        let mut shim = FragmentShim::new(client);

        shim.write_all(b"plain data").await.unwrap();

        let mut received = vec![0u8; 10];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut received).await.unwrap();
        assert_eq!(&received, b"plain data");
    }
}
