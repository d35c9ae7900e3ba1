//! Half-close-aware bidirectional TCP forwarder (§4.G, P5).
//!
//! The teacher's `proxy_bidirectional` in `src/prism/proxy.rs` uses
//! `tokio::io::copy_bidirectional` plus a single best-effort
//! `shutdown()` once both halves finish — fine for a plain relay, but it
//! cannot half-close one direction while the other is still flowing,
//! which this spec requires: an inbound EOF must close only the
//! outbound write side so the outbound's response can still arrive.
//! This module keeps the teacher's "two tasks, `tokio::io::copy`-style
//! pump, then shutdown" idiom but runs each direction to its own
//! completion independently, exactly as two calls to `tokio::io::copy`
//! followed by a per-direction `shutdown()` would.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, copy};

const COPY_BUF_HINT: usize = 32 * 1024;

/// Splices `inbound` and `outbound` until both directions have reached
/// EOF or either direction errors. Each direction's EOF triggers only
/// that direction's half-close; the other direction keeps running.
///
/// `buffer_hint` documents the suggested 16–32 KiB per-direction buffer
/// from §4.G; `tokio::io::copy` manages its own internal buffer, so the
/// constant exists for callers that want to size their own readers
/// rather than to parameterize this function.
pub async fn splice<A, B>(inbound: A, outbound: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut in_read, mut in_write) = tokio::io::split(inbound);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);

    let inbound_to_outbound = tokio::spawn(async move {
        let result = copy(&mut in_read, &mut out_write).await;
        let _ = out_write.shutdown().await;
        result
    });

    let outbound_to_inbound = tokio::spawn(async move {
        let result = copy(&mut out_read, &mut in_write).await;
        let _ = in_write.shutdown().await;
        result
    });

    let (a, b) = tokio::join!(inbound_to_outbound, outbound_to_inbound);

    let sent = a.map_err(|e| std::io::Error::other(format!("inbound->outbound task: {e}")))??;
    let received = b.map_err(|e| std::io::Error::other(format!("outbound->inbound task: {e}")))??;

    Ok((sent, received))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn splices_both_directions_and_reports_byte_counts() {
        let (inbound, mut inbound_peer) = duplex(4096);
        let (outbound, mut outbound_peer) = duplex(4096);

        let forward = tokio::spawn(splice(inbound, outbound));

        inbound_peer.write_all(b"hello-outbound").await.unwrap();
        let mut got = vec![0u8; b"hello-outbound".len()];
        outbound_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello-outbound");

        outbound_peer.write_all(b"hello-inbound").await.unwrap();
        let mut got2 = vec![0u8; b"hello-inbound".len()];
        inbound_peer.read_exact(&mut got2).await.unwrap();
        assert_eq!(&got2, b"hello-inbound");

        drop(inbound_peer);
        drop(outbound_peer);

        let (sent, received) = forward.await.unwrap().unwrap();
        assert_eq!(sent, "hello-outbound".len() as u64);
        assert_eq!(received, "hello-inbound".len() as u64);
    }

    #[tokio::test]
    async fn inbound_eof_half_closes_outbound_without_killing_the_reverse_direction() {
        let (inbound, mut inbound_peer) = duplex(4096);
        let (outbound, mut outbound_peer) = duplex(4096);

        let forward = tokio::spawn(splice(inbound, outbound));

        // Inbound finishes immediately (client sent its request and closed).
        drop(inbound_peer);

        // The outbound→inbound direction must still be able to deliver a
        // response after the inbound side reached EOF.
        outbound_peer.write_all(b"late-response").await.unwrap();
        drop(outbound_peer);

        let (_sent, received) = forward.await.unwrap().unwrap();
        assert_eq!(received, "late-response".len() as u64);
    }
}
