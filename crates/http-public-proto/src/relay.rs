//! Bidirectional byte relay between two spliced sockets

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Splice `a` and `b` together: bytes read from one are written to the other.
///
/// The relay ends as soon as either direction finishes, whether by EOF or by
/// an error, and both streams are shut down and dropped at that point.
/// Returns the number of bytes forwarded `(a -> b, b -> a)`.
pub async fn splice<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    {
        let forward = pump(&mut a_read, &mut b_write, &mut a_to_b);
        let backward = pump(&mut b_read, &mut a_write, &mut b_to_a);
        tokio::pin!(forward);
        tokio::pin!(backward);

        tokio::select! {
            res = &mut forward => trace!("Relay forward direction finished: {:?}", res),
            res = &mut backward => trace!("Relay backward direction finished: {:?}", res),
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    debug!(
        "Relay closed ({} bytes forward, {} bytes backward)",
        a_to_b, b_to_a
    );
    (a_to_b, b_to_a)
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (visitor, mut visitor_far) = duplex(1024);
        let (tunnel, mut tunnel_far) = duplex(1024);
        let relay = tokio::spawn(splice(visitor, tunnel));

        visitor_far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tunnel_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        tunnel_far.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        visitor_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        drop(visitor_far);
        let (forward, backward) = relay.await.unwrap();
        assert_eq!(forward, 5);
        assert_eq!(backward, 6);
    }

    #[tokio::test]
    async fn test_closing_one_side_closes_the_other() {
        let (visitor, visitor_far) = duplex(1024);
        let (tunnel, mut tunnel_far) = duplex(1024);
        let relay = tokio::spawn(splice(visitor, tunnel));

        drop(visitor_far);
        relay.await.unwrap();

        let mut rest = Vec::new();
        let n = tunnel_far.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);
    }
}
