use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

/// Read window per direction. Writes drain before the next read, so a slow
/// peer backpressures the other side naturally.
pub const SPLICE_BUFFER_SIZE: usize = 4096;

/// Copy bytes both ways until either direction sees EOF or an error, then
/// tear the whole session down.
///
/// The first direction to finish cancels the other at its next read boundary
/// and both writers are shut down; dropping the halves on return closes
/// whatever is left. Coarse, but tolerant of drivers that never shut down
/// cleanly. Returns the byte counts (client->upstream, upstream->client).
pub async fn splice<CR, CW, UR, UW>(
    mut client_reader: CR,
    mut client_writer: CW,
    mut upstream_reader: UR,
    mut upstream_writer: UW,
) -> (u64, u64)
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    let mut client_to_upstream: u64 = 0;
    let mut upstream_to_client: u64 = 0;
    {
        let forward = pump(
            &mut client_reader,
            &mut upstream_writer,
            &mut client_to_upstream,
            "client->upstream",
        );
        let backward = pump(
            &mut upstream_reader,
            &mut client_writer,
            &mut upstream_to_client,
            "upstream->client",
        );
        tokio::select! {
            _ = forward => {}
            _ = backward => {}
        }
    }
    let _ = client_writer.shutdown().await;
    let _ = upstream_writer.shutdown().await;
    (client_to_upstream, upstream_to_client)
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, count: &mut u64, label: &'static str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; SPLICE_BUFFER_SIZE];
    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                info!("GatewaySrv pipe {label} stopped: {e}");
                return;
            }
        };
        *count += read as u64;
        if let Err(e) = writer.write_all(&buf[..read]).await {
            info!("GatewaySrv pipe {label} stopped: {e}");
            return;
        }
        if let Err(e) = writer.flush().await {
            info!("GatewaySrv pipe {label} stopped: {e}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn copies_bytes_both_ways() {
        let (client_end, gateway_client_side) = duplex(256);
        let (upstream_end, gateway_upstream_side) = duplex(256);

        let task = tokio::spawn(async move {
            let (cr, cw) = split(gateway_client_side);
            let (ur, uw) = split(gateway_upstream_side);
            splice(cr, cw, ur, uw).await
        });

        let (mut client_read, mut client_write) = split(client_end);
        let (mut upstream_read, mut upstream_write) = split(upstream_end);

        client_write.write_all(b"SELECT 1").await.unwrap();
        client_write.flush().await.unwrap();
        let mut buf = [0u8; 8];
        upstream_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SELECT 1");

        upstream_write.write_all(b"row").await.unwrap();
        upstream_write.flush().await.unwrap();
        let mut buf = [0u8; 3];
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"row");

        // closing the client ends the whole session
        drop(client_write);
        drop(client_read);
        let (c2u, u2c) = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c2u, 8);
        assert_eq!(u2c, 3);
    }

    #[tokio::test]
    async fn peer_sees_eof_after_either_side_closes() {
        let (client_end, gateway_client_side) = duplex(64);
        let (upstream_end, gateway_upstream_side) = duplex(64);

        let task = tokio::spawn(async move {
            let (cr, cw) = split(gateway_client_side);
            let (ur, uw) = split(gateway_upstream_side);
            splice(cr, cw, ur, uw).await
        });

        // upstream closes first; the client read side must reach EOF
        drop(upstream_end);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        let (mut client_read, _client_write) = split(client_end);
        let mut sink = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(1), client_read.read_to_end(&mut sink))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn large_transfer_is_conserved() {
        let (client_end, gateway_client_side) = duplex(512);
        let (upstream_end, gateway_upstream_side) = duplex(512);

        let task = tokio::spawn(async move {
            let (cr, cw) = split(gateway_client_side);
            let (ur, uw) = split(gateway_upstream_side);
            splice(cr, cw, ur, uw).await
        });

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let (mut client_read, mut client_write) = split(client_end);
        let writer = tokio::spawn(async move {
            client_write.write_all(&payload).await.unwrap();
            client_write.shutdown().await.unwrap();
        });

        let (mut upstream_read, _upstream_write) = split(upstream_end);
        let mut received = Vec::new();
        upstream_read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
        let (c2u, _) = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c2u, expected.len() as u64);
        let _ = client_read.read_to_end(&mut Vec::new()).await;
    }
}
