use crate::error::GatewayError;
use crate::protocol::tds::{login7_database, TdsHeader, LOGIN7_PACKET_TYPE, TDS_HEADER_LEN};
use crate::route::{self, DbKind, UpstreamMap};
use crate::server::{dial_upstream, ProxyServer, HANDSHAKE_TIMEOUT};

use async_trait::async_trait;
use common::metrics::metric_def::{GATEWAY_HANDSHAKE_LATENCY, GATEWAY_ROUTE_ERR_TOTAL};
use common::metrics::{counter_inc, Stopwatch};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

/// Login-phase broker for the TDS (SQL Server) protocol.
///
/// Only inspects the Login7 database slot to pick an upstream; the frame is
/// forwarded byte-identical. Failures close the socket without an error
/// frame: TDS clients do not reliably consume post-Login7 errors from a
/// server that never answered the login.
pub struct TdsProxy {
    upstreams: Arc<UpstreamMap>,
}

impl TdsProxy {
    pub fn new(upstreams: UpstreamMap) -> Self {
        Self {
            upstreams: Arc::new(upstreams),
        }
    }

    async fn handshake(
        &self,
        mut stream: TcpStream,
    ) -> Result<(TcpStream, TcpStream), GatewayError> {
        let mut raw_header = [0u8; TDS_HEADER_LEN];
        stream.read_exact(&mut raw_header).await?;
        let header = TdsHeader::parse(&raw_header);
        if header.packet_type != LOGIN7_PACKET_TYPE {
            return Err(GatewayError::handshake_parse(
                "tds login packet",
                format!("unexpected packet type 0x{:02x}", header.packet_type),
            ));
        }
        let mut payload = vec![0u8; header.payload_len()];
        stream.read_exact(&mut payload).await?;

        let db_name = login7_database(&payload).unwrap_or_default();
        let target = match route::resolve(&self.upstreams, DbKind::SqlServer, &db_name, None) {
            Ok(target) => target.clone(),
            Err(e) => {
                counter_inc(GATEWAY_ROUTE_ERR_TOTAL, None);
                warn!("TdsProxy reject: {e}");
                return Err(e.into());
            }
        };
        info!("TdsProxy routing db={db_name} to {}", target.addr());

        let mut upstream = dial_upstream(&target).await?;
        // forward the original Login7 frame untouched
        upstream.write_all(&raw_header).await?;
        upstream.write_all(&payload).await?;
        upstream.flush().await?;
        Ok((stream, upstream))
    }
}

#[async_trait]
impl ProxyServer for TdsProxy {
    fn kind(&self) -> DbKind {
        DbKind::SqlServer
    }

    async fn handle_conn(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), GatewayError> {
        let clock = Stopwatch::start();
        let (client, upstream) = timeout(HANDSHAKE_TIMEOUT, self.handshake(stream))
            .await
            .map_err(|_| GatewayError::HandshakeTimeout)??;
        clock.observe(GATEWAY_HANDSHAKE_LATENCY);

        let (client_reader, client_writer) = client.into_split();
        let (upstream_reader, upstream_writer) = upstream.into_split();
        let (sent, received) =
            super::splice::splice(client_reader, client_writer, upstream_reader, upstream_writer)
                .await;
        info!("TdsProxy session {peer} done. sent={sent} received={received}");
        Ok(())
    }
}
