use crate::error::GatewayError;
use crate::protocol::postgres::{
    error_response, StartupMessage, MAX_STARTUP_PACKET_LEN, SSL_REQUEST_CODE,
};
use crate::route::{self, DbKind, UpstreamMap};
use crate::server::{dial_upstream, ProxyServer, HANDSHAKE_TIMEOUT};

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use common::metrics::metric_def::{GATEWAY_HANDSHAKE_LATENCY, GATEWAY_ROUTE_ERR_TOTAL};
use common::metrics::{counter_inc, Stopwatch};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

/// Startup-phase broker for the Postgres frontend protocol.
///
/// Declines the SSL probe, extracts `database`/`user` from the startup
/// message, rewrites the database parameter when the route overrides it, and
/// forwards the (possibly rebuilt) startup packet before splicing.
pub struct PostgresProxy {
    upstreams: Arc<UpstreamMap>,
}

impl PostgresProxy {
    pub fn new(upstreams: UpstreamMap) -> Self {
        Self {
            upstreams: Arc::new(upstreams),
        }
    }

    /// Read startup packets until one that is not an SSL probe arrives.
    /// Returns the parsed message and the original packet bytes.
    async fn read_startup_message(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(StartupMessage, Vec<u8>), GatewayError> {
        loop {
            let length = stream.read_u32().await? as usize;
            if !(8..=MAX_STARTUP_PACKET_LEN).contains(&length) {
                return Err(GatewayError::handshake_parse(
                    "postgres startup packet",
                    format!("implausible length {length}"),
                ));
            }
            let mut payload = vec![0u8; length - 4];
            stream.read_exact(&mut payload).await?;

            let version = BigEndian::read_u32(&payload[..4]);
            if version == SSL_REQUEST_CODE {
                stream.write_all(b"N").await?;
                stream.flush().await?;
                continue;
            }

            let startup = StartupMessage::parse(&payload).ok_or_else(|| {
                GatewayError::handshake_parse("postgres startup packet", "truncated payload")
            })?;
            let mut raw_packet = Vec::with_capacity(length);
            raw_packet.extend_from_slice(&(length as u32).to_be_bytes());
            raw_packet.extend_from_slice(&payload);
            return Ok((startup, raw_packet));
        }
    }

    async fn reject(&self, stream: &mut TcpStream, message: &str) -> Result<(), GatewayError> {
        warn!("PgProxy reject: {message}");
        stream.write_all(&error_response(message)).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn handshake(
        &self,
        mut stream: TcpStream,
    ) -> Result<(TcpStream, TcpStream), GatewayError> {
        let (mut startup, raw_packet) = self.read_startup_message(&mut stream).await?;
        let db_name = startup.database().unwrap_or("").to_string();
        let user = startup.user().unwrap_or("").to_string();
        if db_name.is_empty() && user.is_empty() {
            let err = GatewayError::MissingIdentity;
            self.reject(&mut stream, &err.to_string()).await?;
            return Err(err);
        }

        let target = match route::resolve(&self.upstreams, DbKind::Postgres, &db_name, Some(&user))
        {
            Ok(target) => target.clone(),
            Err(e) => {
                counter_inc(GATEWAY_ROUTE_ERR_TOTAL, None);
                self.reject(&mut stream, &e.to_string()).await?;
                return Err(e.into());
            }
        };
        info!(
            "PgProxy routing db={db_name} user={user} to {}",
            target.addr()
        );

        let forward_packet = match &target.database {
            Some(database) => {
                startup.set("database", database);
                startup.encode()
            }
            None => raw_packet,
        };

        let mut upstream = match dial_upstream(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.reject(&mut stream, &e.to_string()).await?;
                return Err(e);
            }
        };
        upstream.write_all(&forward_packet).await?;
        upstream.flush().await?;
        Ok((stream, upstream))
    }
}

#[async_trait]
impl ProxyServer for PostgresProxy {
    fn kind(&self) -> DbKind {
        DbKind::Postgres
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
        info!("PgProxy session {peer} done. sent={sent} received={received}");
        Ok(())
    }
}
