use crate::async_packet_read;
use crate::error::GatewayError;
use crate::protocol::mysql::constants::SCRAMBLE_SIZE;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::handshake::{
    client_handshake_response, err_packet_summary, server_handshake,
};
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::route::{self, DbKind, UpstreamMap};
use crate::server::{dial_upstream, ProxyServer, HANDSHAKE_TIMEOUT};

use async_trait::async_trait;
use common::metrics::metric_def::{GATEWAY_HANDSHAKE_LATENCY, GATEWAY_ROUTE_ERR_TOTAL};
use common::metrics::{counter_inc, Stopwatch};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

/// Generate a random scramble from ASCII but avoid separator characters.
/// https://github.com/mysql/mysql-server/blob/8.0/mysys/crypt_genhash_impl.cc#L427
#[inline]
pub fn gen_conn_salt() -> [u8; SCRAMBLE_SIZE] {
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    let mut r = StdRng::from_entropy();
    for salt_item in salt.iter_mut() {
        *salt_item = r.gen_range(0..127) as u8;
        if *salt_item == b'\0' || *salt_item == b'$' {
            *salt_item += 1;
        }
    }
    salt
}

type SessionStreams = (
    PacketReader<OwnedReadHalf>,
    OwnedWriteHalf,
    PacketReader<OwnedReadHalf>,
    OwnedWriteHalf,
);

/// Login-phase broker for the MySQL client protocol.
///
/// Sends a synthesized Handshake v10 so the client's login can be parsed for
/// routing, then bridges the client onto the routed upstream with an auth
/// switch: the client re-encrypts its credentials against the upstream's
/// scramble and the gateway never sees a password.
pub struct MySqlProxy {
    upstreams: Arc<UpstreamMap>,
    conn_id: AtomicU32,
}

impl MySqlProxy {
    pub fn new(upstreams: UpstreamMap) -> Self {
        Self {
            upstreams: Arc::new(upstreams),
            conn_id: AtomicU32::new(1),
        }
    }

    async fn reject<W: AsyncWrite + Unpin>(
        writer: &mut PacketWriter<W>,
        seq: u8,
        message: &str,
    ) -> Result<(), GatewayError> {
        warn!("MySqlProxy reject: {message}");
        writer.set_seq(seq);
        writers::write_err_packet(ErrorKind::ER_BAD_DB_ERROR, message.as_bytes(), writer).await?;
        Ok(())
    }

    async fn handshake(&self, stream: TcpStream) -> Result<SessionStreams, GatewayError> {
        let (client_r, client_w) = stream.into_split();
        let mut client_reader = PacketReader::new(client_r);
        let mut client_writer = PacketWriter::new(client_w);

        let conn_id = self.conn_id.fetch_add(1, Ordering::Relaxed);
        let gateway_salt = gen_conn_salt();
        writers::write_initial_handshake(&mut client_writer, conn_id, gateway_salt).await?;

        let (client_seq, login_pkt) = async_packet_read!(client_reader);
        let client_login = match client_handshake_response(&login_pkt) {
            Ok((_, login)) => login,
            Err(e) => {
                return Err(GatewayError::handshake_parse(
                    "mysql handshake response",
                    format!("{e:?}"),
                ));
            }
        };
        let db_name = client_login.db_name();
        let username = client_login.user_name();
        if db_name.is_empty() && username.is_empty() {
            let err = GatewayError::MissingIdentity;
            Self::reject(&mut client_writer, client_seq.wrapping_add(1), &err.to_string()).await?;
            return Err(err);
        }

        let target = match route::resolve(&self.upstreams, DbKind::MySql, &db_name, Some(&username))
        {
            Ok(target) => target.clone(),
            Err(e) => {
                counter_inc(GATEWAY_ROUTE_ERR_TOTAL, None);
                Self::reject(&mut client_writer, client_seq.wrapping_add(1), &e.to_string())
                    .await?;
                return Err(e.into());
            }
        };
        info!(
            "MySqlProxy routing db={db_name} user={username} to {}",
            target.addr()
        );

        let upstream = match dial_upstream(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                Self::reject(&mut client_writer, client_seq.wrapping_add(1), &e.to_string())
                    .await?;
                return Err(e);
            }
        };
        let (upstream_r, upstream_w) = upstream.into_split();
        let mut upstream_reader = PacketReader::new(upstream_r);
        let mut upstream_writer = PacketWriter::new(upstream_w);

        let (_greeting_seq, greeting_pkt) = async_packet_read!(upstream_reader);
        let upstream_greeting = match server_handshake(&greeting_pkt) {
            Ok((_, greeting)) => greeting,
            Err(e) => {
                return Err(GatewayError::handshake_parse(
                    "mysql upstream greeting",
                    format!("{e:?}"),
                ));
            }
        };

        // The login we already hold was hashed against the gateway's own
        // scramble and must be discarded. Ask the client to redo auth with
        // the upstream's scramble and plugin.
        client_writer.set_seq(client_seq.wrapping_add(1));
        writers::write_auth_switch_request(
            &mut client_writer,
            &upstream_greeting.auth_plugin,
            &upstream_greeting.auth_data,
        )
        .await?;
        let (auth_resp_seq, auth_response) = async_packet_read!(client_reader);

        let database = target
            .database
            .as_ref()
            .map(|db| db.clone().into_bytes())
            .or_else(|| client_login.database.clone());
        let relay_caps = client_login.client_flag & upstream_greeting.capability_flags;
        upstream_writer.set_seq(1);
        writers::write_handshake_response(
            &mut upstream_writer,
            &client_login,
            &auth_response,
            relay_caps,
            &upstream_greeting.auth_plugin,
            database.as_deref(),
        )
        .await?;

        // Pass the upstream's verdict through either way; on ERR the
        // upstream closes shortly and the splicer propagates it.
        let (_reply_seq, reply) = async_packet_read!(upstream_reader);
        if reply.is_err_packet() {
            warn!(
                "MySqlProxy upstream rejected auth: {}",
                err_packet_summary(&reply)
            );
        }
        client_writer.set_seq(auth_resp_seq.wrapping_add(1));
        writers::write_raw_packet(&mut client_writer, &reply).await?;

        Ok((
            client_reader,
            client_writer.inner_writer,
            upstream_reader,
            upstream_writer.inner_writer,
        ))
    }
}

#[async_trait]
impl ProxyServer for MySqlProxy {
    fn kind(&self) -> DbKind {
        DbKind::MySql
    }

    async fn handle_conn(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), GatewayError> {
        let clock = Stopwatch::start();
        let (client_reader, client_writer, upstream_reader, upstream_writer) =
            timeout(HANDSHAKE_TIMEOUT, self.handshake(stream))
                .await
                .map_err(|_| GatewayError::HandshakeTimeout)??;
        clock.observe(GATEWAY_HANDSHAKE_LATENCY);

        let (sent, received) =
            super::splice::splice(client_reader, client_writer, upstream_reader, upstream_writer)
                .await;
        info!("MySqlProxy session {peer} done. sent={sent} received={received}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::handshake::HandshakeResponse;
    use crate::route::UpstreamTarget;
    use crate::server::gateway_capabilities;
    use std::io::Write;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn auth_switch_bridges_client_onto_upstream() {
        let upstream_salt: [u8; 20] = *b"UPSTREAM_SALT_20BYTE";

        // fake upstream: greets with its own salt, checks the relayed login
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        let upstream_task = tokio::spawn(async move {
            let (stream, _) = upstream_listener.accept().await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = PacketReader::new(r);
            let mut writer = PacketWriter::new(w);
            writers::write_initial_handshake(&mut writer, 99, upstream_salt)
                .await
                .unwrap();

            let (seq, login) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 1);
            let (_, relayed) = client_handshake_response(&login).unwrap();
            // only the post-switch auth bytes reach the upstream, and the
            // route's database override replaces the client's choice
            assert_eq!(relayed.auth_response, b"SECOND_RESPONSE_BYTE");
            assert_eq!(relayed.database.as_deref(), Some(&b"ordersdb"[..]));
            assert_eq!(relayed.username.as_deref(), Some(&b"app"[..]));

            writer.set_seq(2);
            writer
                .write_all(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00])
                .unwrap();
            writer.end_packet().await.unwrap();
            writer.flush_all().await.unwrap();
        });

        let mut upstreams = UpstreamMap::default();
        upstreams.insert(
            "cw_tenant_123".to_string(),
            UpstreamTarget {
                host: "127.0.0.1".to_string(),
                port: upstream_addr.port(),
                database: Some("ordersdb".to_string()),
            },
        );
        let proxy = MySqlProxy::new(upstreams);

        let gateway_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = gateway_listener.local_addr().unwrap();

        // fake client: logs in against the gateway salt, then answers the
        // auth switch with a response hashed against the upstream salt
        let client_task = tokio::spawn(async move {
            let stream = TcpStream::connect(gateway_addr).await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = PacketReader::new(r);
            let mut writer = PacketWriter::new(w);

            let (seq, greeting) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 0);
            let (_, parsed) = server_handshake(&greeting).unwrap();
            let gateway_salt = parsed.auth_data[..20].to_vec();

            let login = HandshakeResponse {
                client_flag: gateway_capabilities(),
                max_packet_len: 16777216,
                collation: 33,
                username: Some(b"app".to_vec()),
                auth_response: b"FIRST_RESPONSE_BYTES".to_vec(),
                auth_plugin: b"mysql_native_password".to_vec(),
                database: Some(b"cw_tenant_123".to_vec()),
                connect_attributes: None,
            };
            writer.set_seq(1);
            writers::write_handshake_response(
                &mut writer,
                &login,
                b"FIRST_RESPONSE_BYTES",
                gateway_capabilities(),
                b"mysql_native_password",
                Some(b"cw_tenant_123"),
            )
            .await
            .unwrap();

            let (seq, switch) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 2);
            assert_eq!(switch[0], 0xfe);
            assert!(switch[1..].starts_with(b"mysql_native_password\0"));
            // the switch carries the upstream's salt, not the gateway's
            let switch_salt = &switch[switch.len() - 21..switch.len() - 1];
            assert_eq!(switch_salt, &upstream_salt[..]);
            assert_ne!(switch_salt, &gateway_salt[..]);

            writer.set_seq(3);
            writer.write_all(b"SECOND_RESPONSE_BYTE").unwrap();
            writer.end_packet().await.unwrap();
            writer.flush_all().await.unwrap();

            let (seq, reply) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 4);
            assert!(reply.is_ok_packet());
        });

        let (gateway_stream, _) = gateway_listener.accept().await.unwrap();
        let session = proxy.handshake(gateway_stream).await.unwrap();
        client_task.await.unwrap();
        upstream_task.await.unwrap();
        drop(session);
    }

    #[tokio::test]
    async fn route_failure_answers_with_err_packet() {
        let proxy = MySqlProxy::new(UpstreamMap::default());
        let gateway_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = gateway_listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let stream = TcpStream::connect(gateway_addr).await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = PacketReader::new(r);
            let mut writer = PacketWriter::new(w);

            let (_, _greeting) = reader.next_async().await.unwrap().unwrap();
            let login = HandshakeResponse {
                client_flag: gateway_capabilities(),
                max_packet_len: 16777216,
                collation: 33,
                username: Some(b"app".to_vec()),
                auth_response: b"FIRST_RESPONSE_BYTES".to_vec(),
                auth_plugin: b"mysql_native_password".to_vec(),
                database: Some(b"nobody_home".to_vec()),
                connect_attributes: None,
            };
            writer.set_seq(1);
            writers::write_handshake_response(
                &mut writer,
                &login,
                b"FIRST_RESPONSE_BYTES",
                gateway_capabilities(),
                b"mysql_native_password",
                Some(b"nobody_home"),
            )
            .await
            .unwrap();

            let (seq, reply) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 2);
            assert!(reply.is_err_packet());
            let summary = err_packet_summary(&reply);
            assert!(summary.contains("code=1049"));
            assert!(summary.contains("Unknown tenant/source"));
        });

        let (gateway_stream, _) = gateway_listener.accept().await.unwrap();
        let err = proxy.handshake(gateway_stream).await.unwrap_err();
        assert!(matches!(err, GatewayError::Route(_)));
        client_task.await.unwrap();
    }

    #[test]
    fn conn_salt_has_no_forbidden_bytes() {
        for _ in 0..64 {
            let salt = gen_conn_salt();
            assert_eq!(salt.len(), SCRAMBLE_SIZE);
            assert!(salt.iter().all(|&b| b != b'\0' && b != b'$' && b < 128));
        }
    }

    #[test]
    fn consecutive_salts_differ() {
        // unpredictable per connection; a collision across two draws would
        // be a broken entropy source
        assert_ne!(gen_conn_salt(), gen_conn_salt());
    }
}
