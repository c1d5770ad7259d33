use crate::error::GatewayError;
use crate::route::{DbKind, UpstreamTarget};

use async_trait::async_trait;
use common::metrics::metric_def::{GATEWAY_CONN_TOTAL, GATEWAY_CURR_CONN};
use common::metrics::{counter_inc, gauge_dec, gauge_inc};
use common::ShutdownMessage;
use mysql_common::constants::CapabilityFlags;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch::Receiver;
use tracing::{info, warn};

pub mod mysql_srv;
pub mod postgres_srv;
pub mod splice;
pub mod tds_srv;

/// Budget from accept until the session enters the splice phase. Splice-phase
/// reads are unbounded; only the handshake is on the clock.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub static GATEWAY_CAPABILITIES_ONCE: OnceLock<CapabilityFlags> = OnceLock::new();

/// Capability set advertised in the synthesized MySQL greeting. Chosen so the
/// client sends a database name and auth framing the login parser handles.
pub fn gateway_capabilities() -> CapabilityFlags {
    *GATEWAY_CAPABILITIES_ONCE.get_or_init(|| {
        CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_LONG_FLAG
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_CONNECT_ATTRS
            | CapabilityFlags::CLIENT_DEPRECATE_EOF
    })
}

/// One frontend protocol listener. Implementations broker the handshake,
/// pick an upstream, and splice until either side closes.
#[async_trait]
pub trait ProxyServer: Send + Sync + 'static {
    fn kind(&self) -> DbKind;

    async fn handle_conn(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), GatewayError>;
}

/// Dial the routed upstream.
pub async fn dial_upstream(target: &UpstreamTarget) -> Result<TcpStream, GatewayError> {
    let addr = target.addr();
    TcpStream::connect(&addr)
        .await
        .map_err(|source| GatewayError::UpstreamDial { addr, source })
}

/// Accept loop shared by the three listeners. Every accepted connection gets
/// its own task; connection errors never reach this loop.
pub async fn serve<S: ProxyServer>(
    srv: Arc<S>,
    listener: TcpListener,
    mut shutdown_rx: Receiver<ShutdownMessage>,
) {
    let kind = srv.kind();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("GatewaySrv {kind} listener shutting down");
                return;
            }
            rs = listener.accept() => {
                match rs {
                    Ok((stream, peer)) => {
                        info!("GatewaySrv {kind} client connected: {peer}");
                        let labels = vec![("proto", kind.as_str().to_string())];
                        counter_inc(GATEWAY_CONN_TOTAL, Some(&labels));
                        gauge_inc(GATEWAY_CURR_CONN, 1.0, Some(&labels));
                        let srv = Arc::clone(&srv);
                        tokio::spawn(async move {
                            if let Err(e) = srv.handle_conn(stream, peer).await {
                                info!("GatewaySrv {kind} connection {peer} closed: {e}");
                            }
                            gauge_dec(GATEWAY_CURR_CONN, 1.0, Some(&labels));
                            info!("GatewaySrv {kind} client disconnected: {peer}");
                        });
                    }
                    Err(e) => {
                        warn!("GatewaySrv {kind} accept connection err. cause by {e:?}");
                    }
                }
            }
        }
    }
}
