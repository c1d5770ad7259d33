use anyhow::Context;
use clap::Parser;
use common::ShutdownMessage;
use gateway::config::GatewayConfig;
use gateway::error::GatewayError;
use gateway::server::mysql_srv::MySqlProxy;
use gateway::server::postgres_srv::PostgresProxy;
use gateway::server::tds_srv::TdsProxy;
use gateway::server::{serve, ProxyServer};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[clap(
    name = "db-gateway",
    version = "0.1.0",
    about = "multi-protocol database gateway routing tenants to their upstreams."
)]
pub struct GatewayArgs {
    #[clap(long, value_name = "WORKS", default_value_t = 4)]
    pub works: usize,
    #[clap(long, value_name = "ENABLE METRICS COLLECTOR", default_value_t = false)]
    pub enable_metrics: bool,
    #[clap(long, value_name = "METRICS_PORT", default_value_t = 9000)]
    pub metrics_port: u16,
    #[clap(long, value_name = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Block until SIGINT or SIGTERM arrives, then tell every listener to wind
/// down through the shared watch channel.
async fn wait_for_shutdown(shutdown_tx: &watch::Sender<ShutdownMessage>) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let caught = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    info!("GatewaySrv caught {caught}, draining listeners");
    shutdown_tx.send(ShutdownMessage::Cancel(caught.to_string()))?;
    Ok(())
}

async fn bind(addr: &str) -> Result<TcpListener, GatewayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind {
            addr: addr.to_string(),
            source,
        })
}

fn main() -> anyhow::Result<()> {
    let gateway_args = GatewayArgs::parse();
    let log_level_string = gateway_args
        .log_level
        .clone()
        .unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse().unwrap())
        .add_directive("h2=INFO".parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let config = GatewayConfig::from_env().context("GatewaySrv configuration is malformed")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("DB_GATEWAY")
        .worker_threads(gateway_args.works)
        .build()?;

    info!("GatewaySrv running config args={gateway_args:?}");
    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);
    runtime.block_on(async {
        if gateway_args.enable_metrics {
            let metrics_addr =
                SocketAddr::from(([0, 0, 0, 0], gateway_args.metrics_port));
            common::metrics::init_metrics_context(metrics_addr);
        }

        let pg_listener = bind(&config.pg_listen_addr()).await?;
        let mysql_listener = bind(&config.mysql_listen_addr()).await?;
        let tds_listener = bind(&config.sqlserver_listen_addr()).await?;

        let pg_srv = Arc::new(PostgresProxy::new(config.postgres_upstreams.clone()));
        let mysql_srv = Arc::new(MySqlProxy::new(config.mysql_upstreams.clone()));
        let tds_srv = Arc::new(TdsProxy::new(config.sqlserver_upstreams.clone()));

        info!(
            "GatewaySrv listening. {}={} {}={} {}={}",
            pg_srv.kind(),
            config.pg_listen_addr(),
            mysql_srv.kind(),
            config.mysql_listen_addr(),
            tds_srv.kind(),
            config.sqlserver_listen_addr(),
        );

        tokio::spawn(serve(pg_srv, pg_listener, shutdown_rx.clone()));
        tokio::spawn(serve(mysql_srv, mysql_listener, shutdown_rx.clone()));
        tokio::spawn(serve(tds_srv, tds_listener, shutdown_rx.clone()));

        wait_for_shutdown(&shutdown_tx).await?;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}
