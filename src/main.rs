use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use tempora::engine::Engine;
use tempora::identity::UlidAllocator;
use tempora::permission::OwnerPolicy;
use tempora::service::SchedulerService;
use tempora::{maintenance, wire};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("TEMPORA_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    tempora::observability::init(metrics_port)?;

    let port = std::env::var("TEMPORA_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("TEMPORA_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("TEMPORA_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("TEMPORA_PASSWORD").unwrap_or_else(|_| "tempora".into());
    let max_connections: usize = env_or("TEMPORA_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("TEMPORA_COMPACT_THRESHOLD", 1000);
    let query_timeout = Duration::from_secs(env_or(
        "TEMPORA_QUERY_TIMEOUT_SECS",
        tempora::limits::DEFAULT_QUERY_TIMEOUT.as_secs(),
    ));
    let admins: Vec<String> = std::env::var("TEMPORA_ADMINS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    let tls_cert = std::env::var("TEMPORA_TLS_CERT").ok();
    let tls_key = std::env::var("TEMPORA_TLS_KEY").ok();
    let tls_acceptor =
        tempora::tls::load_tls_acceptor(tls_cert.as_deref().map(Path::new), tls_key.as_deref().map(Path::new))?;

    std::fs::create_dir_all(&data_dir)?;
    let engine = Arc::new(Engine::new(PathBuf::from(&data_dir).join("tempora.wal"))?);
    let service = Arc::new(SchedulerService::new(
        engine.clone(),
        tokio::runtime::Handle::current(),
        Arc::new(OwnerPolicy::new(admins.iter().cloned())),
        Arc::new(UlidAllocator::new()),
        query_timeout,
    ));
    tokio::spawn(maintenance::run_compactor(engine, compact_threshold));

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("tempora listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  query_timeout: {}s", query_timeout.as_secs());
    info!("  admins: {}", if admins.is_empty() { "none".to_string() } else { admins.join(", ") });
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler ({e}), stopping on ctrl-c only");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(tempora::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(tempora::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(tempora::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let service = service.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, service, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(tempora::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("tempora stopped");
    Ok(())
}
