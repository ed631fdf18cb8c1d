use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use washbay::auth::AdminAuth;
use washbay::calendar::{CalendarRules, InMemoryCalendar};
use washbay::catalog::InMemoryCatalog;
use washbay::config::{Config, Seed};
use washbay::engine::{Engine, EngineDeps};
use washbay::identity::InMemoryDirectory;
use washbay::invoices::InMemoryLedger;
use washbay::notify::{LogNotifier, NotificationQueue};
use washbay::ratelimit::RateLimiter;
use washbay::{reaper, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    washbay::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let catalog = Arc::new(InMemoryCatalog::new());
    let calendar = Arc::new(InMemoryCalendar::new());
    if let Some(path) = &config.seed_path {
        Seed::load(path)?.apply(&catalog, &calendar)?;
        info!("seed data loaded from {}", path.display());
    }

    let deps = EngineDeps {
        calendar: CalendarRules::new(calendar, config.weekend),
        catalog,
        identity: Arc::new(InMemoryDirectory::new()),
        invoices: Arc::new(InMemoryLedger::new()),
        limiter: Arc::new(RateLimiter::new()),
        notifications: NotificationQueue::start(Arc::new(LogNotifier)),
    };
    let engine = Arc::new(Engine::new(config.journal_path(), config.settings(), deps)?);
    let auth = Arc::new(AdminAuth::new(config.admin_token.clone()));

    tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));
    tokio::spawn(reaper::run_limiter_sweeper(engine.clone()));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("washbay listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  bookings: {}", engine.store.booking_count());
    info!(
        "  hours: {}-{}",
        config.hours.open.format("%H:%M"),
        config.hours.close.format("%H:%M")
    );
    info!("  max_connections: {max_connections}");
    info!("  admin: {}", if auth.enabled() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
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
                        metrics::counter!(washbay::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(washbay::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(washbay::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let auth = auth.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, Some(peer), engine, auth).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(washbay::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
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
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("washbay stopped");
    Ok(())
}
