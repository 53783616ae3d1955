mod auth;
mod buffer_pool;
mod compose;
mod config;
mod connection;
mod error;
mod handshake;
mod hashring;
mod inbound;
mod loader;
mod looper;
mod outbound;
mod resource;
mod session;
mod source;
mod switcher;
mod trace;

use std::net::SocketAddr;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::AuthRules;
use crate::compose::ProxyCompose;
use crate::config::{Cli, Config};
use crate::connection::ConnectionGuard;
use crate::inbound::InboundContext;
use crate::source::RuntimeIpSource;

const MONITOR_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let mut config = Config::load(&cli.config)
        .wrap_err_with(|| format!("loading {}", cli.config.display()))?;
    config.apply_cli(&cli);
    config.validate()?;

    let ports = config.global.ports()?;
    let auth = AuthRules::from_settings(&config.global)?;

    let mut sources = Vec::new();
    for source_config in config.enabled_sources() {
        sources.push(RuntimeIpSource::start(source_config.clone())?);
    }
    let compose = ProxyCompose::start(config.global.clone(), sources);
    let ctx = InboundContext::new(compose.clone(), auth);

    let mut servers = Vec::with_capacity(ports.len());
    for port in &ports {
        let addr = SocketAddr::new(config.global.listen_ip, *port);
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("binding {}", addr))?;
        servers.push(tokio::spawn(inbound::serve(ctx.clone(), listener)));
    }
    info!(
        "Proxy listening on {} ports {}..={} (HTTP, HTTPS, SOCKS5)",
        config.global.listen_ip,
        ports.first().copied().unwrap_or_default(),
        ports.last().copied().unwrap_or_default()
    );

    let monitor = tokio::spawn(monitor(compose.clone()));

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!("Failed to listen for CTRL+C: {}", e),
    }

    monitor.abort();
    for server in &servers {
        server.abort();
    }
    compose.close();

    let active = ConnectionGuard::active_count();
    if active > 0 {
        warn!("Shutting down with {} upstream connections still active", active);
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Periodic pool and connection summary.
async fn monitor(compose: ProxyCompose) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(MONITOR_INTERVAL_SECS));
    let mut last_active_count = 0;
    let mut stable_count_intervals = 0;

    loop {
        interval.tick().await;

        let pools = compose
            .looper()
            .call(|router, _| {
                router
                    .sources()
                    .map(|s| (s.name().to_string(), s.online_count(), s.overflow_count(), s.health_score()))
                    .collect::<Vec<_>>()
            })
            .await;
        let Ok(pools) = pools else {
            return;
        };
        let mut drained = false;
        for (name, online, overflow, health) in pools {
            if online == 0 {
                warn!(source = %name, "ip pool is empty");
                drained = true;
            } else {
                info!(source = %name, online, overflow, "pool health {:.0}%", health);
            }
        }
        // shift weight away from drained sources without waiting for the next period
        if drained && compose.settings().enable_float_ratio {
            compose.reload_ratio();
        }

        let active = ConnectionGuard::active_count();
        if active > 100 || (active > 0 && active != last_active_count) {
            info!("Active upstream connections: {}", active);
        }

        // a stable high count usually means leaked tunnels
        if active == last_active_count && active > 1000 {
            stable_count_intervals += 1;
            if stable_count_intervals >= 3 {
                warn!(
                    "Potential connection leak detected: {} connections stable for {} intervals",
                    active, stable_count_intervals
                );
            }
        } else {
            stable_count_intervals = 0;
        }

        match active {
            0..=5000 => {}
            5001..=15000 => info!("Moderate connection load: {} active", active),
            15001..=25000 => warn!("High connection load: {} active", active),
            _ => error!("CRITICAL connection load: {} active", active),
        }

        last_active_count = active;
    }
}
