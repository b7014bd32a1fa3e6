//! pnpd - démon miniserver de PnPStack.
//!
//! Charge la configuration (fichier YAML + surcharges d'environnement),
//! initialise les logs, démarre le miniserver et tourne jusqu'à Ctrl-C.

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pnpserver::{MiniServer, ServerConfig};

/// Code de sortie distinct pour un échec de démarrage du miniserver.
const EXIT_START_FAILED: i32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ========== PHASE 1 : Configuration ==========
    let config = ServerConfig::load_default().context("failed to load configuration")?;
    info!(
        "🚀 Starting pnpd (HTTP port {}, IPv6 {}, SSDP {})",
        config.http_port,
        if config.enable_ipv6 { "on" } else { "off" },
        if config.enable_ssdp { "on" } else { "off" },
    );

    #[cfg(feature = "tls")]
    let tls_acceptor = match &config.tls {
        Some(files) => Some(pnpserver::tls::build_acceptor(files)?),
        None => None,
    };

    // ========== PHASE 2 : Miniserver ==========
    let server = MiniServer::new(config);
    #[cfg(feature = "tls")]
    let server = match tls_acceptor {
        Some(acceptor) => server.with_tls_acceptor(acceptor),
        None => server,
    };

    let handle = match server.start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("❌ Miniserver failed to start: {}", e);
            std::process::exit(EXIT_START_FAILED);
        }
    };
    info!("✅ Miniserver ready at {}", handle.base_url());
    if handle.ssdp_port() != 0 {
        info!("📡 SSDP receiver on port {}", handle.ssdp_port());
    }

    // ========== PHASE 3 : Exploitation ==========
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("👋 Shutting down...");
    handle.stop().await;
    info!("✅ Miniserver stopped cleanly");

    Ok(())
}
