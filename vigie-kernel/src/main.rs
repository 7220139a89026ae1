/**
 * VIGIE KERNEL - Point d'entrée du plan de contrôle multi-hôtes
 *
 * RÔLE : Orchestration des modules : config, connecteurs runtime, fan-out,
 * moniteur d'alertes, API REST/WS. Bootstrap complet avec fail-fast sur la
 * table d'hôtes.
 *
 * ARCHITECTURE : un client runtime par hôte configuré (socket local, TCP ou
 * tunnel SSH), moteurs de streaming par session, scan d'alertes périodique.
 * UTILITÉ : vue unique et temps réel sur plusieurs runtimes conteneurs.
 */

mod alerts;
mod config;
mod hosts;
mod http;
mod logs;
mod models;
mod query;
mod reconcile;
mod stats;
mod terminal;

use crate::alerts::{AlertMonitor, AlertRing, AlertStore, MonitorConfig};
use crate::config::KernelConfig;
use crate::hosts::HostManager;
use crate::http::AppState;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = KernelConfig::load();
    info!(hosts = cfg.hosts.len(), "starting vigie-kernel");
    if cfg.api_key.is_none() {
        warn!("VIGIE_API_KEY non défini : API en mode ouvert");
    }

    // Connexion de tous les hôtes : le SEUL chemin fatal. Une table d'hôtes
    // partielle est pire qu'un échec franc.
    let hosts = match HostManager::connect(&cfg.hosts, &cfg.ssh_opts).await {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("host table initialization failed: {e:#}");
            std::process::exit(1);
        }
    };

    // Historique d'alertes + moniteur périodique
    let alert_store: Arc<dyn AlertStore> = Arc::new(AlertRing::new(cfg.alert_history));
    let monitor_cfg = MonitorConfig {
        interval_secs: cfg.alert_interval_secs,
        cpu_threshold: cfg.cpu_alert_threshold,
        memory_threshold: cfg.memory_alert_threshold,
        webhook_url: cfg.alert_webhook_url.clone(),
    };
    match AlertMonitor::new(hosts.clients(), alert_store.clone(), monitor_cfg) {
        Ok(monitor) => monitor.spawn(),
        Err(e) => {
            // le kernel reste utile sans moniteur, on ne tue pas le process
            error!("alert monitor unavailable: {e:#}");
        }
    }

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        hosts,
        alerts: alert_store,
        started_at: Instant::now(),
    };

    // HTTP
    let app = http::build_router(app_state);

    info!(addr = %cfg.listen_addr, "kernel listening");
    let listener = match TcpListener::bind(&cfg.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("bind {} failed: {e}", cfg.listen_addr);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!("server stopped: {e}");
        std::process::exit(1);
    }
}
