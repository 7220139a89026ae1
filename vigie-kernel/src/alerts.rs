/**
 * ALERT MONITOR - Scan périodique et historique borné des alertes
 *
 * RÔLE : Détecter seuils CPU/mémoire dépassés et transitions de cycle de
 * vie (stopped/started) sur tous les conteneurs de tous les hôtes.
 *
 * FONCTIONNEMENT :
 * - Scan via le fan-out engine toutes les N secondes
 * - Détection EDGE-TRIGGERED : une alerte par transition vers l'état
 *   violant, pas une par tick tant que la condition persiste
 * - Historique : ring buffer à capacité fixe, plus récent en tête,
 *   éviction silencieuse du plus ancien, derrière un RwLock (lectures API
 *   >> écritures du scanner)
 * - Webhook optionnel : POST JSON avec timeout borné, échec loggé jamais
 *   bloquant
 */

use crate::models::{Alert, AlertType, ContainerView};
use crate::query::query_all;
use crate::stats;
use anyhow::{Context, Result};
use bollard::container::ListContainersOptions;
use bollard::Docker;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Abstraction de l'historique d'alertes (implémentation réelle + fakes de
/// test). Toutes les méthodes sont synchrones et thread-safe.
pub trait AlertStore: Send + Sync {
    fn add(&self, alert: Alert);
    fn get_all(&self) -> Vec<Alert>;
    fn get_recent(&self, limit: usize) -> Vec<Alert>;
    /// Acquitte une alerte par id. `false` si l'id est inconnu : l'appelant
    /// doit le signaler (not found), jamais un succès silencieux.
    fn acknowledge(&self, id: &str) -> bool;
    fn unacknowledged_count(&self) -> usize;
}

/// Ring buffer à capacité fixe, plus récent en tête.
pub struct AlertRing {
    max_size: usize,
    alerts: RwLock<std::collections::VecDeque<Alert>>,
}

impl AlertRing {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            alerts: RwLock::new(std::collections::VecDeque::new()),
        }
    }
}

impl AlertStore for AlertRing {
    fn add(&self, alert: Alert) {
        let mut alerts = self.alerts.write();
        alerts.push_front(alert);
        while alerts.len() > self.max_size {
            alerts.pop_back(); // éviction du plus ancien
        }
    }

    fn get_all(&self) -> Vec<Alert> {
        self.alerts.read().iter().cloned().collect()
    }

    fn get_recent(&self, limit: usize) -> Vec<Alert> {
        self.alerts.read().iter().take(limit).cloned().collect()
    }

    fn acknowledge(&self, id: &str) -> bool {
        let mut alerts = self.alerts.write();
        match alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    fn unacknowledged_count(&self) -> usize {
        self.alerts.read().iter().filter(|a| !a.acknowledged).count()
    }
}

/// Seuils et cadence du moniteur.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub webhook_url: Option<String>,
}

/// État observé précédemment pour un conteneur, clé (host, container_id).
/// Les flags *_over portent la détection edge-triggered des seuils.
struct PrevState {
    name: String,
    running: bool,
    cpu_over: bool,
    mem_over: bool,
}

/// Diff d'état entre scans. Pure vis-à-vis du runtime : testable sans hôte.
#[derive(Default)]
struct ScanState {
    prev: HashMap<(String, String), PrevState>,
}

impl ScanState {
    /// Observe l'état de vie d'un conteneur ; première observation = baseline
    /// silencieuse, ensuite une alerte par transition.
    fn observe_lifecycle(&mut self, host: &str, id: &str, name: &str, running: bool) -> Vec<Alert> {
        let key = (host.to_string(), id.to_string());
        let mut alerts = Vec::new();

        match self.prev.get_mut(&key) {
            None => {
                self.prev.insert(
                    key,
                    PrevState {
                        name: name.to_string(),
                        running,
                        cpu_over: false,
                        mem_over: false,
                    },
                );
            }
            Some(prev) => {
                if prev.running && !running {
                    alerts.push(new_alert(
                        AlertType::ContainerStopped,
                        id,
                        name,
                        host,
                        format!("container {name} stopped on {host}"),
                        None,
                        None,
                    ));
                } else if !prev.running && running {
                    alerts.push(new_alert(
                        AlertType::ContainerStarted,
                        id,
                        name,
                        host,
                        format!("container {name} started on {host}"),
                        None,
                        None,
                    ));
                }
                prev.running = running;
                prev.name = name.to_string();
                if !running {
                    // un conteneur arrêté repart d'un état seuil neutre
                    prev.cpu_over = false;
                    prev.mem_over = false;
                }
            }
        }
        alerts
    }

    /// Observe l'usage ressources d'un conteneur en marche.
    fn observe_usage(
        &mut self,
        host: &str,
        id: &str,
        name: &str,
        cpu_percent: f64,
        memory_percent: f64,
        cfg: &MonitorConfig,
    ) -> Vec<Alert> {
        let key = (host.to_string(), id.to_string());
        let Some(prev) = self.prev.get_mut(&key) else {
            return Vec::new();
        };
        let mut alerts = Vec::new();

        let cpu_over = cpu_percent >= cfg.cpu_threshold;
        if cpu_over && !prev.cpu_over {
            alerts.push(new_alert(
                AlertType::CpuThreshold,
                id,
                name,
                host,
                format!("container {name} CPU at {cpu_percent:.1}% (threshold {:.1}%)", cfg.cpu_threshold),
                Some(cpu_percent),
                Some(cfg.cpu_threshold),
            ));
        }
        prev.cpu_over = cpu_over;

        let mem_over = memory_percent >= cfg.memory_threshold;
        if mem_over && !prev.mem_over {
            alerts.push(new_alert(
                AlertType::MemoryThreshold,
                id,
                name,
                host,
                format!("container {name} memory at {memory_percent:.1}% (threshold {:.1}%)", cfg.memory_threshold),
                Some(memory_percent),
                Some(cfg.memory_threshold),
            ));
        }
        prev.mem_over = mem_over;

        alerts
    }

    /// Un conteneur connu qui disparaît du listing alors qu'il tournait
    /// compte comme arrêté, puis est oublié.
    fn sweep_missing(&mut self, seen: &HashSet<(String, String)>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        self.prev.retain(|(host, id), prev| {
            if seen.contains(&(host.clone(), id.clone())) {
                return true;
            }
            if prev.running {
                alerts.push(new_alert(
                    AlertType::ContainerStopped,
                    id,
                    &prev.name,
                    host,
                    format!("container {} stopped on {host}", prev.name),
                    None,
                    None,
                ));
            }
            false
        });
        alerts
    }
}

fn new_alert(
    alert_type: AlertType,
    container_id: &str,
    container_name: &str,
    host: &str,
    message: String,
    value: Option<f64>,
    threshold: Option<f64>,
) -> Alert {
    Alert {
        id: Uuid::new_v4().to_string(),
        alert_type,
        container_id: container_id.to_string(),
        container_name: container_name.to_string(),
        host: host.to_string(),
        message,
        value,
        threshold,
        timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        acknowledged: false,
    }
}

/// Scanner périodique : fan-out du listing, diff d'état, stats des
/// conteneurs en marche, notification webhook.
pub struct AlertMonitor {
    clients: HashMap<String, Docker>,
    store: Arc<dyn AlertStore>,
    cfg: MonitorConfig,
    http: reqwest::Client,
    state: ScanState,
}

impl AlertMonitor {
    pub fn new(
        clients: HashMap<String, Docker>,
        store: Arc<dyn AlertStore>,
        cfg: MonitorConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("construction du client webhook")?;
        Ok(Self {
            clients,
            store,
            cfg,
            http,
            state: ScanState::default(),
        })
    }

    /// Démarre la boucle de scan. Un tick lent ne s'empile pas (interval
    /// tokio), un tick en échec n'arrête jamais la boucle.
    pub fn spawn(mut self) {
        info!(
            interval = self.cfg.interval_secs,
            cpu = self.cfg.cpu_threshold,
            memory = self.cfg.memory_threshold,
            "alert monitor started"
        );
        task::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.cfg.interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.scan_once().await;
            }
        });
    }

    async fn scan_once(&mut self) {
        let (listings, errors) = query_all(&self.clients, |_, docker: Docker| async move {
            let options = ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            };
            Ok(docker.list_containers(Some(options)).await?)
        })
        .await;

        for err in &errors {
            warn!(host = %err.host, error = %err.error, "alert scan: host unreachable");
        }

        let mut new_alerts = Vec::new();
        let mut seen = HashSet::new();

        for (host, summaries) in listings {
            let Some(docker) = self.clients.get(&host) else {
                continue;
            };
            for summary in summaries {
                let view = ContainerView::from_summary(summary, &host);
                if view.id.is_empty() {
                    continue;
                }
                let id = view.id.clone();
                let name = view.display_name().to_string();
                let running = view.state == "running";

                seen.insert((host.clone(), id.clone()));
                new_alerts.extend(self.state.observe_lifecycle(&host, &id, &name, running));

                if running {
                    // un conteneur sorti entre listing et stats est sauté
                    match stats::container_stats(docker, &host, &id).await {
                        Ok(snapshot) => {
                            new_alerts.extend(self.state.observe_usage(
                                &host,
                                &id,
                                &name,
                                snapshot.cpu_percent,
                                snapshot.memory_percent,
                                &self.cfg,
                            ));
                        }
                        Err(e) => {
                            debug!(host = %host, container = %id, error = %e, "alert scan: stats skipped");
                        }
                    }
                }
            }
        }

        new_alerts.extend(self.state.sweep_missing(&seen));

        for alert in new_alerts {
            info!(
                host = %alert.host,
                container = %alert.container_name,
                kind = ?alert.alert_type,
                "alert raised"
            );
            self.store.add(alert.clone());
            self.notify(alert);
        }
    }

    /// POST du webhook en tâche détachée : jamais bloquant pour le scan.
    fn notify(&self, alert: Alert) {
        let Some(url) = self.cfg.webhook_url.clone() else {
            return;
        };
        let http = self.http.clone();
        task::spawn(async move {
            let envelope = json!({
                "alert": alert,
                "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
                "source": "vigie-kernel",
            });
            match http.post(&url).json(&envelope).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(status = %resp.status(), "webhook refused alert");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "webhook delivery failed"),
            }
        });
    }
}
