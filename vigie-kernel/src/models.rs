/**
 * MODELS VIGIE - Types partagés du plan de contrôle multi-hôtes
 *
 * RÔLE : Modèle de données central : identités conteneurs, entrées de logs,
 * snapshots de stats dérivées, alertes et erreurs par hôte.
 *
 * ARCHITECTURE : structs serde pures, aucune logique réseau ici.
 * UTILITÉ : contrat unique entre les moteurs (logs/stats/alertes) et l'API.
 */

use bollard::models::{ContainerSummary, ImageSummary, Network};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Un hôte configuré : nom unique + URI d'endpoint runtime.
/// Immuable après démarrage (le connecteur possède la table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub name: String,               // clé unique (ex: "local", "prod")
    pub endpoint: String,           // unix:///..., tcp://..., ssh://user@host
}

/// Identité d'un conteneur vue par les appelants.
/// `id` change à chaque recréation : la poignée stable est (host, name).
#[derive(Debug, Clone, Serialize)]
pub struct ContainerIdentity {
    pub id: String,
    pub names: Vec<String>,
    pub host: String,
}

/// Niveau de sévérité détecté dans une ligne de log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Panic,
    Unknown,
}

/// Flux d'origine d'une ligne (démultiplexage stdout/stderr).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStreamKind {
    Stdout,
    Stderr,
}

/// Une ligne de log parsée. Jamais persistée : les consommateurs
/// bufferisent eux-mêmes au-delà du tail demandé.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    pub level: LogLevel,
    pub message: String,
    pub stream: LogStreamKind,
    pub raw: String,
}

/// Snapshot de stats dérivées pour un conteneur.
/// cpu_percent et les agrégats I/O sont calculés, pas natifs du transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStats {
    pub container_id: String,
    pub host: String,
    pub cpu_percent: f64,
    pub memory_usage: u64,          // octets
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,            // somme de toutes les interfaces
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,
    pub timestamp: i64,             // epoch secondes
}

/// Types d'alertes émises par le moniteur périodique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ContainerStopped,
    ContainerStarted,
    CpuThreshold,
    MemoryThreshold,
}

/// Une alerte levée par le moniteur. Mutée uniquement par acquittement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub container_id: String,
    pub container_name: String,
    pub host: String,
    pub message: String,
    pub value: Option<f64>,         // valeur mesurée (seuils uniquement)
    pub threshold: Option<f64>,
    pub timestamp: i64,             // epoch secondes
    pub acknowledged: bool,
}

/// Échec isolé d'un hôte pendant un fan-out : une valeur, pas une exception.
#[derive(Debug, Clone, Serialize)]
pub struct HostError {
    pub host: String,
    pub error: String,
}

// Vues aplaties renvoyées par les listings fan-out (une ligne = un objet
// taggé par son hôte d'origine).

#[derive(Debug, Clone, Serialize)]
pub struct ContainerView {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,              // running, exited, paused...
    pub status: String,             // "Up 3 hours", "Exited (0)..."
    pub host: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageView {
    pub id: String,
    pub tags: Vec<String>,
    pub size: i64,
    pub host: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkView {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub scope: String,
    pub host: String,
}

impl ContainerView {
    pub fn from_summary(summary: ContainerSummary, host: &str) -> Self {
        Self {
            id: summary.id.unwrap_or_default(),
            names: summary
                .names
                .unwrap_or_default()
                .into_iter()
                .map(|n| n.trim_start_matches('/').to_string())
                .collect(),
            image: summary.image.unwrap_or_default(),
            state: summary.state.unwrap_or_default(),
            status: summary.status.unwrap_or_default(),
            host: host.to_string(),
        }
    }

    /// Nom d'affichage : premier nom, sinon id court.
    pub fn display_name(&self) -> &str {
        self.names
            .first()
            .map(|s| s.as_str())
            .unwrap_or_else(|| short_id(&self.id))
    }
}

impl ImageView {
    pub fn from_summary(summary: ImageSummary, host: &str) -> Self {
        Self {
            id: summary.id,
            tags: summary.repo_tags,
            size: summary.size,
            host: host.to_string(),
        }
    }
}

impl NetworkView {
    pub fn from_network(network: Network, host: &str) -> Self {
        Self {
            id: network.id.unwrap_or_default(),
            name: network.name.unwrap_or_default(),
            driver: network.driver.unwrap_or_default(),
            scope: network.scope.unwrap_or_default(),
            host: host.to_string(),
        }
    }
}

/// Id court docker (12 premiers caractères).
pub fn short_id(id: &str) -> &str {
    if id.len() >= 12 {
        &id[..12]
    } else {
        id
    }
}
