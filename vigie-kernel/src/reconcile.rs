/**
 * ENV RECONCILIATION - Mutation d'environnement par recréation
 *
 * RÔLE : Appliquer une map d'environnement désirée à un conteneur. Le
 * runtime ne permet pas de muter l'env d'un conteneur existant : on le
 * détruit et on le recrée sous le MÊME nom avec la même config (image,
 * commande, réseaux) et le nouvel environnement.
 *
 * ATTENTION : non transactionnel. Un échec entre remove et create laisse le
 * conteneur absent ; l'opération cause un vrai downtime. La nouvelle
 * identité est retournée pour que l'appelant se re-clé (l'id est éphémère,
 * (host, name) est la poignée stable).
 *
 * Machine à états explicite : inspecting → stopping → removing → creating
 * → starting ; chaque échec porte la phase où il s'est produit.
 */

use crate::models::ContainerIdentity;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    Inspecting,
    Stopping,
    Removing,
    Creating,
    Starting,
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcilePhase::Inspecting => "inspecting",
            ReconcilePhase::Stopping => "stopping",
            ReconcilePhase::Removing => "removing",
            ReconcilePhase::Creating => "creating",
            ReconcilePhase::Starting => "starting",
        };
        f.write_str(s)
    }
}

/// Échec daté d'une phase précise : les états partiels (conteneur arrêté,
/// voire supprimé) sont observables par l'appelant, pas implicites.
#[derive(Debug, Error)]
#[error("reconciliation env de {container}: échec en phase {phase}: {source}")]
pub struct ReconcileError {
    pub phase: ReconcilePhase,
    pub container: String,
    #[source]
    pub source: anyhow::Error,
}

impl ReconcileError {
    fn wrap<E: Into<anyhow::Error>>(
        phase: ReconcilePhase,
        container: &str,
    ) -> impl FnOnce(E) -> Self + '_ {
        move |e| Self {
            phase,
            container: container.to_string(),
            source: e.into(),
        }
    }
}

/// Calcule la liste d'env finale : les clés existantes absentes de la map
/// désirée sont droppées, toutes les clés désirées sont appliquées
/// (écrasement ou ajout). L'ordre d'origine est préservé pour les clés
/// conservées, les nouvelles sont ajoutées triées.
pub fn merge_env(current: &[String], desired: &HashMap<String, String>) -> Vec<String> {
    let mut remaining: BTreeMap<&str, &str> = desired
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let mut merged = Vec::with_capacity(desired.len());
    for entry in current {
        let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(entry);
        if let Some(value) = remaining.remove(key) {
            merged.push(format!("{key}={value}"));
        }
    }
    for (key, value) in remaining {
        merged.push(format!("{key}={value}"));
    }
    merged
}

/// Applique `desired` au conteneur en le recréant sous le même nom.
/// Retourne la nouvelle identité (nouvel id, même nom).
pub async fn reconcile_env(
    docker: &Docker,
    host: &str,
    container: &str,
    desired: HashMap<String, String>,
) -> Result<ContainerIdentity, ReconcileError> {
    warn!(
        host = %host,
        container = %container,
        "env reconciliation: destroy-and-recreate, downtime en cours"
    );

    // inspecting
    debug!(container = %container, phase = %ReconcilePhase::Inspecting, "reconcile");
    let inspect = docker
        .inspect_container(container, None::<InspectContainerOptions>)
        .await
        .map_err(ReconcileError::wrap(ReconcilePhase::Inspecting, container))?;

    let name = inspect
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ReconcileError {
            phase: ReconcilePhase::Inspecting,
            container: container.to_string(),
            source: anyhow::anyhow!("conteneur sans nom"),
        })?;

    let container_config = inspect.config.ok_or_else(|| ReconcileError {
        phase: ReconcilePhase::Inspecting,
        container: container.to_string(),
        source: anyhow::anyhow!("inspect sans config"),
    })?;

    let current_env = container_config.env.clone().unwrap_or_default();
    let new_env = merge_env(&current_env, &desired);

    // même config, nouvel environnement, mêmes rattachements réseau
    let mut create_config: Config<String> = Config::from(container_config);
    create_config.env = Some(new_env);
    create_config.host_config = inspect.host_config;
    create_config.networking_config = inspect
        .network_settings
        .and_then(|settings| settings.networks)
        .map(|networks| NetworkingConfig {
            endpoints_config: networks,
        });

    // stopping (un conteneur déjà arrêté n'est pas une erreur)
    debug!(container = %container, phase = %ReconcilePhase::Stopping, "reconcile");
    if let Err(e) = docker
        .stop_container(container, Some(StopContainerOptions { t: 10 }))
        .await
    {
        if !is_not_modified(&e) {
            return Err(ReconcileError::wrap(ReconcilePhase::Stopping, container)(e));
        }
    }

    // removing — point de non-retour
    debug!(container = %container, phase = %ReconcilePhase::Removing, "reconcile");
    docker
        .remove_container(
            container,
            Some(RemoveContainerOptions {
                force: false,
                ..Default::default()
            }),
        )
        .await
        .map_err(ReconcileError::wrap(ReconcilePhase::Removing, container))?;

    // creating, sous le même nom
    debug!(container = %container, phase = %ReconcilePhase::Creating, "reconcile");
    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.clone(),
                platform: None,
            }),
            create_config,
        )
        .await
        .map_err(ReconcileError::wrap(ReconcilePhase::Creating, container))?;

    // starting
    debug!(container = %created.id, phase = %ReconcilePhase::Starting, "reconcile");
    docker
        .start_container(&created.id, None::<StartContainerOptions<String>>)
        .await
        .map_err(ReconcileError::wrap(ReconcilePhase::Starting, container))?;

    info!(
        host = %host,
        name = %name,
        old_id = %container,
        new_id = %created.id,
        "env reconciliation done"
    );

    Ok(ContainerIdentity {
        id: created.id,
        names: vec![name],
        host: host.to_string(),
    })
}

/// 304 Not Modified : le conteneur était déjà arrêté.
fn is_not_modified(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_env_drops_and_overwrites() {
        let current = vec!["A=0".to_string(), "B=2".to_string()];
        let merged = merge_env(&current, &desired(&[("A", "1")]));
        // B droppé, A écrasé
        assert_eq!(merged, vec!["A=1"]);
    }

    #[test]
    fn test_merge_env_preserves_order_and_appends_new_keys() {
        let current = vec!["B=2".to_string(), "A=0".to_string()];
        let merged = merge_env(&current, &desired(&[("A", "1"), ("C", "3"), ("D", "4")]));
        // A garde sa position d'origine, C et D ajoutés triés
        assert_eq!(merged, vec!["A=1", "C=3", "D=4"]);
    }

    #[test]
    fn test_merge_env_value_containing_equals() {
        let current = vec!["PATH=/usr/bin:/bin".to_string()];
        let merged = merge_env(&current, &desired(&[("PATH", "/a=b:/c")]));
        assert_eq!(merged, vec!["PATH=/a=b:/c"]);
    }

    #[test]
    fn test_merge_env_empty_desired_drops_everything() {
        let current = vec!["A=1".to_string(), "B=2".to_string()];
        assert!(merge_env(&current, &HashMap::new()).is_empty());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ReconcilePhase::Removing.to_string(), "removing");
    }
}
