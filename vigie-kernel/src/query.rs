/**
 * FAN-OUT QUERY ENGINE - Une requête, tous les hôtes, échecs isolés
 *
 * RÔLE : Exécuter la même opération sur chaque endpoint connecté en
 * parallèle et agréger succès partiels + erreurs par hôte.
 *
 * FONCTIONNEMENT : un worker par hôte dans un JoinSet. Un worker qui échoue
 * (ou panique) devient un HostError, jamais un échec global ; drop de
 * l'appel = abort de tous les workers en vol (propagation d'annulation).
 * Aucune garantie d'ordre, ni sur la map ni sur la liste d'erreurs.
 */

use crate::models::{ContainerView, HostError, ImageView, NetworkView};
use anyhow::Result;
use bollard::container::ListContainersOptions;
use bollard::image::ListImagesOptions;
use bollard::network::ListNetworksOptions;
use bollard::Docker;
use std::collections::HashMap;
use std::future::Future;
use tokio::task::JoinSet;

/// Lance `op` sur chaque client et collecte (succès par hôte, erreurs).
/// Zéro hôte configuré → résultat vide immédiat, pas une erreur.
pub async fn query_all<C, T, F, Fut>(
    clients: &HashMap<String, C>,
    op: F,
) -> (HashMap<String, T>, Vec<HostError>)
where
    C: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(String, C) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let mut workers = JoinSet::new();
    for (name, client) in clients {
        let name = name.clone();
        let fut = op(name.clone(), client.clone());
        workers.spawn(async move { (name, fut.await) });
    }

    let mut results = HashMap::new();
    let mut errors = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((host, Ok(value))) => {
                results.insert(host, value);
            }
            Ok((host, Err(e))) => {
                errors.push(HostError {
                    host,
                    error: e.to_string(),
                });
            }
            // Un worker a paniqué : isolé, le collecteur continue.
            Err(join_err) => {
                errors.push(HostError {
                    host: "<worker>".into(),
                    error: join_err.to_string(),
                });
            }
        }
    }
    (results, errors)
}

/// Listing conteneurs sur tous les hôtes (y compris arrêtés), aplati en vues.
pub async fn list_all_containers(
    clients: &HashMap<String, Docker>,
) -> (Vec<ContainerView>, Vec<HostError>) {
    let (per_host, errors) = query_all(clients, |_, docker: Docker| async move {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        Ok(docker.list_containers(Some(options)).await?)
    })
    .await;

    let mut views = Vec::new();
    for (host, summaries) in per_host {
        views.extend(
            summaries
                .into_iter()
                .map(|s| ContainerView::from_summary(s, &host)),
        );
    }
    (views, errors)
}

/// Listing images sur tous les hôtes.
pub async fn list_all_images(
    clients: &HashMap<String, Docker>,
) -> (Vec<ImageView>, Vec<HostError>) {
    let (per_host, errors) = query_all(clients, |_, docker: Docker| async move {
        let options = ListImagesOptions::<String>::default();
        Ok(docker.list_images(Some(options)).await?)
    })
    .await;

    let mut views = Vec::new();
    for (host, summaries) in per_host {
        views.extend(summaries.into_iter().map(|s| ImageView::from_summary(s, &host)));
    }
    (views, errors)
}

/// Listing réseaux sur tous les hôtes.
pub async fn list_all_networks(
    clients: &HashMap<String, Docker>,
) -> (Vec<NetworkView>, Vec<HostError>) {
    let (per_host, errors) = query_all(clients, |_, docker: Docker| async move {
        let options = ListNetworksOptions::<String>::default();
        Ok(docker.list_networks(Some(options)).await?)
    })
    .await;

    let mut views = Vec::new();
    for (host, networks) in per_host {
        views.extend(
            networks
                .into_iter()
                .map(|n| NetworkView::from_network(n, &host)),
        );
    }
    (views, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn fake_clients(n: usize) -> HashMap<String, usize> {
        (0..n).map(|i| (format!("host{i}"), i)).collect()
    }

    #[tokio::test]
    async fn test_query_all_zero_hosts() {
        let clients: HashMap<String, usize> = HashMap::new();
        let (results, errors) =
            query_all(&clients, |_, c: usize| async move { Ok(c * 2) }).await;
        assert!(results.is_empty());
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_query_all_success_plus_error_equals_host_count() {
        let clients = fake_clients(5);
        let (results, errors) = query_all(&clients, |_, c: usize| async move {
            if c % 2 == 0 {
                Ok(c * 10)
            } else {
                Err(anyhow!("host {c} unreachable"))
            }
        })
        .await;

        // Pas d'assertion sur l'ordre des erreurs : non déterministe.
        assert_eq!(results.len() + errors.len(), 5);
        assert_eq!(results.len(), 3);
        assert_eq!(results["host2"], 20);
        assert!(errors.iter().all(|e| e.error.contains("unreachable")));
    }

    #[tokio::test]
    async fn test_query_all_isolates_panicking_worker() {
        let clients = fake_clients(3);
        let (results, errors) = query_all(&clients, |_, c: usize| async move {
            if c == 1 {
                panic!("worker blew up");
            }
            Ok(c)
        })
        .await;

        assert_eq!(results.len(), 2);
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_query_all_slow_host_does_not_block_others() {
        use std::time::Duration;

        let clients = fake_clients(3);
        let started = std::time::Instant::now();
        let (results, _) = query_all(&clients, |_, c: usize| async move {
            if c == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(c)
        })
        .await;

        // Durée ~ hôte le plus lent, pas la somme des hôtes.
        assert_eq!(results.len(), 3);
        assert!(started.elapsed() < Duration::from_millis(300));
    }
}
