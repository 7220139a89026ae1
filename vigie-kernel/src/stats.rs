//! Stats telemetry engine.
//!
//! Decodes the runtime's periodic resource snapshots and derives the metrics
//! the dashboard actually displays:
//! - CPU percent from usage deltas scaled by online CPU count
//! - memory usage/limit/percent (zero-limit guarded, never Inf)
//! - network rx/tx aggregated across every interface
//! - block I/O aggregated by read/write op
//!
//! One-shot reads, a backpressured live stream, and a per-host sweep that
//! tolerates containers exiting mid-flight.

use crate::models::ContainerStats;
use anyhow::{Context, Result};
use bollard::container::{ListContainersOptions, Stats, StatsOptions};
use bollard::Docker;
use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Dérive un snapshot typé depuis les stats brutes du runtime.
/// Les formules CPU/mémoire sont invariantes : voir tests.
pub fn compute_stats(raw: &Stats, host: &str, container_id: &str) -> ContainerStats {
    let cpu_percent = compute_cpu_percent(raw);

    let memory_usage = raw.memory_stats.usage.unwrap_or(0);
    let memory_limit = raw.memory_stats.limit.unwrap_or(0);
    let memory_percent = if memory_limit > 0 {
        (memory_usage as f64 / memory_limit as f64) * 100.0
    } else {
        0.0
    };

    // Somme sur TOUTES les interfaces, pas seulement la première.
    let (network_rx, network_tx) = raw
        .networks
        .as_ref()
        .map(|nets| {
            nets.values()
                .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
        })
        .unwrap_or((0, 0));

    let (block_read, block_write) = raw
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0u64, 0u64), |(read, write), entry| {
                if entry.op.eq_ignore_ascii_case("read") {
                    (read + entry.value, write)
                } else if entry.op.eq_ignore_ascii_case("write") {
                    (read, write + entry.value)
                } else {
                    (read, write)
                }
            })
        })
        .unwrap_or((0, 0));

    ContainerStats {
        container_id: container_id.to_string(),
        host: host.to_string(),
        cpu_percent,
        memory_usage,
        memory_limit,
        memory_percent,
        network_rx,
        network_tx,
        block_read,
        block_write,
        pids: raw.pids_stats.current.unwrap_or(0),
        timestamp: OffsetDateTime::now_utc().unix_timestamp(),
    }
}

/// cpu% = (cpuDelta / systemDelta) * onlineCPUs * 100, uniquement quand les
/// deux deltas sont > 0, sinon 0 (jamais de division par zéro).
/// onlineCPUs retombe sur len(percpu_usage) quand le runtime rapporte 0.
fn compute_cpu_percent(raw: &Stats) -> f64 {
    let cpu_delta = raw
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(raw.precpu_stats.cpu_usage.total_usage);
    let system_delta = raw
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(raw.precpu_stats.system_cpu_usage.unwrap_or(0));

    let online_cpus = match raw.cpu_stats.online_cpus {
        Some(n) if n > 0 => n,
        _ => raw
            .cpu_stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map(|v| v.len() as u64)
            .unwrap_or(0),
    };

    if system_delta > 0 && cpu_delta > 0 {
        (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0
    } else {
        0.0
    }
}

/// Un snapshot unique pour un conteneur.
pub async fn container_stats(docker: &Docker, host: &str, container: &str) -> Result<ContainerStats> {
    let options = StatsOptions {
        stream: false,
        one_shot: false,
    };
    let raw = docker
        .stats(container, Some(options))
        .next()
        .await
        .context("stats stream ended without a snapshot")??;
    Ok(compute_stats(&raw, host, container))
}

/// Boucle de décodage continue : publie chaque snapshot dérivé sur un canal
/// borné jusqu'à annulation côté consommateur ou fin de source.
pub fn stream_stats(docker: Docker, host: &str, container: &str) -> mpsc::Receiver<ContainerStats> {
    let (tx, rx) = mpsc::channel(8);
    let host = host.to_string();
    let container = container.to_string();

    tokio::spawn(async move {
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };
        let mut stream = docker.stats(&container, Some(options));

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    debug!(container = %container, "stats stream: consumer gone");
                    return;
                }
                item = stream.next() => match item {
                    Some(Ok(raw)) => {
                        let snapshot = compute_stats(&raw, &host, &container);
                        if tx.send(snapshot).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(container = %container, error = %e, "stats stream: transport error");
                        return;
                    }
                    None => return,
                },
            }
        }
    });

    rx
}

/// Stats de tous les conteneurs en cours d'exécution sur un hôte.
/// Un conteneur qui disparaît entre listing et lecture est simplement sauté :
/// résultats partiels attendus, jamais d'échec global.
pub async fn all_container_stats(docker: &Docker, host: &str) -> Result<Vec<ContainerStats>> {
    let options = ListContainersOptions::<String> {
        all: false,
        ..Default::default()
    };
    let containers = docker
        .list_containers(Some(options))
        .await
        .context("listing running containers")?;

    let mut snapshots = Vec::with_capacity(containers.len());
    for summary in containers {
        let Some(id) = summary.id else { continue };
        match container_stats(docker, host, &id).await {
            Ok(stats) => snapshots.push(stats),
            Err(e) => {
                debug!(host = %host, container = %id, error = %e, "stats skipped");
            }
        }
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Stats brutes minimales mais complètes, au format du runtime.
    fn raw_stats(value: serde_json::Value) -> Stats {
        let mut base = json!({
            "read": "2024-03-01T10:15:30Z",
            "preread": "2024-03-01T10:15:29Z",
            "num_procs": 0,
            "pids_stats": {},
            "memory_stats": {},
            "blkio_stats": {},
            "storage_stats": {},
            "cpu_stats": {
                "cpu_usage": {
                    "total_usage": 0,
                    "usage_in_usermode": 0,
                    "usage_in_kernelmode": 0
                },
                "throttling_data": {"periods": 0, "throttled_periods": 0, "throttled_time": 0}
            },
            "precpu_stats": {
                "cpu_usage": {
                    "total_usage": 0,
                    "usage_in_usermode": 0,
                    "usage_in_kernelmode": 0
                },
                "throttling_data": {"periods": 0, "throttled_periods": 0, "throttled_time": 0}
            },
            "name": "/web",
            "id": "deadbeef"
        });
        merge(&mut base, value);
        serde_json::from_value(base).expect("valid raw stats fixture")
    }

    fn merge(base: &mut serde_json::Value, overlay: serde_json::Value) {
        match (base, overlay) {
            (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
                for (k, v) in overlay {
                    merge(base.entry(k).or_insert(serde_json::Value::Null), v);
                }
            }
            (base, overlay) => *base = overlay,
        }
    }

    #[test]
    fn test_cpu_percent_formula() {
        // cpuDelta=200, systemDelta=1000, 4 CPUs -> (200/1000)*4*100 = 80%
        let raw = raw_stats(json!({
            "cpu_stats": {
                "cpu_usage": {"total_usage": 1200},
                "system_cpu_usage": 11000,
                "online_cpus": 4
            },
            "precpu_stats": {
                "cpu_usage": {"total_usage": 1000},
                "system_cpu_usage": 10000
            }
        }));
        let stats = compute_stats(&raw, "local", "deadbeef");
        assert!((stats.cpu_percent - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cpu_percent_zero_system_delta() {
        let raw = raw_stats(json!({
            "cpu_stats": {
                "cpu_usage": {"total_usage": 1200},
                "system_cpu_usage": 10000,
                "online_cpus": 4
            },
            "precpu_stats": {
                "cpu_usage": {"total_usage": 1000},
                "system_cpu_usage": 10000
            }
        }));
        assert_eq!(compute_stats(&raw, "local", "x").cpu_percent, 0.0);
    }

    #[test]
    fn test_cpu_percent_online_cpus_falls_back_to_percpu_len() {
        let raw = raw_stats(json!({
            "cpu_stats": {
                "cpu_usage": {"total_usage": 1200, "percpu_usage": [1, 2]},
                "system_cpu_usage": 11000,
                "online_cpus": 0
            },
            "precpu_stats": {
                "cpu_usage": {"total_usage": 1000},
                "system_cpu_usage": 10000
            }
        }));
        // (200/1000) * 2 * 100 = 40%
        assert!((compute_stats(&raw, "local", "x").cpu_percent - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_memory_percent_zero_limit_is_zero_not_inf() {
        let raw = raw_stats(json!({
            "memory_stats": {"usage": 50, "limit": 0}
        }));
        let stats = compute_stats(&raw, "local", "x");
        assert_eq!(stats.memory_percent, 0.0);
        assert_eq!(stats.memory_usage, 50);
    }

    #[test]
    fn test_memory_percent() {
        let raw = raw_stats(json!({
            "memory_stats": {"usage": 256, "limit": 1024}
        }));
        assert!((compute_stats(&raw, "local", "x").memory_percent - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_network_summed_across_interfaces() {
        let raw = raw_stats(json!({
            "networks": {
                "eth0": {"rx_bytes": 100, "tx_bytes": 10, "rx_packets": 0, "tx_packets": 0,
                         "rx_errors": 0, "tx_errors": 0, "rx_dropped": 0, "tx_dropped": 0},
                "eth1": {"rx_bytes": 200, "tx_bytes": 20, "rx_packets": 0, "tx_packets": 0,
                         "rx_errors": 0, "tx_errors": 0, "rx_dropped": 0, "tx_dropped": 0}
            }
        }));
        let stats = compute_stats(&raw, "local", "x");
        assert_eq!(stats.network_rx, 300);
        assert_eq!(stats.network_tx, 30);
    }

    #[test]
    fn test_block_io_summed_by_op_case_insensitive() {
        let raw = raw_stats(json!({
            "blkio_stats": {
                "io_service_bytes_recursive": [
                    {"major": 8, "minor": 0, "op": "Read", "value": 100},
                    {"major": 8, "minor": 0, "op": "write", "value": 40},
                    {"major": 8, "minor": 0, "op": "READ", "value": 23},
                    {"major": 8, "minor": 0, "op": "sync", "value": 999}
                ]
            }
        }));
        let stats = compute_stats(&raw, "local", "x");
        assert_eq!(stats.block_read, 123);
        assert_eq!(stats.block_write, 40);
        assert_eq!(stats.pids, 0);
    }

    #[test]
    fn test_pids_decoded() {
        let raw = raw_stats(json!({"pids_stats": {"current": 7}}));
        assert_eq!(compute_stats(&raw, "local", "x").pids, 7);
    }
}
