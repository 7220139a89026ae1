use crate::models::HostDescriptor;
use std::env;
use tracing::warn;

/// Configuration kernel chargée depuis l'environnement (.env supporté).
/// Toute valeur invalide retombe sur le défaut avec un warning, sauf la
/// table d'hôtes dont la connexion est validée au démarrage.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub hosts: Vec<HostDescriptor>,
    pub listen_addr: String,
    pub api_key: Option<String>,
    pub cpu_alert_threshold: f64,       // pourcent
    pub memory_alert_threshold: f64,    // pourcent
    pub alert_interval_secs: u64,
    pub alert_history: usize,           // capacité du ring buffer
    pub alert_webhook_url: Option<String>,
    pub ssh_opts: Vec<String>,          // options supplémentaires pour ssh -L
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            hosts: vec![HostDescriptor {
                name: "local".into(),
                endpoint: "local".into(),
            }],
            listen_addr: "0.0.0.0:8080".into(),
            api_key: None,
            cpu_alert_threshold: 80.0,
            memory_alert_threshold: 85.0,
            alert_interval_secs: 30,
            alert_history: 100,
            alert_webhook_url: None,
            ssh_opts: Vec::new(),
        }
    }
}

impl KernelConfig {
    pub fn load() -> Self {
        let defaults = Self::default();

        let hosts = match env::var("VIGIE_HOSTS") {
            Ok(raw) => match parse_hosts(&raw) {
                Ok(hosts) => hosts,
                Err(e) => {
                    warn!("VIGIE_HOSTS invalide ({e}), fallback hôte local");
                    defaults.hosts.clone()
                }
            },
            Err(_) => defaults.hosts.clone(),
        };

        let ssh_opts = match env::var("VIGIE_SSH_OPTS") {
            Ok(raw) => shell_words::split(&raw).unwrap_or_else(|e| {
                warn!("VIGIE_SSH_OPTS invalide ({e}), ignoré");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };

        Self {
            hosts,
            listen_addr: env::var("VIGIE_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            api_key: env::var("VIGIE_API_KEY").ok().filter(|k| !k.is_empty()),
            cpu_alert_threshold: parse_or(
                "VIGIE_CPU_ALERT_THRESHOLD",
                defaults.cpu_alert_threshold,
            ),
            memory_alert_threshold: parse_or(
                "VIGIE_MEMORY_ALERT_THRESHOLD",
                defaults.memory_alert_threshold,
            ),
            alert_interval_secs: parse_or("VIGIE_ALERT_INTERVAL_SECS", defaults.alert_interval_secs),
            alert_history: parse_or("VIGIE_ALERT_HISTORY", defaults.alert_history),
            alert_webhook_url: env::var("VIGIE_ALERT_WEBHOOK_URL")
                .ok()
                .filter(|u| !u.is_empty()),
            ssh_opts,
        }
    }
}

fn parse_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{var} invalide ({raw}), valeur par défaut utilisée");
            default
        }),
        Err(_) => default,
    }
}

/// Parse "name=uri,name2=uri2" en descripteurs d'hôtes.
/// Les noms doivent être uniques, les entrées vides sont ignorées.
fn parse_hosts(raw: &str) -> Result<Vec<HostDescriptor>, String> {
    let mut hosts: Vec<HostDescriptor> = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, endpoint) = part
            .split_once('=')
            .ok_or_else(|| format!("entrée sans '=': {part}"))?;
        let name = name.trim();
        let endpoint = endpoint.trim();
        if name.is_empty() || endpoint.is_empty() {
            return Err(format!("nom ou endpoint vide: {part}"));
        }
        if hosts.iter().any(|h| h.name == name) {
            return Err(format!("nom d'hôte dupliqué: {name}"));
        }
        hosts.push(HostDescriptor {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
        });
    }
    if hosts.is_empty() {
        return Err("aucun hôte déclaré".into());
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hosts_multi() {
        let hosts =
            parse_hosts("local=unix:///var/run/docker.sock, prod=ssh://root@10.0.0.5").unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].name, "local");
        assert_eq!(hosts[1].endpoint, "ssh://root@10.0.0.5");
    }

    #[test]
    fn test_parse_hosts_rejects_duplicates() {
        assert!(parse_hosts("a=local,a=tcp://x:2375").is_err());
    }

    #[test]
    fn test_parse_hosts_rejects_missing_separator() {
        assert!(parse_hosts("justaname").is_err());
        assert!(parse_hosts("").is_err());
    }

    #[test]
    fn test_default_config() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.hosts.len(), 1);
        assert_eq!(cfg.cpu_alert_threshold, 80.0);
        assert_eq!(cfg.alert_history, 100);
    }
}
