/**
 * RUNTIME ENDPOINT CONNECTOR - Une connexion typée par hôte configuré
 *
 * RÔLE : Établir et posséder les clients runtime, quel que soit le
 * transport : socket local, TCP direct, ou tunnel SSH.
 *
 * FONCTIONNEMENT :
 * - Chaque URI d'hôte est parsée en stratégie de connexion
 * - SSH : un forward de socket unix (ssh -L) est spawné et possédé par le
 *   handle ; le client passe par le socket forwardé, jamais en direct
 * - Chaque connexion est vérifiée par un ping avant admission
 *
 * ÉCHEC : toute erreur d'établissement est fatale au démarrage (un kernel
 * avec une table d'hôtes partielle est pire qu'un échec franc). Les échecs
 * par appel ultérieurs sont eux isolés par le fan-out.
 */

use crate::models::HostDescriptor;
use anyhow::{bail, Context, Result};
use bollard::{Docker, API_DEFAULT_VERSION};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info};
use uuid::Uuid;

const CLIENT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_REMOTE_SOCKET: &str = "/var/run/docker.sock";
const TUNNEL_WAIT_ATTEMPTS: u32 = 50; // x 100ms

/// Stratégie de connexion décodée depuis l'URI d'un hôte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Transport local par défaut de la plateforme.
    LocalDefault,
    /// Socket unix explicite.
    Unix(String),
    /// Dial TCP direct (TLS/auth délégués à l'environnement).
    Http(String),
    /// Tunnel SSH vers le socket distant.
    Ssh {
        target: String,             // user@host ou host
        port: Option<u16>,
        remote_socket: String,
    },
}

impl Endpoint {
    /// Parse une URI d'endpoint. Grammaire :
    /// `local`, `unix:///path`, `/path`, `tcp://h:p`, `http://h:p`,
    /// `ssh://[user@]host[:port][/remote/socket]`
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() || uri == "local" {
            return Ok(Endpoint::LocalDefault);
        }
        if let Some(path) = uri.strip_prefix("unix://") {
            if path.is_empty() {
                bail!("socket unix vide: {uri}");
            }
            return Ok(Endpoint::Unix(path.to_string()));
        }
        if uri.starts_with('/') {
            return Ok(Endpoint::Unix(uri.to_string()));
        }
        if let Some(addr) = uri.strip_prefix("tcp://") {
            return Ok(Endpoint::Http(format!("http://{addr}")));
        }
        if uri.starts_with("http://") {
            return Ok(Endpoint::Http(uri.to_string()));
        }
        if let Some(rest) = uri.strip_prefix("ssh://") {
            return Self::parse_ssh(rest);
        }
        bail!("schéma d'endpoint non supporté: {uri}")
    }

    fn parse_ssh(rest: &str) -> Result<Self> {
        if rest.is_empty() {
            bail!("cible ssh vide");
        }
        let (hostpart, remote_socket) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, DEFAULT_REMOTE_SOCKET.to_string()),
        };

        // Le port éventuel suit le host, après l'éventuel user@
        let authority_host = hostpart.rsplit('@').next().unwrap_or(hostpart);
        let (target, port) = match authority_host.split_once(':') {
            Some((_, port_str)) => {
                let port: u16 = port_str
                    .parse()
                    .with_context(|| format!("port ssh invalide: {port_str}"))?;
                let target = hostpart
                    .strip_suffix(&format!(":{port_str}"))
                    .unwrap_or(hostpart);
                (target.to_string(), Some(port))
            }
            None => (hostpart.to_string(), None),
        };

        if target.is_empty() {
            bail!("cible ssh vide");
        }
        Ok(Endpoint::Ssh {
            target,
            port,
            remote_socket,
        })
    }
}

/// Processus ssh -L possédé par un handle d'hôte. Tué au drop ; le socket
/// local forwardé est nettoyé en best-effort.
struct SshTunnel {
    _child: Child,
    local_socket: PathBuf,
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local_socket);
    }
}

/// Un hôte connecté : client vérifié + ressources de transport possédées.
pub struct HostHandle {
    pub descriptor: HostDescriptor,
    docker: Docker,
    _tunnel: Option<SshTunnel>,
}

/// Table des hôtes connectés. En lecture seule après démarrage : aucun
/// verrou nécessaire, les clients se clonent à coût constant.
pub struct HostManager {
    hosts: HashMap<String, HostHandle>,
}

impl HostManager {
    /// Connecte tous les hôtes déclarés, ou échoue au premier hôte
    /// injoignable (avec le nom de l'hôte dans le contexte d'erreur).
    pub async fn connect(descriptors: &[HostDescriptor], ssh_opts: &[String]) -> Result<Self> {
        let mut hosts = HashMap::new();
        for descriptor in descriptors {
            let handle = connect_host(descriptor, ssh_opts)
                .await
                .with_context(|| format!("connexion à l'hôte '{}'", descriptor.name))?;
            info!(host = %descriptor.name, endpoint = %descriptor.endpoint, "host connected");
            hosts.insert(descriptor.name.clone(), handle);
        }
        Ok(Self { hosts })
    }

    pub fn client(&self, name: &str) -> Option<Docker> {
        self.hosts.get(name).map(|h| h.docker.clone())
    }

    /// Map name → client pour le fan-out.
    pub fn clients(&self) -> HashMap<String, Docker> {
        self.hosts
            .iter()
            .map(|(name, handle)| (name.clone(), handle.docker.clone()))
            .collect()
    }

    pub fn descriptors(&self) -> Vec<HostDescriptor> {
        self.hosts.values().map(|h| h.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }
}

async fn connect_host(descriptor: &HostDescriptor, ssh_opts: &[String]) -> Result<HostHandle> {
    let endpoint = Endpoint::parse(&descriptor.endpoint)?;

    let (docker, tunnel) = match endpoint {
        Endpoint::LocalDefault => (Docker::connect_with_local_defaults()?, None),
        Endpoint::Unix(path) => (
            Docker::connect_with_unix(&path, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)?,
            None,
        ),
        Endpoint::Http(addr) => (
            Docker::connect_with_http(&addr, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)?,
            None,
        ),
        Endpoint::Ssh {
            target,
            port,
            remote_socket,
        } => {
            let tunnel = open_ssh_tunnel(&target, port, &remote_socket, ssh_opts).await?;
            let docker = Docker::connect_with_unix(
                &tunnel.local_socket.to_string_lossy(),
                CLIENT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            )?;
            (docker, Some(tunnel))
        }
    };

    docker.ping().await.context("ping du runtime")?;

    Ok(HostHandle {
        descriptor: descriptor.clone(),
        docker,
        _tunnel: tunnel,
    })
}

/// Forward du socket runtime distant sur un socket unix local via ssh -L.
/// Le client utilisera exclusivement ce socket forwardé.
async fn open_ssh_tunnel(
    target: &str,
    port: Option<u16>,
    remote_socket: &str,
    extra_opts: &[String],
) -> Result<SshTunnel> {
    let local_socket = std::env::temp_dir().join(format!("vigie-ssh-{}.sock", Uuid::new_v4()));
    let _ = std::fs::remove_file(&local_socket);

    let mut cmd = Command::new("ssh");
    cmd.arg("-nNT")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg("ExitOnForwardFailure=yes");
    if let Some(port) = port {
        cmd.arg("-p").arg(port.to_string());
    }
    for opt in extra_opts {
        cmd.arg(opt);
    }
    cmd.arg("-L")
        .arg(format!(
            "{}:{}",
            local_socket.to_string_lossy(),
            remote_socket
        ))
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("spawn ssh")?;
    debug!(target = %target, socket = %local_socket.display(), "ssh tunnel spawned");

    // Attente bornée de l'apparition du socket forwardé.
    for _ in 0..TUNNEL_WAIT_ATTEMPTS {
        if local_socket.exists() {
            return Ok(SshTunnel {
                _child: child,
                local_socket,
            });
        }
        if let Some(status) = child.try_wait().context("état du tunnel ssh")? {
            bail!("tunnel ssh terminé prématurément ({status})");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!("socket forwardé jamais apparu pour {target}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local() {
        assert_eq!(Endpoint::parse("local").unwrap(), Endpoint::LocalDefault);
        assert_eq!(Endpoint::parse("").unwrap(), Endpoint::LocalDefault);
    }

    #[test]
    fn test_parse_unix() {
        assert_eq!(
            Endpoint::parse("unix:///var/run/docker.sock").unwrap(),
            Endpoint::Unix("/var/run/docker.sock".into())
        );
        assert_eq!(
            Endpoint::parse("/run/user/1000/docker.sock").unwrap(),
            Endpoint::Unix("/run/user/1000/docker.sock".into())
        );
    }

    #[test]
    fn test_parse_tcp_normalizes_to_http() {
        assert_eq!(
            Endpoint::parse("tcp://10.0.0.2:2375").unwrap(),
            Endpoint::Http("http://10.0.0.2:2375".into())
        );
        assert_eq!(
            Endpoint::parse("http://10.0.0.2:2375").unwrap(),
            Endpoint::Http("http://10.0.0.2:2375".into())
        );
    }

    #[test]
    fn test_parse_ssh_full() {
        assert_eq!(
            Endpoint::parse("ssh://root@prod.example.com:2222/run/docker.sock").unwrap(),
            Endpoint::Ssh {
                target: "root@prod.example.com".into(),
                port: Some(2222),
                remote_socket: "/run/docker.sock".into(),
            }
        );
    }

    #[test]
    fn test_parse_ssh_defaults() {
        assert_eq!(
            Endpoint::parse("ssh://prod.example.com").unwrap(),
            Endpoint::Ssh {
                target: "prod.example.com".into(),
                port: None,
                remote_socket: DEFAULT_REMOTE_SOCKET.into(),
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(Endpoint::parse("ftp://nope").is_err());
        assert!(Endpoint::parse("ssh://").is_err());
    }
}
