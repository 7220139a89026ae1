//! Interactive exec bridge.
//!
//! Opens a shell inside a container (full shell preferred, minimal shell as
//! fallback, pseudo-terminal allocated) and relays bytes both ways between
//! the exec stream and a remote duplex transport. A small control protocol
//! rides on text frames: `{"type":"resize","cols":..,"rows":..}` is applied
//! out-of-band and never forwarded as input.
//!
//! Teardown invariant: when either relay direction ends, the other one is
//! aborted so no session ever leaks a task.

use anyhow::{bail, Result};
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecResults};
use bollard::Docker;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Préfère un shell complet, retombe sur le shell minimal.
const SHELL_BOOTSTRAP: &str = "test -x /bin/bash && exec /bin/bash || exec /bin/sh";

/// Une frame reçue du transport distant, déjà décodée par la couche
/// boundary (WebSocket ou équivalent).
#[derive(Debug)]
pub enum RemoteFrame {
    Binary(Vec<u8>),
    Text(String),
    Closed,
}

#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
    cols: u16,
    rows: u16,
}

/// Décode un message de contrôle resize ; `None` pour tout autre texte
/// (qui reste du flux d'entrée ordinaire).
pub fn parse_resize(text: &str) -> Option<(u16, u16)> {
    let msg: ControlMessage = serde_json::from_str(text).ok()?;
    if msg.kind == "resize" {
        Some((msg.cols, msg.rows))
    } else {
        None
    }
}

/// Session exec attachée : identifiant + flux duplex. Jamais réutilisée,
/// détruite quand un des deux côtés ferme.
pub struct TerminalSession {
    pub exec_id: String,
    pub host: String,
    pub container_id: String,
    docker: Docker,
    output: Pin<Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>,
    input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl TerminalSession {
    /// Crée l'exec (TTY + stdin/out/err attachés) et s'y attache.
    pub async fn open(docker: Docker, host: &str, container: &str) -> Result<Self> {
        let options = CreateExecOptions::<String> {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            env: Some(vec!["TERM=xterm".into()]),
            cmd: Some(vec!["/bin/sh".into(), "-c".into(), SHELL_BOOTSTRAP.into()]),
            ..Default::default()
        };
        let exec = docker.create_exec(container, options).await?;

        match docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, input } => {
                info!(host = %host, container = %container, exec = %exec.id, "terminal session opened");
                Ok(Self {
                    exec_id: exec.id,
                    host: host.to_string(),
                    container_id: container.to_string(),
                    docker,
                    output,
                    input,
                })
            }
            StartExecResults::Detached => bail!("exec démarré détaché, session impossible"),
        }
    }

    /// Redimensionne le pseudo-terminal de la session (appel hors-bande).
    pub async fn resize(docker: &Docker, exec_id: &str, cols: u16, rows: u16) -> Result<()> {
        docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await?;
        Ok(())
    }

    /// Relais bidirectionnel jusqu'à fermeture d'un des deux côtés.
    /// La fin d'une direction avorte l'autre : aucune tâche ne survit à la
    /// session.
    pub async fn bridge<S, R>(self, to_remote: S, from_remote: R)
    where
        S: Sink<Bytes> + Unpin + Send + 'static,
        R: Stream<Item = RemoteFrame> + Unpin + Send + 'static,
    {
        let Self {
            exec_id,
            host,
            container_id,
            docker,
            output,
            input,
        } = self;

        let mut relays = JoinSet::new();
        relays.spawn(relay_output(output, to_remote));

        let resize_docker = docker.clone();
        let resize_exec = exec_id.clone();
        relays.spawn(relay_remote(from_remote, input, move |cols, rows| {
            let docker = resize_docker.clone();
            let exec_id = resize_exec.clone();
            async move { Self::resize(&docker, &exec_id, cols, rows).await }
        }));

        // première direction terminée → on avorte l'autre
        relays.join_next().await;
        relays.shutdown().await;
        info!(host = %host, container = %container_id, exec = %exec_id, "terminal session closed");
    }
}

/// conteneur → remote : chaque chunk part en frame binaire.
/// Erreur de lecture ou EOF = fin de session.
async fn relay_output<O, S>(mut output: O, mut to_remote: S)
where
    O: Stream<Item = Result<LogOutput, bollard::errors::Error>> + Unpin,
    S: Sink<Bytes> + Unpin,
{
    while let Some(item) = output.next().await {
        match item {
            Ok(chunk) => {
                if to_remote.send(chunk.into_bytes()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "terminal output relay ended");
                break;
            }
        }
    }
}

/// remote → conteneur : les frames texte resize passent par l'appel dédié
/// et ne sont PAS forwardées ; tout le reste part en entrée brute.
async fn relay_remote<R, W, F, Fut>(mut from_remote: R, mut input: W, mut resize: F)
where
    R: Stream<Item = RemoteFrame> + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u16, u16) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    while let Some(frame) = from_remote.next().await {
        match frame {
            RemoteFrame::Text(text) => {
                if let Some((cols, rows)) = parse_resize(&text) {
                    if let Err(e) = resize(cols, rows).await {
                        debug!(error = %e, "terminal resize failed");
                    }
                    continue;
                }
                if input.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
                let _ = input.flush().await;
            }
            RemoteFrame::Binary(data) => {
                if input.write_all(&data).await.is_err() {
                    break;
                }
                let _ = input.flush().await;
            }
            RemoteFrame::Closed => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_resize() {
        assert_eq!(
            parse_resize(r#"{"type":"resize","cols":120,"rows":40}"#),
            Some((120, 40))
        );
        assert_eq!(parse_resize(r#"{"type":"other","cols":1,"rows":1}"#), None);
        assert_eq!(parse_resize("ls -la\n"), None);
        assert_eq!(parse_resize("{bad json"), None);
    }

    #[tokio::test]
    async fn test_relay_remote_applies_resize_without_forwarding() {
        let frames = futures::stream::iter(vec![
            RemoteFrame::Text(r#"{"type":"resize","cols":80,"rows":24}"#.into()),
            RemoteFrame::Text("echo hi\n".into()),
            RemoteFrame::Binary(vec![0x03]), // ctrl-c
            RemoteFrame::Closed,
        ]);

        let (writer, mut reader) = tokio::io::duplex(1024);
        let resizes = Arc::new(Mutex::new(Vec::new()));
        let recorded = resizes.clone();

        relay_remote(frames, writer, move |cols, rows| {
            recorded.lock().unwrap().push((cols, rows));
            async { Ok(()) }
        })
        .await;

        let mut written = Vec::new();
        reader.read_to_end(&mut written).await.unwrap();

        assert_eq!(resizes.lock().unwrap().as_slice(), &[(80, 24)]);
        // le message de contrôle n'apparaît pas dans l'entrée du conteneur
        assert_eq!(written, b"echo hi\n\x03");
    }

    #[tokio::test]
    async fn test_relay_output_forwards_binary_until_eof() {
        let chunks: Vec<Result<LogOutput, bollard::errors::Error>> = vec![
            Ok(LogOutput::Console {
                message: Bytes::from_static(b"$ "),
            }),
            Ok(LogOutput::Console {
                message: Bytes::from_static(b"hello\r\n"),
            }),
        ];
        let output = futures::stream::iter(chunks);
        let (tx, rx) = futures::channel::mpsc::unbounded::<Bytes>();

        relay_output(output, tx).await;

        let received: Vec<Bytes> = rx.collect().await;
        assert_eq!(received.len(), 2);
        assert_eq!(&received[1][..], b"hello\r\n");
    }

    #[tokio::test]
    async fn test_relay_remote_stops_on_closed_frame() {
        let frames = futures::stream::iter(vec![RemoteFrame::Closed, RemoteFrame::Binary(vec![1])]);
        let (writer, mut reader) = tokio::io::duplex(64);

        relay_remote(frames, writer, |_, _| async { Ok(()) }).await;

        let mut written = Vec::new();
        reader.read_to_end(&mut written).await.unwrap();
        assert!(written.is_empty());
    }
}
