//! Control socket protocol between the daemon and the CLI
//!
//! Newline-delimited JSON over a Unix domain socket. Each request carries an
//! id that is echoed in its response.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, StopOutcome};
use crate::component::State;
use crate::error::{Error, Result};
use crate::sickbay::ComponentStatus;

/// Request from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub id: u64,
    pub method: Method,
}

/// Response from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub id: u64,
    pub result: std::result::Result<Reply, String>,
}

/// Request methods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Status of every component
    Status,
    /// Explicit stop
    Stop { component: String },
    /// Manual restart (clears restart history)
    Restart { component: String },
    /// Daemon liveness
    Ping,
}

/// Successful replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Status(Vec<ComponentStatus>),
    Stopped {
        component: String,
        outcome: StopOutcome,
    },
    Restarted {
        component: String,
        state: State,
    },
    Pong {
        version: String,
    },
}

/// Serve the control socket until shutdown
pub async fn serve(path: &Path, bridge: Arc<Bridge>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = bind(path).await?;
    info!(socket = %path.display(), "control socket listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let bridge = Arc::clone(&bridge);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, bridge).await {
                            debug!(error = %e, "control connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "failed to accept control connection"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if let Err(e) = std::fs::remove_file(path) {
        debug!(socket = %path.display(), error = %e, "failed to remove control socket");
    }
    Ok(())
}

/// Bind, replacing a stale socket left by a daemon that died
async fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(Error::Control(format!(
                "another daemon is already listening on {}",
                path.display()
            )));
        }
        std::fs::remove_file(path)?;
    }
    Ok(UnixListener::bind(path)?)
}

async fn handle_connection(stream: UnixStream, bridge: Arc<Bridge>) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => ControlResponse {
                id: request.id,
                result: dispatch(&bridge, request.method).await,
            },
            Err(e) => ControlResponse {
                id: 0,
                result: Err(format!("malformed request: {}", e)),
            },
        };

        let mut json = serde_json::to_string(&response)?;
        json.push('\n');
        write.write_all(json.as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(bridge: &Bridge, method: Method) -> std::result::Result<Reply, String> {
    let reply = match method {
        Method::Status => Ok(Reply::Status(bridge.status())),
        Method::Stop { component } => bridge
            .stop_component(&component)
            .await
            .map(|outcome| Reply::Stopped { component, outcome }),
        Method::Restart { component } => bridge
            .manual_restart(&component)
            .await
            .map(|state| Reply::Restarted { component, state }),
        Method::Ping => Ok(Reply::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    };
    reply.map_err(|e| e.to_string())
}

/// Client side of the control socket
#[derive(Debug)]
pub struct ControlClient {
    path: PathBuf,
    next_id: u64,
}

impl ControlClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            next_id: 1,
        }
    }

    /// Send one request and wait for its response
    pub async fn call(&mut self, method: Method) -> Result<Reply> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
                Error::DaemonNotRunning(self.path.clone())
            }
            _ => Error::Io(e),
        })?;
        let (read, mut write) = stream.into_split();

        let id = self.next_id;
        self.next_id += 1;
        let mut json = serde_json::to_string(&ControlRequest { id, method })?;
        json.push('\n');
        write.write_all(json.as_bytes()).await?;

        let line = BufReader::new(read)
            .lines()
            .next_line()
            .await?
            .ok_or_else(|| Error::Control("daemon closed the connection".to_string()))?;
        let response: ControlResponse = serde_json::from_str(&line)?;
        if response.id != id {
            return Err(Error::Control(format!(
                "response id {} does not match request id {}",
                response.id, id
            )));
        }
        response.result.map_err(Error::Control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentSpec;
    use crate::logbook::Logbook;
    use crate::roster::Roster;
    use crate::test_support::ScriptedLauncher;

    async fn daemon() -> (PathBuf, watch::Sender<bool>, tokio::task::JoinHandle<Result<()>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(
            Arc::new(Roster::new()),
            Arc::new(ScriptedLauncher::new()),
            Logbook::new(dir.path()),
        );
        bridge
            .register_component(ComponentSpec::native("api-server", "api-server"))
            .unwrap();
        bridge.launch_all().await.unwrap();

        let path = dir.path().join("harbormaster.sock");
        let (tx, rx) = watch::channel(false);
        let server = {
            let path = path.clone();
            tokio::spawn(async move { serve(&path, Arc::new(bridge), rx).await })
        };
        // Wait for the listener
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        (path, tx, server, dir)
    }

    #[test]
    fn test_wire_format() {
        let request = ControlRequest {
            id: 7,
            method: Method::Stop {
                component: "api-server".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"id":7,"method":{"stop":{"component":"api-server"}}}"#
        );

        let response: ControlResponse =
            serde_json::from_str(r#"{"id":7,"result":{"Err":"Component 'x' not found"}}"#).unwrap();
        assert_eq!(response.result, Err("Component 'x' not found".to_string()));
    }

    #[tokio::test]
    async fn test_status_and_stop_over_socket() {
        let (path, shutdown, server, _dir) = daemon().await;
        let mut client = ControlClient::new(&path);

        assert!(matches!(client.call(Method::Ping).await.unwrap(), Reply::Pong { .. }));

        let Reply::Status(status) = client.call(Method::Status).await.unwrap() else {
            panic!("expected status");
        };
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, State::Starting);

        let reply = client
            .call(Method::Stop {
                component: "api-server".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Stopped {
                component: "api-server".to_string(),
                outcome: StopOutcome::Stopped
            }
        );

        let err = client
            .call(Method::Restart {
                component: "nope".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'nope' not found"));

        shutdown.send(true).unwrap();
        server.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_client_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = ControlClient::new(dir.path().join("harbormaster.sock"));
        assert!(matches!(
            client.call(Method::Ping).await,
            Err(Error::DaemonNotRunning(_))
        ));
    }
}
