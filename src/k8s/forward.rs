//! Port forwarding between localhost and the cluster.
//!
//! The manager owns every tunnel of one activation. `start` binds all
//! local listeners before returning, so callers observe either a fully
//! ready bundle or a failure. Connections are tunnelled lazily: each
//! accepted socket opens its own port-forward stream to the pod.
//!
//! A tunnel that reports a lost connection to the pod does not restart
//! in place; the whole bundle shuts down and the activation loop
//! re-enters its reconnect branch through the `disconnect` channel.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Error, Result, UserError};

use super::client::{classify, ClusterClient};

/// Target of a single forward entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A port in the dev pod.
    Pod(u16),
    /// A port of a service in the same namespace, resolved to a backing
    /// pod at connect time.
    Service {
        /// Service name.
        name: String,
        /// Service port.
        port: u16,
    },
}

/// A registered forward.
#[derive(Debug, Clone)]
struct Entry {
    local: u16,
    target: Target,
    /// Required entries abort activation when their local port cannot be
    /// bound; the synchronizer tunnels are required, user forwards are
    /// not.
    required: bool,
}

/// Manages the port-forward bundle of one activation.
pub struct PortForwardManager {
    client: ClusterClient,
    namespace: String,
    entries: Vec<Entry>,
    disconnect: mpsc::Sender<()>,
    errors: mpsc::Sender<String>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PortForwardManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new(
        client: ClusterClient,
        namespace: &str,
        disconnect: mpsc::Sender<()>,
        errors: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            entries: Vec::new(),
            disconnect,
            errors,
            cancel,
            tasks: Vec::new(),
        }
    }

    /// Registers a forward to the dev pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the local port is already registered.
    pub fn add(&mut self, local: u16, remote: u16) -> Result<()> {
        register(
            &mut self.entries,
            Entry {
                local,
                target: Target::Pod(remote),
                required: false,
            },
        )
    }

    /// Registers a forward to a service.
    ///
    /// # Errors
    ///
    /// Returns an error if the local port is already registered.
    pub fn add_service(&mut self, local: u16, service: &str, port: u16) -> Result<()> {
        register(
            &mut self.entries,
            Entry {
                local,
                target: Target::Service {
                    name: service.to_string(),
                    port,
                },
                required: false,
            },
        )
    }

    /// Registers a forward whose bind failure aborts activation. The
    /// synchronizer tunnels use this, and they are registered last so
    /// user forwards bind first.
    ///
    /// # Errors
    ///
    /// Returns an error if the local port is already registered.
    pub fn add_required(&mut self, local: u16, remote: u16) -> Result<()> {
        register(
            &mut self.entries,
            Entry {
                local,
                target: Target::Pod(remote),
                required: true,
            },
        )
    }

    /// Opens every registered tunnel. Returns once all local listeners
    /// are bound; a required entry that cannot bind fails the whole
    /// call, other bind failures are reported on the errors channel and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a required local port cannot be bound.
    pub async fn start(&mut self, pod: &str) -> Result<()> {
        let binds = self.entries.iter().map(|entry| async move {
            let result = TcpListener::bind(("127.0.0.1", entry.local)).await;
            (entry.clone(), result)
        });
        let results = futures::future::join_all(binds).await;

        let mut bound = Vec::with_capacity(self.entries.len());
        for (entry, result) in results {
            match result {
                Ok(listener) => {
                    debug!("forward 127.0.0.1:{} ready", entry.local);
                    bound.push((entry, listener));
                }
                Err(e) if entry.required => {
                    return Err(Error::User(UserError::new(
                        format!("couldn't bind local port {}: {e}", entry.local),
                        "Check which process is using the port and free it, then run 'okteto up' again",
                    )));
                }
                Err(e) => {
                    let _ = self
                        .errors
                        .try_send(format!("couldn't forward local port {}: {e}", entry.local));
                }
            }
        }

        for (entry, listener) in bound {
            let client = self.client.clone();
            let namespace = self.namespace.clone();
            let pod = pod.to_string();
            let disconnect = self.disconnect.clone();
            let cancel = self.cancel.clone();

            self.tasks.push(tokio::spawn(async move {
                serve(client, namespace, pod, entry, listener, disconnect, cancel).await;
            }));
        }

        info!("port forwards started");
        Ok(())
    }

    /// Closes every tunnel. Safe to call more than once.
    pub fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        info!("stopping port forwards");
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn register(entries: &mut Vec<Entry>, entry: Entry) -> Result<()> {
    if entries.iter().any(|e| e.local == entry.local) {
        return Err(Error::User(UserError::new(
            format!("local port {} is already forwarded", entry.local),
            "Update the forwards in your okteto manifest and try again",
        )));
    }
    entries.push(entry);
    Ok(())
}

/// Accept loop of one tunnel.
async fn serve(
    client: ClusterClient,
    namespace: String,
    pod: String,
    entry: Entry,
    listener: TcpListener,
    disconnect: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    loop {
        let socket = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => socket,
                Err(e) => {
                    warn!("forward 127.0.0.1:{} accept failed: {e}", entry.local);
                    return;
                }
            },
            () = cancel.cancelled() => return,
        };

        let client = client.clone();
        let namespace = namespace.clone();
        let pod = pod.clone();
        let target = entry.target.clone();
        let disconnect = disconnect.clone();

        tokio::spawn(async move {
            if let Err(e) = tunnel(&client, &namespace, &pod, &target, socket).await {
                if matches!(e, Error::LostConnection) || e.is_not_found() {
                    info!("forward lost connection to pod");
                    let _ = disconnect.try_send(());
                } else {
                    debug!("forward connection closed: {e}");
                }
            }
        });
    }
}

/// Tunnels one accepted socket to its target port. A stream failure
/// after the tunnel is up means the pod went away and surfaces as
/// [`Error::LostConnection`].
async fn tunnel(
    client: &ClusterClient,
    namespace: &str,
    pod: &str,
    target: &Target,
    socket: TcpStream,
) -> Result<()> {
    let (pod_name, pod_port) = match target {
        Target::Pod(port) => (pod.to_string(), *port),
        Target::Service { name, port } => resolve_service(client, namespace, name, *port).await?,
    };

    let pods = client.pods(namespace);
    let mut forwarder = pods
        .portforward(&pod_name, &[pod_port])
        .await
        .map_err(|e| Error::Cluster(classify(&e, "pod", &pod_name)))?;
    let stream = forwarder
        .take_stream(pod_port)
        .ok_or_else(|| Error::internal("missing port forward stream"))?;

    relay(socket, stream).await
}

/// Copies bytes between the local socket and the pod stream. A failure
/// on the local side closes the connection quietly; a failure on the
/// pod side is a lost connection.
async fn relay(
    mut socket: TcpStream,
    mut stream: impl AsyncRead + AsyncWrite + Unpin,
) -> Result<()> {
    let mut socket_buffer = vec![0u8; 64 * 1024];
    let mut stream_buffer = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            result = socket.read(&mut socket_buffer) => {
                let read_len = match result {
                    Ok(0) | Err(_) => break,
                    Ok(read_len) => read_len,
                };
                if stream.write_all(&socket_buffer[..read_len]).await.is_err() {
                    return Err(Error::LostConnection);
                }
            },
            result = stream.read(&mut stream_buffer) => {
                let read_len = match result {
                    Ok(0) => break,
                    Ok(read_len) => read_len,
                    Err(_) => return Err(Error::LostConnection),
                };
                if socket.write_all(&stream_buffer[..read_len]).await.is_err() {
                    break;
                }
            },
        }
    }

    Ok(())
}

/// Resolves a service forward to a backing pod and its target port.
async fn resolve_service(
    client: &ClusterClient,
    namespace: &str,
    service: &str,
    port: u16,
) -> Result<(String, u16)> {
    let services = client.services(namespace);
    let svc = services
        .get(service)
        .await
        .map_err(|e| Error::Cluster(classify(&e, "service", service)))?;

    let pod_port = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| {
            ports
                .iter()
                .find(|p| u16::try_from(p.port).ok() == Some(port))
        })
        .and_then(|p| match &p.target_port {
            Some(IntOrString::Int(target)) => u16::try_from(*target).ok(),
            _ => Some(port),
        })
        .unwrap_or(port);

    let endpoints = client
        .endpoints(namespace)
        .get_opt(service)
        .await
        .map_err(|e| Error::Cluster(classify(&e, "endpoints", service)))?
        .ok_or_else(|| Error::Cluster(ClusterError::not_found("endpoints", service)))?;

    let pod_name = endpoints
        .subsets
        .iter()
        .flatten()
        .filter(|subset| {
            subset
                .ports
                .iter()
                .flatten()
                .any(|p| u16::try_from(p.port).ok() == Some(pod_port))
        })
        .flat_map(|subset| subset.addresses.iter().flatten())
        .filter_map(|address| address.target_ref.as_ref())
        .filter_map(|target| target.name.clone())
        .next()
        .ok_or_else(|| {
            Error::Cluster(ClusterError::fatal(format!(
                "service '{service}' has no ready endpoints on port {port}"
            )))
        })?;

    Ok((pod_name, pod_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_duplicate_local_port() {
        let mut entries = Vec::new();
        register(
            &mut entries,
            Entry {
                local: 8080,
                target: Target::Pod(3000),
                required: false,
            },
        )
        .expect("first registration");

        let err = register(
            &mut entries,
            Entry {
                local: 8080,
                target: Target::Pod(3001),
                required: false,
            },
        )
        .expect_err("duplicate must fail");
        assert!(matches!(err, Error::User(_)));
    }

    #[test]
    fn test_register_keeps_order() {
        let mut entries = Vec::new();
        for (local, remote) in [(8080u16, 3000u16), (9229, 9229), (62000, 22000)] {
            register(
                &mut entries,
                Entry {
                    local,
                    target: Target::Pod(remote),
                    required: remote == 22000,
                },
            )
            .expect("registration");
        }

        assert_eq!(entries.len(), 3);
        assert!(entries.last().is_some_and(|e| e.required));
        assert_eq!(entries[0].local, 8080);
    }
}
