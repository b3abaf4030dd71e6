//! Dev pod discovery and readiness gating.
//!
//! Once the overlay is deployed, the dev pod goes through volume attach,
//! image pull and container start before every container reports ready.
//! [`wait_until_ready`] polls that progression with a capped exponential
//! backoff and reports human-readable progress on a channel.

use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ClusterError, Error, Result};
use crate::model::Dev;

use super::client::{classify, with_retries, ClusterClient};

/// Progress message for the volume attach phase.
pub const ATTACHING_MESSAGE: &str = "Attaching persistent volume";

/// Initial polling delay.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Polling backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// How long to wait for the dev pod before giving up.
const READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Finds the current dev pod of a deployment.
///
/// The newest non-terminating pod matching the deployment selector wins;
/// a rollout may briefly leave the previous pod behind.
///
/// # Errors
///
/// Returns a not-found error if no pod matches the selector.
pub async fn get_dev_pod(client: &ClusterClient, dev: &Dev, d: &Deployment) -> Result<Pod> {
    let selector = deployment_selector(d)
        .ok_or_else(|| Error::Cluster(ClusterError::fatal("deployment has no selector")))?;

    let api = client.pods(&dev.namespace);
    let selector = &selector;
    let pods = with_retries("list pods", || {
        let api = api.clone();
        async move {
            api.list(&ListParams::default().labels(selector))
                .await
                .map_err(|e| Error::Cluster(classify(&e, "pod", &dev.name)))
        }
    })
    .await?;

    let mut candidates: Vec<Pod> = pods
        .items
        .into_iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .collect();
    candidates.sort_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0));

    candidates
        .pop()
        .ok_or_else(|| Error::Cluster(ClusterError::not_found("pod", &dev.name)))
}

/// Returns true if the pod still exists and is not terminating.
pub async fn exists(client: &ClusterClient, namespace: &str, name: &str) -> bool {
    match client.pods(namespace).get_opt(name).await {
        Ok(Some(pod)) => pod.metadata.deletion_timestamp.is_none(),
        _ => false,
    }
}

/// Waits until every container of the dev pod reports ready, streaming
/// progress messages to `reporter`. The pod is re-discovered on every
/// poll, so a pod replaced mid-rollout is followed transparently.
///
/// A single pod restart (or replacement) observed during the wait
/// resets the timer; a second one is classified as transient. A pod
/// that reaches the `Failed` or `Succeeded` phase is fatal.
///
/// # Errors
///
/// Returns an error on pod failure, on a second restart, on timeout or
/// on cancellation.
pub async fn wait_until_ready(
    client: &ClusterClient,
    dev: &Dev,
    d: &Deployment,
    reporter: mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> Result<Pod> {
    let mut backoff = INITIAL_BACKOFF;
    let mut start = Instant::now();
    let mut tracked: Option<(String, i32)> = None;
    let mut restart_seen = false;
    let mut last_message = String::new();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::internal("cancelled while waiting for the dev pod"));
        }
        if start.elapsed() > READY_TIMEOUT {
            return Err(Error::Cluster(ClusterError::fatal(format!(
                "timed out waiting for the dev pod of '{}' to be ready",
                dev.name
            ))));
        }

        let pod = match get_dev_pod(client, dev, d).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                let _ = reporter.send(String::from(ATTACHING_MESSAGE)).await;
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            Err(e) => return Err(e),
        };
        let pod_name = pod.metadata.name.clone().unwrap_or_default();

        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Failed" | "Succeeded") => {
                return Err(Error::Cluster(ClusterError::fatal(format!(
                    "pod '{pod_name}' is no longer running"
                ))));
            }
            _ => {}
        }

        let restarts = restart_count(&pod);
        let restarted = match &tracked {
            Some((name, baseline)) => *name != pod_name || restarts > *baseline,
            None => false,
        };
        tracked = Some((pod_name.clone(), restarts));

        if restarted {
            if restart_seen {
                return Err(Error::Cluster(ClusterError::transient(format!(
                    "pod '{pod_name}' restarted twice while starting"
                ))));
            }
            info!("pod {pod_name} restarted once, resetting the wait");
            restart_seen = true;
            start = Instant::now();
            last_message.clear();
        }

        if is_ready(&pod) {
            debug!("pod {pod_name} is ready");
            return Ok(pod);
        }

        let message = progress_message(&pod, &dev.image);
        if message != last_message {
            let _ = reporter.send(message.clone()).await;
            last_message = message;
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Builds the label selector string of a deployment.
fn deployment_selector(d: &Deployment) -> Option<String> {
    let labels = d.spec.as_ref()?.selector.match_labels.as_ref()?;
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Returns true when every container of the pod reports ready.
fn is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    let Some(statuses) = status.container_statuses.as_ref() else {
        return false;
    };
    let expected = pod.spec.as_ref().map_or(0, |s| s.containers.len());
    statuses.len() == expected && statuses.iter().all(|c| c.ready)
}

/// Sums the restart counts across all containers.
fn restart_count(pod: &Pod) -> i32 {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map_or(0, |statuses| statuses.iter().map(|c| c.restart_count).sum())
}

/// Derives the progress message from the pod status.
fn progress_message(pod: &Pod, image: &str) -> String {
    let status = pod.status.as_ref();

    let init_running = status
        .and_then(|s| s.init_container_statuses.as_ref())
        .is_some_and(|statuses| statuses.iter().any(|c| !c.ready));
    if init_running || status.and_then(|s| s.container_statuses.as_ref()).is_none() {
        return String::from(ATTACHING_MESSAGE);
    }

    let waiting_reason = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses
                .iter()
                .filter_map(|c| c.state.as_ref())
                .filter_map(|s| s.waiting.as_ref())
                .filter_map(|w| w.reason.as_deref())
                .next()
        });

    match waiting_reason {
        Some(reason) if reason.contains("Pull") => format!("Pulling {image}"),
        _ => String::from("Starting container"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodSpec, PodStatus,
    };

    fn pod_with_statuses(statuses: Vec<ContainerStatus>, containers: usize) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: (0..containers)
                    .map(|i| k8s_openapi::api::core::v1::Container {
                        name: format!("c{i}"),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                container_statuses: Some(statuses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn status(ready: bool, restarts: i32, waiting_reason: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            ready,
            restart_count: restarts,
            state: waiting_reason.map(|reason| ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_ready_requires_all_containers() {
        let pod = pod_with_statuses(vec![status(true, 0, None)], 2);
        assert!(!is_ready(&pod));

        let pod = pod_with_statuses(vec![status(true, 0, None), status(true, 0, None)], 2);
        assert!(is_ready(&pod));

        let pod = pod_with_statuses(vec![status(true, 0, None), status(false, 0, None)], 2);
        assert!(!is_ready(&pod));
    }

    #[test]
    fn test_restart_count_sums_containers() {
        let pod = pod_with_statuses(vec![status(false, 1, None), status(false, 2, None)], 2);
        assert_eq!(restart_count(&pod), 3);
    }

    #[test]
    fn test_progress_messages() {
        let no_statuses = Pod {
            status: Some(PodStatus::default()),
            ..Default::default()
        };
        assert_eq!(progress_message(&no_statuses, "node:16"), ATTACHING_MESSAGE);

        let pulling = pod_with_statuses(vec![status(false, 0, Some("ImagePullBackOff"))], 1);
        assert_eq!(progress_message(&pulling, "node:16"), "Pulling node:16");

        let creating = pod_with_statuses(vec![status(false, 0, Some("ContainerCreating"))], 1);
        assert_eq!(progress_message(&creating, "node:16"), "Starting container");
    }
}
