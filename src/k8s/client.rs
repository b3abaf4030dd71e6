//! Cluster client construction and error classification.
//!
//! All cluster access goes through [`ClusterClient`]. Kubernetes errors
//! are classified here, once, into the [`ClusterError`] taxonomy; the
//! rest of the crate matches on variants instead of error strings.

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Endpoints, PersistentVolumeClaim, Pod, Secret, Service};
use kube::{Api, Client, Config};
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ClusterError, Error, Result};

/// Maximum number of attempts for transient cluster failures.
const MAX_RETRIES: u32 = 5;

/// Base delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 500;

/// Maximum random jitter added to each retry delay in milliseconds.
const RETRY_JITTER_MS: u64 = 250;

/// Typed handle to the cluster selected by the local kubeconfig.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    namespace: String,
}

impl ClusterClient {
    /// Builds a client from the local credentials, honouring
    /// `KUBECONFIG`. The default namespace comes from `OKTETO_NAMESPACE`
    /// or, failing that, the kubeconfig context.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable cluster configuration is found.
    pub async fn local() -> Result<Self> {
        let config = Config::infer().await.map_err(|e| {
            Error::Cluster(ClusterError::fatal(format!(
                "failed to load cluster credentials: {e}"
            )))
        })?;

        let namespace = std::env::var("OKTETO_NAMESPACE")
            .ok()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| config.default_namespace.clone());

        let client = Client::try_from(config)
            .map_err(|e| Error::Cluster(classify(&e, "cluster", "config")))?;

        debug!("cluster client ready, default namespace: {namespace}");
        Ok(Self { client, namespace })
    }

    /// Returns the default namespace of the local credentials.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the underlying kube client.
    #[must_use]
    pub fn kube(&self) -> Client {
        self.client.clone()
    }

    /// Typed deployments API for a namespace.
    #[must_use]
    pub fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Typed pods API for a namespace.
    #[must_use]
    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Typed secrets API for a namespace.
    #[must_use]
    pub fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Typed services API for a namespace.
    #[must_use]
    pub fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Typed persistent volume claims API for a namespace.
    #[must_use]
    pub fn volume_claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Typed endpoints API for a namespace.
    #[must_use]
    pub fn endpoints(&self, namespace: &str) -> Api<Endpoints> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Classifies a kube error into the sealed cluster taxonomy.
#[must_use]
pub fn classify(err: &kube::Error, kind: &str, name: &str) -> ClusterError {
    match err {
        kube::Error::Api(response) => {
            ClusterError::from_status(response.code, kind, name, &response.message)
        }
        kube::Error::HyperError(_) | kube::Error::Service(_) => {
            ClusterError::transient(err.to_string())
        }
        _ => ClusterError::fatal(err.to_string()),
    }
}

/// Runs a cluster operation, retrying transient failures with jittered
/// backoff.
///
/// # Errors
///
/// Returns the last error once the retry budget is exhausted, or the
/// first non-retryable error.
pub async fn with_retries<T, F, Fut>(operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..MAX_RETRIES {
        if attempt > 0 {
            let jitter = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
            let delay = RETRY_DELAY_MS * u64::from(attempt) + jitter;
            warn!("{operation} failed, retry {attempt}/{MAX_RETRIES} in {delay}ms");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if e.is_retryable() {
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::Cluster(ClusterError::transient("max retries exceeded"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_retries_stops_on_fatal() {
        let mut calls = 0;
        let result: Result<()> = with_retries("op", || {
            calls += 1;
            async { Err(Error::Cluster(ClusterError::fatal("bad request"))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_with_retries_retries_transient() {
        let mut calls = 0;
        let result: Result<u32> = with_retries("op", || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(Error::Cluster(ClusterError::transient("throttled")))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.expect("should succeed"), 3);
        assert_eq!(calls, 3);
    }
}
