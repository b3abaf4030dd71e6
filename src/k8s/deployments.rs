//! Deployment operations for the cluster facade.

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{DeleteParams, ListParams, PostParams};
use tracing::{debug, info};

use crate::error::{ClusterError, Error, Result};
use crate::model::Dev;

use super::client::{classify, with_retries, ClusterClient};
use super::translate;

/// Gets the deployment targeted by a dev spec, by name or by label
/// selector.
///
/// # Errors
///
/// Returns a not-found error if no deployment matches.
pub async fn get(client: &ClusterClient, dev: &Dev) -> Result<Deployment> {
    let api = client.deployments(&dev.namespace);

    if dev.labels.is_empty() {
        debug!("getting deployment {}/{}", dev.namespace, dev.name);
        return with_retries("get deployment", || {
            let api = api.clone();
            async move {
                api.get(&dev.name)
                    .await
                    .map_err(|e| Error::Cluster(classify(&e, "deployment", &dev.name)))
            }
        })
        .await;
    }

    let selector = dev.labels_selector();
    debug!("getting deployment by labels: {selector}");
    let selector = &selector;
    let list = with_retries("list deployments", || {
        let api = api.clone();
        async move {
            api.list(&ListParams::default().labels(selector))
                .await
                .map_err(|e| Error::Cluster(classify(&e, "deployment", &dev.name)))
        }
    })
    .await?;

    list.items
        .into_iter()
        .next()
        .ok_or_else(|| Error::Cluster(ClusterError::not_found("deployment", &dev.name)))
}

/// Creates or updates a deployment.
///
/// # Errors
///
/// Returns an error if the API call fails.
pub async fn deploy(client: &ClusterClient, d: &Deployment, create: bool) -> Result<Deployment> {
    let name = d.metadata.name.clone().unwrap_or_default();
    let namespace = d.metadata.namespace.clone().unwrap_or_default();
    let api = client.deployments(&namespace);
    let name = &name;

    if create {
        info!("creating deployment {namespace}/{name}");
        with_retries("create deployment", || {
            let api = api.clone();
            async move {
                api.create(&PostParams::default(), d)
                    .await
                    .map_err(|e| Error::Cluster(classify(&e, "deployment", name)))
            }
        })
        .await
    } else {
        info!("updating deployment {namespace}/{name}");
        with_retries("update deployment", || {
            let api = api.clone();
            async move {
                api.replace(name, &PostParams::default(), d)
                    .await
                    .map_err(|e| Error::Cluster(classify(&e, "deployment", name)))
            }
        })
        .await
    }
}

/// Restores a translated deployment to its captured original state.
///
/// # Errors
///
/// Returns [`Error::NotDevDeployment`] if the deployment does not carry
/// the dev-mode overlay.
pub async fn restore(client: &ClusterClient, d: &Deployment) -> Result<()> {
    let restored = translate::restore(d)?;
    deploy(client, &restored, false).await?;
    Ok(())
}

/// Deletes a deployment.
///
/// # Errors
///
/// Returns an error if the API call fails; a missing deployment is not
/// an error.
pub async fn destroy(client: &ClusterClient, name: &str, namespace: &str) -> Result<()> {
    info!("deleting deployment {namespace}/{name}");
    let api = client.deployments(namespace);

    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let classified = classify(&e, "deployment", name);
            if matches!(classified, ClusterError::NotFound { .. }) {
                Ok(())
            } else {
                Err(Error::Cluster(classified))
            }
        }
    }
}
