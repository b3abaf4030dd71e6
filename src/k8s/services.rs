//! Service creation for sandbox deployments.
//!
//! When okteto creates the deployment itself, it also creates a service
//! exposing the remote ports of the user forwards so other workloads in
//! the namespace can reach the sandbox.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, PostParams};
use tracing::info;

use crate::error::{ClusterError, Error, Result};
use crate::model::Dev;

use super::client::{classify, with_retries, ClusterClient};

/// Creates the service of a sandbox deployment.
///
/// # Errors
///
/// Returns an error if the API call fails.
pub async fn create(client: &ClusterClient, dev: &Dev) -> Result<()> {
    let ports: Vec<ServicePort> = dev
        .forward
        .iter()
        .filter(|f| !f.is_service() && f.remote > 0)
        .map(|f| ServicePort {
            name: Some(format!("p{}", f.remote)),
            port: i32::from(f.remote),
            target_port: Some(IntOrString::Int(i32::from(f.remote))),
            ..ServicePort::default()
        })
        .collect();

    if ports.is_empty() {
        return Ok(());
    }

    info!("creating service {}/{}", dev.namespace, dev.name);

    let service = Service {
        metadata: ObjectMeta {
            name: Some(dev.name.clone()),
            namespace: Some(dev.namespace.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(String::from("app"), dev.name.clone())])),
            ports: Some(ports),
            ..ServiceSpec::default()
        }),
        status: None,
    };

    let api = client.services(&dev.namespace);
    let service = &service;
    with_retries("create service", || {
        let api = api.clone();
        async move {
            api.create(&PostParams::default(), service)
                .await
                .map_err(|e| Error::Cluster(classify(&e, "service", &dev.name)))
        }
    })
    .await?;

    Ok(())
}

/// Deletes the service of a sandbox deployment. A missing service is
/// not an error.
///
/// # Errors
///
/// Returns an error if the API call fails.
pub async fn destroy(client: &ClusterClient, dev: &Dev) -> Result<()> {
    info!("deleting service {}/{}", dev.namespace, dev.name);

    match client
        .services(&dev.namespace)
        .delete(&dev.name, &DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(e) => {
            let classified = classify(&e, "service", &dev.name);
            if matches!(classified, ClusterError::NotFound { .. }) {
                Ok(())
            } else {
                Err(Error::Cluster(classified))
            }
        }
    }
}
