//! Persistent volume claim operations.
//!
//! One claim backs the primary mount (`pvc-0-<name>`) and one more backs
//! each extra volume declared in the manifest (`pvc-<i>-<name>`).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use tracing::{debug, info};

use crate::error::{ClusterError, Error, Result};
use crate::model::Dev;

use super::client::{classify, with_retries, ClusterClient};

/// Default claim size.
const DEFAULT_SIZE: &str = "10Gi";

/// Creates the persistent volume claims of a dev spec. Existing claims
/// are left untouched so data survives reconnects and re-activations.
///
/// # Errors
///
/// Returns an error if any claim cannot be created.
pub async fn create(client: &ClusterClient, dev: &Dev) -> Result<()> {
    let api = client.volume_claims(&dev.namespace);

    for i in 0..=dev.volumes.len() {
        let name = dev.volume_claim_name(i);
        let name = &name;

        let existing = with_retries("get volume claim", || {
            let api = api.clone();
            async move {
                api.get_opt(name)
                    .await
                    .map_err(|e| Error::Cluster(classify(&e, "persistentvolumeclaim", name)))
            }
        })
        .await?;
        if existing.is_some() {
            debug!("volume claim {name} already exists");
            continue;
        }

        info!("creating volume claim {}/{name}", dev.namespace);
        let claim = claim(dev, i);
        let claim = &claim;
        with_retries("create volume claim", || {
            let api = api.clone();
            async move {
                api.create(&PostParams::default(), claim)
                    .await
                    .map_err(|e| Error::Cluster(classify(&e, "persistentvolumeclaim", name)))
            }
        })
        .await?;
    }

    Ok(())
}

/// Deletes the persistent volume claims of a dev spec. Missing claims
/// are not an error.
///
/// # Errors
///
/// Returns an error if any deletion fails.
pub async fn destroy(client: &ClusterClient, dev: &Dev) -> Result<()> {
    let api = client.volume_claims(&dev.namespace);

    for i in 0..=dev.volumes.len() {
        let name = dev.volume_claim_name(i);
        info!("deleting volume claim {}/{name}", dev.namespace);

        if let Err(e) = api.delete(&name, &DeleteParams::default()).await {
            let classified = classify(&e, "persistentvolumeclaim", &name);
            if !matches!(classified, ClusterError::NotFound { .. }) {
                return Err(Error::Cluster(classified));
            }
        }
    }

    Ok(())
}

/// Builds the i-th claim of a dev spec: read-write-once, 10Gi.
fn claim(dev: &Dev, i: usize) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(dev.volume_claim_name(i)),
            namespace: Some(dev.namespace.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![String::from("ReadWriteOnce")]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    String::from("storage"),
                    Quantity(String::from(DEFAULT_SIZE)),
                )])),
                ..ResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_defaults() {
        let dev = Dev::read("name: api\n").expect("manifest should parse");
        let claim = claim(&dev, 0);

        assert_eq!(claim.metadata.name.as_deref(), Some("pvc-0-api"));
        let spec = claim.spec.expect("spec");
        assert_eq!(spec.access_modes.as_deref(), Some(&[String::from("ReadWriteOnce")][..]));
        let storage = spec
            .resources
            .and_then(|r| r.requests)
            .and_then(|mut r| r.remove("storage"))
            .expect("storage request");
        assert_eq!(storage.0, DEFAULT_SIZE);
    }
}
