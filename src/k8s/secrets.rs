//! Secret operations for the syncthing material.
//!
//! The secret carries the TLS pair the remote syncthing authenticates
//! with, the rendered `config.xml` and the GUI password hash. It is
//! mounted into the sidecar at `/var/syncthing/secret`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use tracing::info;

use crate::error::{ClusterError, Error, Result};
use crate::model::Dev;
use crate::syncthing::Syncthing;

use super::client::{classify, with_retries, ClusterClient};

/// Creates or updates the syncthing secret for a dev spec.
///
/// # Errors
///
/// Returns an error if the API call fails.
pub async fn create(client: &ClusterClient, dev: &Dev, syncthing: &Syncthing) -> Result<()> {
    let name = dev.secret_name();
    info!("creating secret {}/{name}", dev.namespace);

    let data = BTreeMap::from([
        (
            String::from("cert.pem"),
            ByteString(crate::syncthing::CERT_PEM.as_bytes().to_vec()),
        ),
        (
            String::from("key.pem"),
            ByteString(crate::syncthing::KEY_PEM.as_bytes().to_vec()),
        ),
        (
            String::from("config.xml"),
            ByteString(syncthing.remote_config_xml(dev).into_bytes()),
        ),
        (
            String::from("password"),
            ByteString(syncthing.gui_password_hash().as_bytes().to_vec()),
        ),
    ]);

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(dev.namespace.clone()),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Secret::default()
    };

    let api = client.secrets(&dev.namespace);
    let name = &name;
    let secret = &secret;

    let existing = with_retries("get secret", || {
        let api = api.clone();
        async move {
            api.get_opt(name)
                .await
                .map_err(|e| Error::Cluster(classify(&e, "secret", name)))
        }
    })
    .await?;

    if existing.is_some() {
        with_retries("update secret", || {
            let api = api.clone();
            async move {
                api.replace(name, &PostParams::default(), secret)
                    .await
                    .map_err(|e| Error::Cluster(classify(&e, "secret", name)))
            }
        })
        .await?;
    } else {
        with_retries("create secret", || {
            let api = api.clone();
            async move {
                api.create(&PostParams::default(), secret)
                    .await
                    .map_err(|e| Error::Cluster(classify(&e, "secret", name)))
            }
        })
        .await?;
    }

    Ok(())
}

/// Deletes the syncthing secret. A missing secret is not an error.
///
/// # Errors
///
/// Returns an error if the API call fails.
pub async fn destroy(client: &ClusterClient, dev: &Dev) -> Result<()> {
    let name = dev.secret_name();
    info!("deleting secret {}/{name}", dev.namespace);

    match client
        .secrets(&dev.namespace)
        .delete(&name, &DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(e) => {
            let classified = classify(&e, "secret", &name);
            if matches!(classified, ClusterError::NotFound { .. }) {
                Ok(())
            } else {
                Err(Error::Cluster(classified))
            }
        }
    }
}
