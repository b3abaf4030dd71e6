//! The development environment manifest model.
//!
//! This module defines the `Dev` struct that maps to `okteto.yml`. The
//! manifest is declarative: it names the deployment to put in dev mode,
//! the image and command to develop with, and the mounts and forwards the
//! environment needs. Unknown keys are rejected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, ManifestError, Result, UserError};

use super::forward::{Forward, RemoteForward};

/// Environment variable name exposing the marker file path inside the dev
/// container.
pub const MARKER_PATH_VARIABLE: &str = "OKTETO_MARKER_PATH";

/// Environment variable name exposing the remote SSH port inside the dev
/// container.
pub const REMOTE_PORT_VARIABLE: &str = "OKTETO_REMOTE_PORT";

/// Annotation set on deployments created by okteto itself.
pub const AUTO_CREATE_ANNOTATION: &str = "dev.okteto.com/auto-create";

/// Annotation stamped with a fresh UUID to force the dev image pull.
pub const RESTART_ANNOTATION: &str = "dev.okteto.com/restart";

/// Annotation capturing the original pod spec so `down` can restore it.
pub const ORIGINAL_SPEC_ANNOTATION: &str = "dev.okteto.com/original-spec";

/// Default image for sandbox deployments.
pub const DEFAULT_IMAGE: &str = "okteto/desk:latest";

/// Default port for remote mode when `-r` is given without a value.
pub const DEFAULT_REMOTE_PORT: u16 = 2222;

/// SSH port inside the dev container in remote mode.
pub const REMOTE_SSH_PORT: u16 = 22;

/// Cluster-side syncthing TCP port. Reserved: user forwards may not use it.
pub const SYNC_TCP_PORT: u16 = 22000;

/// Cluster-side syncthing GUI port. Reserved: user forwards may not use it.
pub const SYNC_GUI_PORT: u16 = 8384;

const DEFAULT_MOUNT_PATH: &str = "/okteto";

/// A development environment manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Dev {
    /// Name of the deployment to develop against.
    pub name: String,

    /// Labels selecting the deployment instead of `name`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations applied to the translated deployment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Namespace where the environment is activated.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Container to replace. Defaults to the first container.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,

    /// Development image.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Image pull policy for the development image.
    #[serde(rename = "imagePullPolicy", default)]
    pub image_pull_policy: ImagePullPolicy,

    /// Environment variables, in manifest order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<EnvVar>,

    /// Command run in the dev container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Working directory of the dev container.
    #[serde(default, rename = "workdir", skip_serializing_if = "String::is_empty")]
    pub work_dir: String,

    /// Where the synchronized folder is mounted.
    #[serde(default, rename = "mountpath", skip_serializing_if = "String::is_empty")]
    pub mount_path: String,

    /// Sub path inside the shared volume. Only valid on services.
    #[serde(default, rename = "subpath", skip_serializing_if = "String::is_empty")]
    pub sub_path: String,

    /// Additional persistent volumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Pod security context of the dev container.
    #[serde(rename = "securityContext", default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,

    /// Local to remote port forwards.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forward: Vec<Forward>,

    /// Remote to local reverse forwards.
    #[serde(rename = "remoteForward", default, skip_serializing_if = "Vec::is_empty")]
    pub remote_forward: Vec<RemoteForward>,

    /// Remote SSH port; a non-zero value enables remote mode.
    #[serde(rename = "remote", default, skip_serializing_if = "is_zero")]
    pub remote_port: u16,

    /// Compute resource requirements of the dev container.
    #[serde(default, skip_serializing_if = "ResourceRequirements::is_empty")]
    pub resources: ResourceRequirements,

    /// Sidecar services co-translated with the main environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Dev>,

    /// Manifest file name, used as the marker file name inside the dev
    /// container. Not part of the manifest itself.
    #[serde(skip)]
    pub dev_path: String,

    /// Absolute path of the directory holding the manifest; this is the
    /// folder that gets synchronized. Not part of the manifest itself.
    #[serde(skip)]
    pub dev_dir: PathBuf,
}

/// Image pull policy values accepted in the manifest.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImagePullPolicy {
    /// Pull the image on every pod start.
    #[default]
    Always,
    /// Pull the image only when it is not present on the node.
    IfNotPresent,
    /// Never pull the image.
    Never,
}

/// An environment variable, written as `NAME=value` in the manifest.
/// `${VAR}` references in the value expand from the local environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value after expansion.
    pub value: String,
}

/// An additional persistent volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Volume {
    /// Sub path inside the shared claim.
    #[serde(rename = "subPath", default, skip_serializing_if = "String::is_empty")]
    pub sub_path: String,
    /// Mount path inside the container.
    #[serde(rename = "mountPath")]
    pub mount_path: String,
}

/// Security context applied to the dev container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecurityContext {
    /// UID the container runs as.
    #[serde(rename = "runAsUser", default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    /// GID the container runs as.
    #[serde(rename = "runAsGroup", default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    /// Filesystem group of the pod volumes.
    #[serde(rename = "fsGroup", default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
    /// Linux capabilities added to or dropped from the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

/// Linux capabilities of a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Capabilities {
    /// Capabilities to add.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<String>,
    /// Capabilities to drop.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop: Vec<String>,
}

/// Compute resource requirements.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceRequirements {
    /// Resource limits (name to quantity).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    /// Resource requests (name to quantity).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

const fn is_zero(v: &u16) -> bool {
    *v == 0
}

impl ResourceRequirements {
    /// Returns true if neither limits nor requests are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty() && self.requests.is_empty()
    }
}

impl ImagePullPolicy {
    /// Returns the policy as the API server expects it.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

impl TryFrom<String> for EnvVar {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let (name, value) = match s.split_once('=') {
            Some((name, value)) => (name, expand_env(value)),
            None => (s.as_str(), std::env::var(&s).unwrap_or_default()),
        };
        if name.is_empty() {
            return Err(format!("Invalid environment variable: '{s}'"));
        }
        Ok(Self {
            name: name.to_string(),
            value,
        })
    }
}

impl From<EnvVar> for String {
    fn from(e: EnvVar) -> Self {
        format!("{}={}", e.name, e.value)
    }
}

/// Expands `${VAR}` references from the local environment.
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&std::env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

impl Dev {
    /// Loads and validates a manifest from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading manifest from: {}", path.display());

        if !path.exists() {
            return Err(Error::Manifest(ManifestError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path)?;
        let mut dev = Self::read(&content)?;
        if let Some(file_name) = path.file_name() {
            dev.dev_path = file_name.to_string_lossy().to_string();
        }
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        dev.dev_dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        Ok(dev)
    }

    /// Parses and validates a manifest from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid, contains unknown keys, or
    /// fails validation.
    pub fn read(content: &str) -> Result<Self> {
        let mut dev: Self = serde_yaml::from_str(content).map_err(|e| {
            Error::Manifest(ManifestError::ParseError {
                message: e.to_string(),
            })
        })?;

        dev.set_defaults();
        dev.validate()?;

        debug!("loaded manifest for: {}", dev.name);
        Ok(dev)
    }

    /// Applies the manifest defaults.
    fn set_defaults(&mut self) {
        if self.dev_path.is_empty() {
            self.dev_path = String::from(DEFAULT_MANIFEST_FILES[0]);
        }
        if self.dev_dir.as_os_str().is_empty() {
            self.dev_dir = PathBuf::from(".");
        }
        if self.command.is_empty() {
            self.command = vec![String::from("sh")];
        }
        if self.mount_path.is_empty() && self.work_dir.is_empty() {
            self.mount_path = String::from(DEFAULT_MOUNT_PATH);
            self.work_dir = String::from(DEFAULT_MOUNT_PATH);
        }
        if self.mount_path.is_empty() {
            self.mount_path = self.work_dir.clone();
        }
        if !self.image.is_empty() {
            self.image = expand_env(&self.image);
        }
        for service in &mut self.services {
            if service.mount_path.is_empty() && service.work_dir.is_empty() {
                service.mount_path = String::from(DEFAULT_MOUNT_PATH);
                service.work_dir = String::from(DEFAULT_MOUNT_PATH);
            }
            if service.mount_path.is_empty() {
                service.mount_path = service.work_dir.clone();
            }
        }
    }

    /// Validates the manifest.
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Manifest(ManifestError::validation(
                "name cannot be empty",
                "name",
            )));
        }

        if !is_dns_label(&self.name) {
            return Err(Error::Manifest(ManifestError::validation(
                "name must consist of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character",
                "name",
            )));
        }

        if !self.sub_path.is_empty() {
            return Err(Error::Manifest(ManifestError::validation(
                "'subpath' is not supported in the main dev container",
                "subpath",
            )));
        }

        self.validate_forwards()?;

        for service in &self.services {
            if !service.name.is_empty() && !service.labels.is_empty() {
                return Err(Error::Manifest(ManifestError::validation_general(format!(
                    "'name' and 'labels' cannot be defined at the same time for service '{}'",
                    service.name
                ))));
            }
            if !service.namespace.is_empty() {
                return Err(Error::Manifest(ManifestError::validation_general(format!(
                    "'namespace' is not supported for service '{}'",
                    service.name
                ))));
            }
            if !service.forward.is_empty() || !service.remote_forward.is_empty() {
                return Err(Error::Manifest(ManifestError::validation_general(format!(
                    "'forward' is not supported for service '{}'",
                    service.name
                ))));
            }
            if !service.services.is_empty() {
                return Err(Error::Manifest(ManifestError::validation_general(format!(
                    "nested 'services' are not supported for service '{}'",
                    service.name
                ))));
            }
        }

        Ok(())
    }

    /// Rejects forwards that collide with the synchronization service or
    /// with each other.
    fn validate_forwards(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for f in &self.forward {
            if f.local == SYNC_TCP_PORT
                || f.local == SYNC_GUI_PORT
                || f.remote == SYNC_TCP_PORT
                || f.remote == SYNC_GUI_PORT
            {
                return Err(Error::User(UserError::new(
                    format!("Invalid forward '{f}': ports {SYNC_TCP_PORT} and {SYNC_GUI_PORT} are reserved for the file synchronization service"),
                    "Update the forward in your okteto manifest and try again",
                )));
            }
            if !seen.insert(f.local) {
                return Err(Error::User(UserError::new(
                    format!("local port {} is forwarded more than once", f.local),
                    "Update the forwards in your okteto manifest and try again",
                )));
            }
        }
        Ok(())
    }

    /// Updates the target namespace, rejecting a mismatch with the
    /// manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest declares a different namespace.
    pub fn update_namespace(&mut self, namespace: &str) -> Result<()> {
        if namespace.is_empty() {
            return Ok(());
        }
        if !self.namespace.is_empty() && self.namespace != namespace {
            return Err(Error::Manifest(ManifestError::validation(
                format!(
                    "the namespace in the okteto manifest '{}' does not match the namespace '{namespace}'",
                    self.namespace
                ),
                "namespace",
            )));
        }
        self.namespace = namespace.to_string();
        Ok(())
    }

    /// Enables remote mode, appending the SSH forward.
    pub fn load_remote(&mut self) {
        if self.remote_port == 0 {
            self.remote_port = DEFAULT_REMOTE_PORT;
        }
        self.forward.push(Forward::new(self.remote_port, REMOTE_SSH_PORT));
        info!("enabled remote mode on port {}", self.remote_port);
    }

    /// Forces the dev pods to be recreated and pull the latest image.
    pub fn load_force_pull(&mut self) {
        let restart_uuid = Uuid::new_v4().to_string();
        self.image_pull_policy = ImagePullPolicy::Always;
        self.annotations
            .insert(String::from(RESTART_ANNOTATION), restart_uuid.clone());
        for service in &mut self.services {
            service.image_pull_policy = ImagePullPolicy::Always;
            service
                .annotations
                .insert(String::from(RESTART_ANNOTATION), restart_uuid.clone());
        }
        info!("enabled force pull");
    }

    /// Returns true if remote mode is enabled.
    #[must_use]
    pub fn remote_mode_enabled(&self) -> bool {
        self.remote_port > 0 || !self.remote_forward.is_empty()
    }

    /// Returns the name of the secret carrying the syncthing material.
    #[must_use]
    pub fn secret_name(&self) -> String {
        format!("okteto-{}", self.name)
    }

    /// Returns the name of the i-th persistent volume claim.
    #[must_use]
    pub fn volume_claim_name(&self, i: usize) -> String {
        format!("pvc-{i}-{}", self.name)
    }

    /// Returns the sub path of the i-th data folder inside the shared
    /// claim.
    #[must_use]
    pub fn full_sub_path(&self, i: usize, sub_path: &str) -> String {
        if sub_path.is_empty() {
            format!("{}/data-{i}", self.name)
        } else {
            format!("{}/data-0/{sub_path}", self.name)
        }
    }

    /// Returns the sub path of the syncthing work folder inside the
    /// shared claim.
    #[must_use]
    pub fn syncthing_sub_path(&self) -> String {
        format!("{}/syncthing", self.name)
    }

    /// Returns the labels of the manifest as a selector string.
    #[must_use]
    pub fn labels_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Returns true if the value is a valid DNS label that does not start or
/// end with '-'.
fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// Default manifest file names searched in order.
pub const DEFAULT_MANIFEST_FILES: &[&str] = &["okteto.yml", "okteto.yaml"];

/// Resolves the manifest path, searching the default names when none is
/// given.
///
/// # Errors
///
/// Returns an error if no manifest file is found.
pub fn find_manifest(path: Option<&PathBuf>) -> Result<PathBuf> {
    if let Some(path) = path {
        return Ok(path.clone());
    }
    for name in DEFAULT_MANIFEST_FILES {
        let candidate = PathBuf::from(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::Manifest(ManifestError::FileNotFound {
        path: PathBuf::from(DEFAULT_MANIFEST_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_minimal() {
        let dev = Dev::read("name: api\n").expect("should parse");
        assert_eq!(dev.name, "api");
        assert_eq!(dev.command, vec!["sh"]);
        assert_eq!(dev.mount_path, "/okteto");
        assert_eq!(dev.work_dir, "/okteto");
        assert_eq!(dev.image_pull_policy, ImagePullPolicy::Always);
    }

    #[test]
    fn test_read_full() {
        let yaml = r#"
name: api
namespace: staging
container: api
image: node:16
imagePullPolicy: IfNotPresent
environment:
  - DEBUG=true
command: ["yarn", "start"]
workdir: /app
forward:
  - "8080:3000"
  - "9229:9229"
remoteForward:
  - remote: 9000
    local: 9001
remote: 2222
volumes:
  - subPath: cache
    mountPath: /root/.cache
securityContext:
  runAsUser: 1000
  fsGroup: 1000
  capabilities:
    add: ["SYS_PTRACE"]
resources:
  requests:
    cpu: 100m
services:
  - name: worker
    image: node:16
"#;
        let dev = Dev::read(yaml).expect("should parse");
        assert_eq!(dev.name, "api");
        assert_eq!(dev.container, "api");
        assert_eq!(dev.forward.len(), 2);
        assert_eq!(dev.forward[0], Forward::new(8080, 3000));
        assert_eq!(dev.remote_forward[0], RemoteForward { remote: 9000, local: 9001 });
        assert_eq!(dev.mount_path, "/app");
        assert_eq!(dev.services.len(), 1);
        assert_eq!(dev.services[0].mount_path, "/okteto");
        assert!(dev.remote_mode_enabled());
    }

    #[test]
    fn test_read_rejects_unknown_keys() {
        assert!(Dev::read("name: api\nbogus: true\n").is_err());
        // keys are case-sensitive
        assert!(Dev::read("name: api\nImage: node:16\n").is_err());
    }

    #[test]
    fn test_read_rejects_bad_pull_policy() {
        assert!(Dev::read("name: api\nimagePullPolicy: Sometimes\n").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(Dev::read("name: -api\n").is_err());
        assert!(Dev::read("name: api-\n").is_err());
        assert!(Dev::read("name: Api\n").is_err());
        assert!(Dev::read("name: my-api\n").is_ok());
    }

    #[test]
    fn test_validate_subpath_on_main() {
        assert!(Dev::read("name: api\nsubpath: src\n").is_err());
    }

    #[test]
    fn test_validate_service_constraints() {
        let namespaced = "name: api\nservices:\n  - name: worker\n    namespace: other\n";
        assert!(Dev::read(namespaced).is_err());

        let forwarded = "name: api\nservices:\n  - name: worker\n    forward: [\"8080:80\"]\n";
        assert!(Dev::read(forwarded).is_err());
    }

    #[test]
    fn test_validate_reserved_forward_ports() {
        let err = Dev::read("name: api\nforward: [\"22000:3000\"]\n").expect_err("must fail");
        assert!(matches!(err, Error::User(_)));

        let err = Dev::read("name: api\nforward: [\"8080:8384\"]\n").expect_err("must fail");
        assert!(matches!(err, Error::User(_)));
    }

    #[test]
    fn test_validate_duplicate_local_ports() {
        let yaml = "name: api\nforward: [\"8080:3000\", \"8080:3001\"]\n";
        assert!(matches!(Dev::read(yaml).expect_err("must fail"), Error::User(_)));
    }

    #[test]
    fn test_load_remote_appends_ssh_forward() {
        let mut dev = Dev::read("name: api\n").expect("should parse");
        dev.load_remote();
        assert_eq!(dev.remote_port, DEFAULT_REMOTE_PORT);
        assert_eq!(dev.forward.last(), Some(&Forward::new(DEFAULT_REMOTE_PORT, REMOTE_SSH_PORT)));
    }

    #[test]
    fn test_load_force_pull_stamps_services() {
        let mut dev = Dev::read("name: api\nservices:\n  - name: worker\n").expect("should parse");
        dev.load_force_pull();
        let stamp = dev.annotations.get(RESTART_ANNOTATION).expect("annotation");
        assert_eq!(dev.services[0].annotations.get(RESTART_ANNOTATION), Some(stamp));
    }

    #[test]
    fn test_update_namespace_mismatch() {
        let mut dev = Dev::read("name: api\nnamespace: staging\n").expect("should parse");
        assert!(dev.update_namespace("prod").is_err());
        assert!(dev.update_namespace("staging").is_ok());
        assert!(dev.update_namespace("").is_ok());
    }

    #[test]
    fn test_sub_paths() {
        let dev = Dev::read("name: api\n").expect("should parse");
        assert_eq!(dev.full_sub_path(0, ""), "api/data-0");
        assert_eq!(dev.full_sub_path(1, ""), "api/data-1");
        assert_eq!(dev.full_sub_path(2, "src"), "api/data-0/src");
        assert_eq!(dev.syncthing_sub_path(), "api/syncthing");
        assert_eq!(dev.volume_claim_name(0), "pvc-0-api");
        assert_eq!(dev.secret_name(), "okteto-api");
    }
}
