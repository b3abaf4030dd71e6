//! Translation of a deployment into its dev-mode overlay.
//!
//! The translator always starts from the pristine pod spec: on first
//! translation the original spec is captured into the
//! `dev.okteto.com/original-spec` annotation, and every translation
//! re-applies the overlay on top of that capture. This makes translation
//! idempotent and lets `down` restore the deployment exactly.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities as K8sCapabilities, Container, ContainerPort, EnvVar as K8sEnvVar,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    ResourceRequirements as K8sResources, SecretVolumeSource, SecurityContext as K8sSecurityContext,
    Volume as K8sVolume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::error::{ClusterError, Error, Result};
use crate::model::{
    Dev, ImagePullPolicy, AUTO_CREATE_ANNOTATION, DEFAULT_IMAGE, MARKER_PATH_VARIABLE,
    ORIGINAL_SPEC_ANNOTATION, REMOTE_PORT_VARIABLE, RESTART_ANNOTATION, SYNC_GUI_PORT,
    SYNC_TCP_PORT,
};

/// Image of the syncthing sidecar.
pub const SYNC_IMAGE: &str = "okteto/syncthing:1.2.2";

/// Name of the syncthing sidecar container.
pub const SYNC_CONTAINER: &str = "okteto";

/// Name of the init container that seeds the persistent volume.
pub const INIT_CONTAINER: &str = "okteto-init";

/// Name of the shared persistent volume inside the pod spec.
pub const SHARED_VOLUME: &str = "okteto";

/// Name of the secret volume carrying the syncthing material.
pub const SECRET_VOLUME: &str = "okteto-secret";

/// Mount path of the shared volume inside the sidecar.
const SYNC_MOUNT: &str = "/var/okteto";

/// Mount path of the secret volume inside the sidecar.
const SYNC_SECRET_MOUNT: &str = "/var/syncthing/secret";

/// Mount path of the syncthing work folder inside the dev container.
const SYNCTHING_MOUNT: &str = "/var/syncthing";

/// Entry point of the dev container while in dev mode.
const START_SCRIPT: &str = "/var/okteto/bin/start.sh";

/// A per-container mutation derived from a dev spec.
#[derive(Debug, Clone)]
pub struct TranslationRule {
    /// Name of the container to mutate; empty selects the first one.
    pub container: String,
    /// Replacement image; empty keeps the original.
    pub image: String,
    /// Image pull policy.
    pub image_pull_policy: ImagePullPolicy,
    /// Environment variables appended to the container.
    pub environment: Vec<(String, String)>,
    /// Replacement command, when set.
    pub command: Option<Vec<String>>,
    /// Replacement args, when set.
    pub args: Option<Vec<String>>,
    /// Replacement working directory; empty keeps the original.
    pub work_dir: String,
    /// Volume mounts appended to the container.
    pub volumes: Vec<RuleMount>,
    /// Whether the container keeps its health checks.
    pub healthchecks: bool,
    /// Marker file name; set only for the main dev container.
    pub marker: Option<String>,
    /// Resource requirements; empty keeps the original.
    pub resources: crate::model::ResourceRequirements,
    /// Capabilities applied to the container security context.
    pub capabilities: Option<crate::model::Capabilities>,
}

/// A volume mount carried by a translation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMount {
    /// Pod volume name.
    pub name: String,
    /// Mount path inside the container.
    pub mount_path: String,
    /// Sub path inside the volume; empty mounts the volume root.
    pub sub_path: String,
}

impl TranslationRule {
    /// Builds the rule for a dev spec. `main` is the root spec; when
    /// `dev` and `main` are the same, the rule is for the main dev
    /// container and carries the marker, the syncthing mount and the
    /// start script.
    #[must_use]
    pub fn new(dev: &Dev, main: &Dev) -> Self {
        let is_main = std::ptr::eq(dev, main);

        let mut rule = Self {
            container: dev.container.clone(),
            image: dev.image.clone(),
            image_pull_policy: dev.image_pull_policy,
            environment: dev
                .environment
                .iter()
                .map(|e| (e.name.clone(), e.value.clone()))
                .collect(),
            command: None,
            args: None,
            work_dir: dev.work_dir.clone(),
            volumes: vec![RuleMount {
                name: String::from(SHARED_VOLUME),
                mount_path: dev.mount_path.clone(),
                sub_path: main.full_sub_path(0, &dev.sub_path),
            }],
            healthchecks: !is_main,
            marker: None,
            resources: dev.resources.clone(),
            capabilities: dev.security_context.as_ref().and_then(|sc| sc.capabilities.clone()),
        };

        if is_main {
            rule.marker = Some(dev.dev_path.clone());
            rule.environment.push((
                String::from(MARKER_PATH_VARIABLE),
                format!("{}/{}", dev.mount_path.trim_end_matches('/'), dev.dev_path),
            ));
            if main.remote_mode_enabled() {
                rule.environment.push((
                    String::from(REMOTE_PORT_VARIABLE),
                    main.remote_port.to_string(),
                ));
                rule.args = Some(vec![String::from("-r")]);
            } else {
                rule.args = Some(Vec::new());
            }
            rule.command = Some(vec![String::from(START_SCRIPT)]);
            rule.volumes.push(RuleMount {
                name: String::from(SHARED_VOLUME),
                mount_path: String::from(SYNCTHING_MOUNT),
                sub_path: dev.syncthing_sub_path(),
            });
        } else if !dev.command.is_empty() {
            rule.command = Some(dev.command.clone());
            rule.args = Some(Vec::new());
        }

        // Extra volumes of the main spec mount their dedicated claim;
        // service volumes share the main claim through subpaths.
        for (i, v) in dev.volumes.iter().enumerate() {
            if is_main {
                rule.volumes.push(RuleMount {
                    name: format!("pvc-{}", i + 1),
                    mount_path: v.mount_path.clone(),
                    sub_path: v.sub_path.clone(),
                });
            } else {
                rule.volumes.push(RuleMount {
                    name: String::from(SHARED_VOLUME),
                    mount_path: v.mount_path.clone(),
                    sub_path: main.full_sub_path(i + 1, &v.sub_path),
                });
            }
        }

        rule
    }
}

/// Returns true if the deployment carries the dev-mode overlay.
#[must_use]
pub fn is_dev_mode(d: &Deployment) -> bool {
    d.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ORIGINAL_SPEC_ANNOTATION))
}

/// Returns true if the deployment was created by okteto itself.
#[must_use]
pub fn is_auto_create(d: &Deployment) -> bool {
    d.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(AUTO_CREATE_ANNOTATION))
}

/// Builds a sandbox deployment for a dev spec with no existing
/// deployment.
#[must_use]
pub fn sandbox(dev: &Dev) -> Deployment {
    let image = if dev.image.is_empty() {
        String::from(DEFAULT_IMAGE)
    } else {
        dev.image.clone()
    };

    let labels = BTreeMap::from([(String::from("app"), dev.name.clone())]);

    Deployment {
        metadata: ObjectMeta {
            name: Some(dev.name.clone()),
            namespace: Some(dev.namespace.clone()),
            annotations: Some(BTreeMap::from([(
                String::from(AUTO_CREATE_ANNOTATION),
                String::from("true"),
            )])),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    termination_grace_period_seconds: Some(0),
                    containers: vec![Container {
                        name: String::from("dev"),
                        image: Some(image),
                        image_pull_policy: Some(String::from("Always")),
                        command: Some(vec![String::from("tail")]),
                        args: Some(vec![String::from("-f"), String::from("/dev/null")]),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        status: None,
    }
}

/// Translates a deployment into its dev-mode overlay.
///
/// # Errors
///
/// Returns an error if the target container of the main spec or of any
/// service spec does not exist, or if the pod spec cannot be captured.
pub fn translate(dev: &Dev, d: &Deployment) -> Result<Deployment> {
    let mut d = d.clone();
    let name = d.metadata.name.clone().unwrap_or_default();

    let spec = d
        .spec
        .as_mut()
        .ok_or_else(|| Error::Cluster(ClusterError::fatal(format!("deployment '{name}' has no spec"))))?;

    // Capture the original pod spec once; later translations reset to it
    // so the overlay never stacks on itself.
    let annotations = d.metadata.annotations.get_or_insert_with(BTreeMap::new);
    let original_json = match annotations.get(ORIGINAL_SPEC_ANNOTATION) {
        Some(json) => json.clone(),
        None => serde_json::to_string(&spec.template.spec)
            .map_err(|e| Error::internal(format!("failed to capture pod spec: {e}")))?,
    };
    annotations.insert(String::from(ORIGINAL_SPEC_ANNOTATION), original_json.clone());
    for (k, v) in &dev.annotations {
        annotations.insert(k.clone(), v.clone());
    }

    let original: Option<PodSpec> = serde_json::from_str(&original_json)
        .map_err(|e| Error::internal(format!("failed to parse captured pod spec: {e}")))?;
    spec.template.spec = original;

    let pod_spec = spec
        .template
        .spec
        .get_or_insert_with(PodSpec::default);

    let main_rule = TranslationRule::new(dev, dev);
    apply_rule(&main_rule, pod_spec, &name)?;

    for service in &dev.services {
        let rule = TranslationRule::new(service, dev);
        apply_rule(&rule, pod_spec, &name)?;
    }

    if let Some(sc) = &dev.security_context {
        let pod_sc = pod_spec
            .security_context
            .get_or_insert_with(PodSecurityContext::default);
        pod_sc.run_as_user = sc.run_as_user;
        pod_sc.run_as_group = sc.run_as_group;
        pod_sc.fs_group = sc.fs_group;
    }

    pod_spec
        .init_containers
        .get_or_insert_with(Vec::new)
        .push(init_container(dev));
    pod_spec.containers.push(sync_container(dev));

    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    volumes.push(K8sVolume {
        name: String::from(SHARED_VOLUME),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: dev.volume_claim_name(0),
            read_only: None,
        }),
        ..K8sVolume::default()
    });
    for i in 1..=dev.volumes.len() {
        volumes.push(K8sVolume {
            name: format!("pvc-{i}"),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: dev.volume_claim_name(i),
                read_only: None,
            }),
            ..K8sVolume::default()
        });
    }
    volumes.push(K8sVolume {
        name: String::from(SECRET_VOLUME),
        secret: Some(SecretVolumeSource {
            secret_name: Some(dev.secret_name()),
            ..SecretVolumeSource::default()
        }),
        ..K8sVolume::default()
    });

    // The restart stamp lives on the pod template so a fresh UUID forces
    // a rollout even when the overlay is otherwise unchanged.
    if let Some(stamp) = dev.annotations.get(RESTART_ANNOTATION) {
        spec.template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(String::from(RESTART_ANNOTATION), stamp.clone());
    }

    Ok(d)
}

/// Restores a translated deployment to its captured original state.
///
/// # Errors
///
/// Returns [`Error::NotDevDeployment`] if the deployment does not carry
/// the overlay.
pub fn restore(d: &Deployment) -> Result<Deployment> {
    let mut d = d.clone();

    let original_json = d
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ORIGINAL_SPEC_ANNOTATION))
        .cloned()
        .ok_or(Error::NotDevDeployment)?;

    let original: Option<PodSpec> = serde_json::from_str(&original_json)
        .map_err(|e| Error::internal(format!("failed to parse captured pod spec: {e}")))?;

    if let Some(spec) = d.spec.as_mut() {
        spec.template.spec = original;
        if let Some(meta) = spec.template.metadata.as_mut() {
            if let Some(annotations) = meta.annotations.as_mut() {
                annotations.remove(RESTART_ANNOTATION);
                if annotations.is_empty() {
                    meta.annotations = None;
                }
            }
        }
    }

    if let Some(annotations) = d.metadata.annotations.as_mut() {
        annotations.remove(ORIGINAL_SPEC_ANNOTATION);
        annotations.remove(RESTART_ANNOTATION);
        if annotations.is_empty() {
            d.metadata.annotations = None;
        }
    }

    Ok(d)
}

/// Applies a rule to its target container inside the pod spec.
fn apply_rule(rule: &TranslationRule, pod_spec: &mut PodSpec, deployment: &str) -> Result<()> {
    let container = select_container(pod_spec, &rule.container).ok_or_else(|| {
        Error::Cluster(ClusterError::fatal(format!(
            "Container '{}' does not exist in deployment '{deployment}'",
            rule.container
        )))
    })?;

    if !rule.image.is_empty() {
        container.image = Some(rule.image.clone());
    }
    container.image_pull_policy = Some(String::from(rule.image_pull_policy.as_str()));

    if let Some(command) = &rule.command {
        container.command = Some(command.clone());
    }
    if let Some(args) = &rule.args {
        container.args = Some(args.clone());
    }
    if !rule.work_dir.is_empty() {
        container.working_dir = Some(rule.work_dir.clone());
    }

    let env = container.env.get_or_insert_with(Vec::new);
    for (name, value) in &rule.environment {
        match env.iter_mut().find(|e| &e.name == name) {
            Some(existing) => existing.value = Some(value.clone()),
            None => env.push(K8sEnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            }),
        }
    }

    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    for mount in &rule.volumes {
        mounts.retain(|m| m.mount_path != mount.mount_path);
        mounts.push(VolumeMount {
            name: mount.name.clone(),
            mount_path: mount.mount_path.clone(),
            sub_path: if mount.sub_path.is_empty() {
                None
            } else {
                Some(mount.sub_path.clone())
            },
            ..VolumeMount::default()
        });
    }

    if !rule.resources.is_empty() {
        container.resources = Some(K8sResources {
            limits: quantities(&rule.resources.limits),
            requests: quantities(&rule.resources.requests),
            ..K8sResources::default()
        });
    }

    if !rule.healthchecks {
        container.liveness_probe = None;
        container.readiness_probe = None;
        container.startup_probe = None;
    }

    if let Some(capabilities) = &rule.capabilities {
        let sc = container
            .security_context
            .get_or_insert_with(K8sSecurityContext::default);
        sc.capabilities = Some(K8sCapabilities {
            add: non_empty(&capabilities.add),
            drop: non_empty(&capabilities.drop),
        });
    }

    Ok(())
}

/// Selects the target container: by name when given, the first one
/// otherwise.
fn select_container<'a>(pod_spec: &'a mut PodSpec, name: &str) -> Option<&'a mut Container> {
    if name.is_empty() {
        pod_spec.containers.first_mut()
    } else {
        pod_spec.containers.iter_mut().find(|c| c.name == name)
    }
}

/// Builds the init container seeding the persistent volume with the
/// image content and creating the marker file.
fn init_container(dev: &Dev) -> Container {
    let source = format!("{}/*", dev.mount_path.trim_end_matches('/'));
    let target = if dev.sub_path.is_empty() {
        String::from("/okteto/init")
    } else {
        format!("/okteto/init/{}", dev.sub_path)
    };

    let image = if dev.image.is_empty() {
        String::from(DEFAULT_IMAGE)
    } else {
        dev.image.clone()
    };

    let mut mounts = vec![VolumeMount {
        name: String::from(SHARED_VOLUME),
        mount_path: String::from("/okteto/init"),
        ..VolumeMount::default()
    }];
    for (i, v) in dev.volumes.iter().enumerate() {
        mounts.push(VolumeMount {
            name: format!("pvc-{}", i + 1),
            mount_path: v.mount_path.clone(),
            ..VolumeMount::default()
        });
    }

    Container {
        name: String::from(INIT_CONTAINER),
        image: Some(image),
        command: Some(vec![
            String::from("sh"),
            String::from("-c"),
            format!(
                "(ls -A /okteto/init | grep -v lost+found || mkdir -p {target} && cp -Rf {source} {target}); touch /okteto/init/{}",
                dev.dev_path
            ),
        ]),
        resources: Some(K8sResources {
            requests: Some(BTreeMap::from([
                (String::from("cpu"), Quantity(String::from("50m"))),
                (String::from("memory"), Quantity(String::from("16Mi"))),
            ])),
            limits: Some(BTreeMap::from([
                (String::from("cpu"), Quantity(String::from("50m"))),
                (String::from("memory"), Quantity(String::from("16Mi"))),
            ])),
            ..K8sResources::default()
        }),
        volume_mounts: Some(mounts),
        ..Container::default()
    }
}

/// Builds the syncthing sidecar container.
fn sync_container(dev: &Dev) -> Container {
    Container {
        name: String::from(SYNC_CONTAINER),
        image: Some(String::from(SYNC_IMAGE)),
        image_pull_policy: Some(String::from(dev.image_pull_policy.as_str())),
        resources: Some(K8sResources {
            requests: Some(BTreeMap::from([
                (String::from("cpu"), Quantity(String::from("50m"))),
                (String::from("memory"), Quantity(String::from("64Mi"))),
            ])),
            limits: Some(BTreeMap::from([
                (String::from("cpu"), Quantity(String::from("500m"))),
                (String::from("memory"), Quantity(String::from("256Mi"))),
            ])),
            ..K8sResources::default()
        }),
        ports: Some(vec![
            ContainerPort {
                container_port: i32::from(SYNC_TCP_PORT),
                ..ContainerPort::default()
            },
            ContainerPort {
                container_port: i32::from(SYNC_GUI_PORT),
                ..ContainerPort::default()
            },
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: String::from(SECRET_VOLUME),
                mount_path: String::from(SYNC_SECRET_MOUNT),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: String::from(SHARED_VOLUME),
                mount_path: String::from(SYNC_MOUNT),
                ..VolumeMount::default()
            },
        ]),
        ..Container::default()
    }
}

fn quantities(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if map.is_empty() {
        None
    } else {
        Some(
            map.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect(),
        )
    }
}

fn non_empty(v: &[String]) -> Option<Vec<String>> {
    if v.is_empty() {
        None
    } else {
        Some(v.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Dev;
    use k8s_openapi::api::core::v1::Probe;

    fn original_deployment() -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(String::from("api")),
                namespace: Some(String::from("staging")),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(3),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        String::from("app"),
                        String::from("api"),
                    )])),
                    ..LabelSelector::default()
                },
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: String::from("api"),
                            image: Some(String::from("registry/api:prod")),
                            env: Some(vec![K8sEnvVar {
                                name: String::from("ENV"),
                                value: Some(String::from("production")),
                                value_from: None,
                            }]),
                            liveness_probe: Some(Probe::default()),
                            readiness_probe: Some(Probe::default()),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            status: None,
        }
    }

    fn dev() -> Dev {
        Dev::read("name: api\nimage: node:16\ncontainer: api\n").expect("manifest should parse")
    }

    fn containers(d: &Deployment) -> &Vec<Container> {
        &d.spec
            .as_ref()
            .expect("spec")
            .template
            .spec
            .as_ref()
            .expect("pod spec")
            .containers
    }

    #[test]
    fn test_translate_replaces_dev_container() {
        let translated = translate(&dev(), &original_deployment()).expect("translate");
        let dev_container = &containers(&translated)[0];

        assert_eq!(dev_container.image.as_deref(), Some("node:16"));
        assert_eq!(
            dev_container.command.as_deref(),
            Some(&[String::from("/var/okteto/bin/start.sh")][..])
        );
        assert!(dev_container.liveness_probe.is_none());
        assert!(dev_container.readiness_probe.is_none());

        let env = dev_container.env.as_ref().expect("env");
        assert!(env.iter().any(|e| e.name == "ENV"), "original env is kept");
        let marker = env
            .iter()
            .find(|e| e.name == MARKER_PATH_VARIABLE)
            .expect("marker env var");
        assert_eq!(marker.value.as_deref(), Some("/okteto/okteto.yml"));

        let mounts = dev_container.volume_mounts.as_ref().expect("mounts");
        assert!(mounts
            .iter()
            .any(|m| m.mount_path == "/okteto" && m.sub_path.as_deref() == Some("api/data-0")));
    }

    #[test]
    fn test_translate_appends_sidecar_and_init() {
        let translated = translate(&dev(), &original_deployment()).expect("translate");

        let sidecar = containers(&translated)
            .iter()
            .find(|c| c.name == SYNC_CONTAINER)
            .expect("sidecar");
        assert_eq!(sidecar.image.as_deref(), Some(SYNC_IMAGE));
        let requests = sidecar
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .expect("requests");
        assert_eq!(requests["cpu"].0, "50m");
        assert_eq!(requests["memory"].0, "64Mi");

        let init = translated
            .spec
            .as_ref()
            .expect("spec")
            .template
            .spec
            .as_ref()
            .expect("pod spec")
            .init_containers
            .as_ref()
            .expect("init containers")
            .iter()
            .find(|c| c.name == INIT_CONTAINER)
            .cloned()
            .expect("init container");
        let command = init.command.expect("command").join(" ");
        assert!(command.contains("lost+found"));
        assert!(command.contains("cp -Rf"));
    }

    #[test]
    fn test_translate_remote_mode() {
        let mut dev = dev();
        dev.remote_port = 2222;
        let translated = translate(&dev, &original_deployment()).expect("translate");
        let dev_container = &containers(&translated)[0];

        assert_eq!(dev_container.args.as_deref(), Some(&[String::from("-r")][..]));
        let env = dev_container.env.as_ref().expect("env");
        let remote = env
            .iter()
            .find(|e| e.name == REMOTE_PORT_VARIABLE)
            .expect("remote port env var");
        assert_eq!(remote.value.as_deref(), Some("2222"));
    }

    #[test]
    fn test_translate_restore_round_trip() {
        let original = original_deployment();
        let translated = translate(&dev(), &original).expect("translate");
        assert!(is_dev_mode(&translated));

        let restored = restore(&translated).expect("restore");
        assert_eq!(restored, original);
    }

    #[test]
    fn test_translate_idempotence() {
        let original = original_deployment();
        let once = translate(&dev(), &original).expect("translate");
        let twice = translate(&dev(), &once).expect("translate again");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_restore_requires_overlay() {
        assert!(matches!(
            restore(&original_deployment()).expect_err("must fail"),
            Error::NotDevDeployment
        ));
    }

    #[test]
    fn test_sandbox() {
        let mut dev = dev();
        dev.image = String::new();
        let sandbox = sandbox(&dev);

        assert!(is_auto_create(&sandbox));
        assert_eq!(containers(&sandbox)[0].image.as_deref(), Some(DEFAULT_IMAGE));
    }

    #[test]
    fn test_translate_service_container() {
        let yaml = r"
name: api
container: api
image: node:16
services:
  - name: worker
    container: worker
    image: worker:dev
    command: [npm, run, worker]
";
        let dev = Dev::read(yaml).expect("manifest should parse");

        let mut original = original_deployment();
        original
            .spec
            .as_mut()
            .expect("spec")
            .template
            .spec
            .as_mut()
            .expect("pod spec")
            .containers
            .push(Container {
                name: String::from("worker"),
                image: Some(String::from("worker:prod")),
                liveness_probe: Some(Probe::default()),
                ..Container::default()
            });

        let translated = translate(&dev, &original).expect("translate");
        let worker = containers(&translated)
            .iter()
            .find(|c| c.name == "worker")
            .expect("worker container");

        assert_eq!(worker.image.as_deref(), Some("worker:dev"));
        assert_eq!(
            worker.command.as_deref(),
            Some(&[String::from("npm"), String::from("run"), String::from("worker")][..])
        );
        // services keep their health checks and get no marker
        assert!(worker.liveness_probe.is_some());
        let env = worker.env.clone().unwrap_or_default();
        assert!(!env.iter().any(|e| e.name == MARKER_PATH_VARIABLE));
    }

    #[test]
    fn test_translate_volume_claims() {
        let yaml = "name: api\ncontainer: api\nimage: node:16\nvolumes:\n  - mountPath: /root/.cache\n";
        let dev = Dev::read(yaml).expect("manifest should parse");
        let translated = translate(&dev, &original_deployment()).expect("translate");

        let pod_spec = translated
            .spec
            .as_ref()
            .expect("spec")
            .template
            .spec
            .as_ref()
            .expect("pod spec");
        let volumes = pod_spec.volumes.clone().expect("volumes");

        let shared = volumes.iter().find(|v| v.name == SHARED_VOLUME).expect("shared");
        assert_eq!(
            shared
                .persistent_volume_claim
                .as_ref()
                .expect("claim")
                .claim_name,
            "pvc-0-api"
        );
        let extra = volumes.iter().find(|v| v.name == "pvc-1").expect("extra");
        assert_eq!(
            extra
                .persistent_volume_claim
                .as_ref()
                .expect("claim")
                .claim_name,
            "pvc-1-api"
        );
        assert!(volumes.iter().any(|v| v.name == SECRET_VOLUME));

        // The dedicated claim is mounted by the dev container at the
        // declared path, not left dangling on the pod.
        let dev_container = &pod_spec.containers[0];
        let mount = dev_container
            .volume_mounts
            .as_ref()
            .expect("mounts")
            .iter()
            .find(|m| m.mount_path == "/root/.cache")
            .expect("extra volume mount");
        assert_eq!(mount.name, "pvc-1");
        assert_eq!(mount.sub_path, None);

        let init = pod_spec
            .init_containers
            .as_ref()
            .expect("init containers")
            .iter()
            .find(|c| c.name == INIT_CONTAINER)
            .expect("init container");
        assert!(init
            .volume_mounts
            .as_ref()
            .expect("init mounts")
            .iter()
            .any(|m| m.name == "pvc-1" && m.mount_path == "/root/.cache"));
    }

    #[test]
    fn test_translate_missing_container() {
        let mut dev = dev();
        dev.container = String::from("missing");
        assert!(translate(&dev, &original_deployment()).is_err());
    }
}
