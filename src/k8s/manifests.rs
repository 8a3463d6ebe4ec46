//! Object manifests for the bundle transfer endpoint and the per-node agent jobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HostPathVolumeSource, PodSpec, PodTemplateSpec, SecurityContext,
    Service, ServiceAccount, ServicePort, ServiceSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use sha2::{Digest, Sha256};

use crate::controller::ControllerSettings;
use crate::k8s::store::{ManagedObject, ObjectKey, ObjectKind};
use crate::labels::{
    BUNDLE_SERVER_NAME, COMPONENT_LABEL, EXTRACT_JOB_PREFIX, LOAD_JOB_PREFIX, MANAGED_BY_LABEL,
    MANAGER, NODE_ANNOTATION, NODE_LABEL,
};

/// Mount point of the host root filesystem inside agent and bundle server pods.
pub const HOST_MOUNT: &str = "/host";

const HOST_VOLUME: &str = "host";
const MAX_NAME_LEN: usize = 63;
const JOB_BACKOFF_LIMIT: i32 = 6;
const JOB_TTL_SECONDS: i32 = 3600;

/// Deterministic job name for a node, kept within the DNS label limit.
pub fn job_name(prefix: &str, node: &str) -> String {
    let name = format!("{prefix}-{node}");
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    format!("{prefix}-{}", shorten(node, MAX_NAME_LEN.saturating_sub(prefix.len() + 1)))
}

/// Value of the node label, kept within the label value limit.
pub fn node_label_value(node: &str) -> String {
    shorten(node, MAX_NAME_LEN)
}

/// Cut `value` to at most `max` characters, ending in an 8 character hash of the whole value.
fn shorten(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    let keep = max.saturating_sub(9);
    let truncated: String = value.chars().take(keep).collect();
    format!("{}-{}", truncated.trim_end_matches(['-', '.']), &digest[..8])
}

/// Path of a host file as seen from inside a pod that mounts the host at [`HOST_MOUNT`].
pub fn host_path(path: &Path) -> PathBuf {
    Path::new(HOST_MOUNT).join(path.strip_prefix("/").unwrap_or(path))
}

/// `host:port` of the bundle transfer service.
pub fn peer_address(settings: &ControllerSettings) -> String {
    format!(
        "{BUNDLE_SERVER_NAME}.{}.svc:{}",
        settings.namespace, settings.bundle_server_port
    )
}

fn labels(component: &str, node: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGER.to_string()),
        (COMPONENT_LABEL.to_string(), component.to_string()),
    ]);
    if let Some(node) = node {
        labels.insert(NODE_LABEL.to_string(), node_label_value(node));
    }
    labels
}

fn metadata(name: &str, namespace: Option<&str>, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        ..Default::default()
    }
}

fn host_volume() -> Volume {
    Volume {
        name: HOST_VOLUME.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: "/".to_string(),
            type_: Some("Directory".to_string()),
        }),
        ..Default::default()
    }
}

fn host_mount(read_only: bool) -> VolumeMount {
    VolumeMount {
        name: HOST_VOLUME.to_string(),
        mount_path: HOST_MOUNT.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn tolerate_everything() -> Vec<Toleration> {
    vec![Toleration {
        operator: Some("Exists".to_string()),
        ..Default::default()
    }]
}

fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        run_as_user: Some(0),
        ..Default::default()
    }
}

// ============================================
// Bundle transfer endpoint
// ============================================

/// Every object of the transfer endpoint, in creation order.
pub fn bundle_server_objects(settings: &ControllerSettings, bundle_file: &Path) -> Vec<ManagedObject> {
    vec![
        ManagedObject::ServiceAccount(bundle_server_service_account(settings)),
        ManagedObject::ClusterRole(bundle_server_cluster_role()),
        ManagedObject::ClusterRoleBinding(bundle_server_cluster_role_binding(settings)),
        ManagedObject::Service(bundle_server_service(settings)),
        ManagedObject::DaemonSet(bundle_server_daemon_set(settings, bundle_file)),
    ]
}

/// Keys of the transfer endpoint objects, in deletion order.
pub fn bundle_server_keys() -> Vec<ObjectKey> {
    [
        ObjectKind::DaemonSet,
        ObjectKind::Service,
        ObjectKind::ClusterRoleBinding,
        ObjectKind::ClusterRole,
        ObjectKind::ServiceAccount,
    ]
    .into_iter()
    .map(|kind| ObjectKey::new(kind, BUNDLE_SERVER_NAME))
    .collect()
}

fn bundle_server_service_account(settings: &ControllerSettings) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(
            BUNDLE_SERVER_NAME,
            Some(&settings.namespace),
            labels("bundle-server", None),
        ),
        ..Default::default()
    }
}

/// Grants use of the privileged security context constraint.
fn bundle_server_cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: metadata(BUNDLE_SERVER_NAME, None, labels("bundle-server", None)),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["security.openshift.io".to_string()]),
            resources: Some(vec!["securitycontextconstraints".to_string()]),
            resource_names: Some(vec!["privileged".to_string()]),
            verbs: vec!["use".to_string()],
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn bundle_server_cluster_role_binding(settings: &ControllerSettings) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: metadata(BUNDLE_SERVER_NAME, None, labels("bundle-server", None)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: BUNDLE_SERVER_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: BUNDLE_SERVER_NAME.to_string(),
            namespace: Some(settings.namespace.clone()),
            ..Default::default()
        }]),
    }
}

/// Headless service, so DNS resolves to every bundle server pod.
fn bundle_server_service(settings: &ControllerSettings) -> Service {
    let port = i32::from(settings.bundle_server_port);
    Service {
        metadata: metadata(
            BUNDLE_SERVER_NAME,
            Some(&settings.namespace),
            labels("bundle-server", None),
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(labels("bundle-server", None)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn bundle_server_daemon_set(settings: &ControllerSettings, bundle_file: &Path) -> DaemonSet {
    let selector = labels("bundle-server", None);
    let port = settings.bundle_server_port;
    let container = Container {
        name: "bundle-server".to_string(),
        image: Some(settings.image.clone()),
        args: Some(vec![
            "serve-bundle".to_string(),
            format!("--bundle-file={}", host_path(bundle_file).display()),
            format!("--port={port}"),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: i32::from(port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        security_context: Some(privileged()),
        volume_mounts: Some(vec![host_mount(true)]),
        ..Default::default()
    };

    DaemonSet {
        metadata: metadata(BUNDLE_SERVER_NAME, Some(&settings.namespace), selector.clone()),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(BUNDLE_SERVER_NAME.to_string()),
                    tolerations: Some(tolerate_everything()),
                    containers: vec![container],
                    volumes: Some(vec![host_volume()]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ============================================
// Per-node agent jobs
// ============================================

pub fn extract_job(settings: &ControllerSettings, node: &str, bundle_file: &Path) -> Job {
    let args = vec![
        "extract".to_string(),
        format!("--node-name={node}"),
        format!("--bundle-file={}", host_path(bundle_file).display()),
        format!("--peer-address={}", peer_address(settings)),
        format!("--extract-dir={}", host_path(&settings.extract_dir).display()),
    ];
    agent_job(settings, EXTRACT_JOB_PREFIX, "extract", node, args, false)
}

/// Load jobs share the host network so the runtime can reach the loopback registry.
pub fn load_job(settings: &ControllerSettings, node: &str) -> Job {
    let args = vec![
        "load".to_string(),
        format!("--node-name={node}"),
        format!("--extract-dir={}", host_path(&settings.extract_dir).display()),
        format!("--host-root={HOST_MOUNT}"),
        format!("--runtime-unit={}", settings.runtime_unit),
    ];
    agent_job(settings, LOAD_JOB_PREFIX, "load", node, args, true)
}

fn agent_job(
    settings: &ControllerSettings,
    prefix: &str,
    component: &str,
    node: &str,
    args: Vec<String>,
    host_network: bool,
) -> Job {
    let labels = labels(component, Some(node));
    let annotations = BTreeMap::from([(NODE_ANNOTATION.to_string(), node.to_string())]);
    let container = Container {
        name: component.to_string(),
        image: Some(settings.image.clone()),
        args: Some(args),
        security_context: Some(privileged()),
        volume_mounts: Some(vec![host_mount(false)]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            annotations: Some(annotations.clone()),
            ..metadata(&job_name(prefix, node), Some(&settings.namespace), labels.clone())
        },
        spec: Some(JobSpec {
            backoff_limit: Some(JOB_BACKOFF_LIMIT),
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_name: Some(node.to_string()),
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(settings.agent_service_account.clone()),
                    host_network: host_network.then_some(true),
                    dns_policy: host_network.then(|| "ClusterFirstWithHostNet".to_string()),
                    tolerations: Some(tolerate_everything()),
                    containers: vec![container],
                    volumes: Some(vec![host_volume()]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
