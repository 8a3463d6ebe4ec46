//! Pure planning step: node classification and the actions one reconcile pass takes.

use std::path::Path;

use k8s_openapi::api::core::v1::Node;

use crate::controller::ControllerSettings;
use crate::error::{KbuError, Result};
use crate::k8s::manifests::{self, bundle_server_keys, bundle_server_objects};
use crate::k8s::node::{NodeState, node_name, recorded_metadata};
use crate::k8s::store::{ManagedObject, ObjectKey};
use crate::k8s::target::DesiredUpdate;

/// Node names grouped by rollout state, in listing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub needs_extraction: Vec<String>,
    pub needs_load: Vec<String>,
    pub ready: Vec<String>,
}

impl Classification {
    /// True when at least one node exists and every node is ready.
    pub fn all_ready(&self) -> bool {
        self.needs_extraction.is_empty() && self.needs_load.is_empty() && !self.ready.is_empty()
    }
}

pub fn classify(nodes: &[Node]) -> Classification {
    let mut classification = Classification::default();
    for node in nodes {
        let name = node_name(node).to_string();
        match NodeState::of(node) {
            NodeState::NeedsExtraction => classification.needs_extraction.push(name),
            NodeState::NeedsLoad => classification.needs_load.push(name),
            NodeState::Ready => classification.ready.push(name),
        }
    }
    classification
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub classification: Classification,
    /// Objects to create when absent, in order.
    pub ensure: Vec<ManagedObject>,
    /// Objects to delete when present, in order.
    pub remove: Vec<ObjectKey>,
    pub request: Option<DesiredUpdate>,
}

/// Decide what one reconcile pass does for a target that carries a bundle file.
pub fn plan(settings: &ControllerSettings, bundle_file: &Path, nodes: &[Node]) -> Result<Plan> {
    let classification = classify(nodes);

    let (mut ensure, remove) = if classification.needs_extraction.is_empty() {
        (Vec::new(), bundle_server_keys())
    } else {
        (bundle_server_objects(settings, bundle_file), Vec::new())
    };

    ensure.extend(
        classification
            .needs_extraction
            .iter()
            .map(|node| ManagedObject::Job(manifests::extract_job(settings, node, bundle_file))),
    );
    ensure.extend(
        classification
            .needs_load
            .iter()
            .map(|node| ManagedObject::Job(manifests::load_job(settings, node))),
    );

    let request = if classification.all_ready() {
        Some(release_update(nodes)?)
    } else {
        None
    };

    Ok(Plan {
        classification,
        ensure,
        remove,
        request,
    })
}

/// Upgrade request built from the metadata of the first node that recorded one.
fn release_update(nodes: &[Node]) -> Result<DesiredUpdate> {
    let metadata = nodes
        .iter()
        .find_map(recorded_metadata)
        .ok_or(KbuError::MissingMetadata)??;
    if metadata.release.is_empty() {
        return Err(KbuError::Metadata(
            "recorded metadata has an empty release".to_string(),
        ));
    }
    Ok(DesiredUpdate::release(metadata.release))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::k8s::node::test_node;
    use crate::k8s::store::ObjectKind;
    use crate::labels::{BUNDLE_METADATA_ANNOTATION, EXTRACTED_LABEL, LOADED_LABEL};

    const METADATA: &str =
        r#"{"version":"4.16.3","architecture":"x86_64","release":"quay.io/r@sha256:aa"}"#;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            namespace: "kbu".to_string(),
            image: "registry.local/kbu:0.1.0".to_string(),
            target_name: "version".to_string(),
            agent_service_account: "kbu-agent".to_string(),
            extract_dir: PathBuf::from("/var/lib/kbu/bundle"),
            bundle_server_port: 8090,
            runtime_unit: "crio.service".to_string(),
        }
    }

    fn ready(name: &str) -> Node {
        test_node(
            name,
            &[(EXTRACTED_LABEL, "true"), (LOADED_LABEL, "true")],
            &[(BUNDLE_METADATA_ANNOTATION, METADATA)],
        )
    }

    fn job_names(plan: &Plan) -> Vec<String> {
        plan.ensure
            .iter()
            .map(ManagedObject::key)
            .filter(|k| k.kind == ObjectKind::Job)
            .map(|k| k.name)
            .collect()
    }

    #[test]
    fn test_classify() {
        let nodes = vec![
            test_node("a", &[], &[]),
            test_node("b", &[(EXTRACTED_LABEL, "true")], &[]),
            ready("c"),
            test_node("d", &[(LOADED_LABEL, "true")], &[]),
        ];
        let c = classify(&nodes);
        assert_eq!(c.needs_extraction, vec!["a", "d"]);
        assert_eq!(c.needs_load, vec!["b"]);
        assert_eq!(c.ready, vec!["c"]);
        assert!(!c.all_ready());
    }

    #[test]
    fn test_no_nodes_is_not_ready() {
        assert!(!classify(&[]).all_ready());
    }

    #[test]
    fn test_plan_fresh_nodes_get_server_and_extract_jobs() {
        let nodes = vec![test_node("a", &[], &[]), test_node("b", &[], &[])];
        let plan = plan(&settings(), Path::new("/root/bundle.tar"), &nodes).unwrap();

        assert_eq!(plan.ensure.len(), 7);
        assert_eq!(plan.ensure[0].key().kind, ObjectKind::ServiceAccount);
        assert_eq!(job_names(&plan), vec!["kbu-extract-a", "kbu-extract-b"]);
        assert!(plan.remove.is_empty());
        assert!(plan.request.is_none());
    }

    #[test]
    fn test_plan_extracted_nodes_tear_down_server() {
        let nodes = vec![
            test_node("a", &[(EXTRACTED_LABEL, "true")], &[]),
            ready("b"),
        ];
        let plan = plan(&settings(), Path::new("/root/bundle.tar"), &nodes).unwrap();

        assert_eq!(job_names(&plan), vec!["kbu-load-a"]);
        assert_eq!(plan.ensure.len(), 1);
        assert_eq!(plan.remove, bundle_server_keys());
        assert!(plan.request.is_none());
    }

    #[test]
    fn test_plan_all_ready_requests_upgrade() {
        let nodes = vec![ready("a"), ready("b")];
        let plan = plan(&settings(), Path::new("/root/bundle.tar"), &nodes).unwrap();

        assert!(plan.ensure.is_empty());
        assert_eq!(
            plan.request,
            Some(DesiredUpdate::release("quay.io/r@sha256:aa"))
        );
    }

    #[test]
    fn test_plan_uses_first_node_with_metadata() {
        let without = test_node(
            "a",
            &[(EXTRACTED_LABEL, "true"), (LOADED_LABEL, "true")],
            &[],
        );
        let other = test_node(
            "b",
            &[(EXTRACTED_LABEL, "true"), (LOADED_LABEL, "true")],
            &[(
                BUNDLE_METADATA_ANNOTATION,
                r#"{"version":"4.16.4","architecture":"x86_64","release":"quay.io/r@sha256:bb"}"#,
            )],
        );
        let nodes = vec![without, other, ready("c")];
        let plan = plan(&settings(), Path::new("/root/bundle.tar"), &nodes).unwrap();
        assert_eq!(plan.request.unwrap().image, "quay.io/r@sha256:bb");
    }

    #[test]
    fn test_plan_all_ready_without_metadata_fails() {
        let nodes = vec![test_node(
            "a",
            &[(EXTRACTED_LABEL, "true"), (LOADED_LABEL, "true")],
            &[],
        )];
        let err = plan(&settings(), Path::new("/root/bundle.tar"), &nodes).unwrap_err();
        assert!(matches!(err, KbuError::MissingMetadata));
    }

    #[test]
    fn test_plan_all_ready_with_garbage_metadata_fails() {
        let nodes = vec![test_node(
            "a",
            &[(EXTRACTED_LABEL, "true"), (LOADED_LABEL, "true")],
            &[(BUNDLE_METADATA_ANNOTATION, "{not json")],
        )];
        let err = plan(&settings(), Path::new("/root/bundle.tar"), &nodes).unwrap_err();
        assert!(matches!(err, KbuError::Metadata(_)));
    }
}
