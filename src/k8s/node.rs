//! Node progress labels and annotations.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use serde_json::json;

use crate::error::Result;
use crate::labels::{
    BUNDLE_METADATA_ANNOTATION, EXTRACTED_LABEL, LOADED_LABEL, PROGRESS_ANNOTATION, TRUE,
};
use crate::metadata::Metadata;

/// Where a node is in the bundle rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    NeedsExtraction,
    NeedsLoad,
    Ready,
}

impl NodeState {
    pub fn of(node: &Node) -> Self {
        match (label_is_true(node, EXTRACTED_LABEL), label_is_true(node, LOADED_LABEL)) {
            (false, _) => Self::NeedsExtraction,
            (true, false) => Self::NeedsLoad,
            (true, true) => Self::Ready,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NeedsExtraction => "needs-extraction",
            Self::NeedsLoad => "needs-load",
            Self::Ready => "ready",
        }
    }
}

pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

pub fn label_is_true(node: &Node, key: &str) -> bool {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .is_some_and(|value| value == TRUE)
}

pub fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Metadata an extraction agent recorded on the node, if any.
pub fn recorded_metadata(node: &Node) -> Option<Result<Metadata>> {
    annotation(node, BUNDLE_METADATA_ANNOTATION).map(Metadata::from_json)
}

/// Labels and annotations to merge into a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePatch {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl NodePatch {
    pub fn progress(message: impl Into<String>) -> Self {
        Self::default().annotation(PROGRESS_ANNOTATION, message)
    }

    #[must_use]
    pub fn label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn annotation(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }

    /// JSON merge patch body touching only the listed keys.
    pub fn to_merge_patch(&self) -> serde_json::Value {
        let mut metadata = serde_json::Map::new();
        if !self.labels.is_empty() {
            metadata.insert("labels".to_string(), json!(self.labels));
        }
        if !self.annotations.is_empty() {
            metadata.insert("annotations".to_string(), json!(self.annotations));
        }
        json!({ "metadata": metadata })
    }

    /// Apply the patch to an in-memory node.
    pub fn apply_to(&self, node: &mut Node) {
        if !self.labels.is_empty() {
            node.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(self.labels.clone());
        }
        if !self.annotations.is_empty() {
            node.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .extend(self.annotations.clone());
        }
    }
}

#[cfg(test)]
pub fn test_node(name: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Node {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    let to_map = |pairs: &[(&str, &str)]| {
        (!pairs.is_empty()).then(|| {
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>()
        })
    };
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: to_map(labels),
            annotations: to_map(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_classification() {
        let fresh = test_node("a", &[], &[]);
        let extracted = test_node("b", &[(EXTRACTED_LABEL, "true")], &[]);
        let ready = test_node(
            "c",
            &[(EXTRACTED_LABEL, "true"), (LOADED_LABEL, "true")],
            &[],
        );
        assert_eq!(NodeState::of(&fresh), NodeState::NeedsExtraction);
        assert_eq!(NodeState::of(&extracted), NodeState::NeedsLoad);
        assert_eq!(NodeState::of(&ready), NodeState::Ready);
    }

    #[test]
    fn test_loaded_without_extracted_needs_extraction() {
        let node = test_node("a", &[(LOADED_LABEL, "true")], &[]);
        assert_eq!(NodeState::of(&node), NodeState::NeedsExtraction);
    }

    #[test]
    fn test_non_true_label_values_are_false() {
        let node = test_node("a", &[(EXTRACTED_LABEL, "True")], &[]);
        assert!(!label_is_true(&node, EXTRACTED_LABEL));
        let node = test_node("a", &[(EXTRACTED_LABEL, "false")], &[]);
        assert!(!label_is_true(&node, EXTRACTED_LABEL));
    }

    #[test]
    fn test_merge_patch_body() {
        let patch = NodePatch::progress("Extracting bundle").label(EXTRACTED_LABEL, TRUE);
        assert_eq!(
            patch.to_merge_patch(),
            json!({
                "metadata": {
                    "labels": { "kbu.io/extracted": "true" },
                    "annotations": { "kbu.io/progress": "Extracting bundle" }
                }
            })
        );
    }

    #[test]
    fn test_apply_to_keeps_existing_labels() {
        let mut node = test_node("a", &[("kubernetes.io/os", "linux")], &[]);
        NodePatch::default()
            .label(LOADED_LABEL, TRUE)
            .apply_to(&mut node);
        let labels = node.metadata.labels.unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get(LOADED_LABEL).map(String::as_str), Some("true"));
    }

    #[test]
    fn test_recorded_metadata() {
        let node = test_node(
            "a",
            &[],
            &[(
                BUNDLE_METADATA_ANNOTATION,
                r#"{"version":"4.16.3","architecture":"x86_64","release":"quay.io/r@sha256:1"}"#,
            )],
        );
        let metadata = recorded_metadata(&node).unwrap().unwrap();
        assert_eq!(metadata.release, "quay.io/r@sha256:1");
        assert!(recorded_metadata(&test_node("b", &[], &[])).is_none());
    }
}
