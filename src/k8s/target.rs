//! The cluster-wide upgrade target (an OpenShift `ClusterVersion`).

use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

use crate::labels::BUNDLE_FILE_ANNOTATION;

pub fn cluster_version_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterVersion");
    ApiResource::from_gvk_with_plural(&gvk, "clusterversions")
}

/// `spec.desiredUpdate` of the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredUpdate {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub force: bool,
}

impl DesiredUpdate {
    /// Release image update, forced because the image cannot be verified offline.
    pub fn release(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            version: String::new(),
            force: true,
        }
    }

    pub fn is_requested(&self) -> bool {
        !self.image.is_empty() || !self.version.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeTarget {
    pub name: String,
    /// Host path of the bundle file, when an upgrade is wanted.
    pub bundle_file: Option<String>,
    pub desired_update: Option<DesiredUpdate>,
    /// `spec.desiredUpdate` carries values that do not parse as a [`DesiredUpdate`].
    pub unrecognized_update: bool,
}

impl UpgradeTarget {
    pub fn from_dynamic(obj: &DynamicObject) -> Self {
        let bundle_file = obj
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(BUNDLE_FILE_ANNOTATION))
            .filter(|path| !path.is_empty())
            .cloned();
        let raw = obj.data.get("spec").and_then(|spec| spec.get("desiredUpdate"));
        let desired_update = raw.and_then(|du| serde_json::from_value(du.clone()).ok());
        let unrecognized_update = desired_update.is_none() && raw.is_some_and(has_content);

        Self {
            name: obj.metadata.name.clone().unwrap_or_default(),
            bundle_file,
            desired_update,
            unrecognized_update,
        }
    }

    /// Someone asked for an update, including ones this controller cannot parse.
    pub fn upgrade_requested(&self) -> bool {
        self.unrecognized_update
            || self
                .desired_update
                .as_ref()
                .is_some_and(DesiredUpdate::is_requested)
    }
}

fn has_content(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(items) => items.iter().any(has_content),
        serde_json::Value::Object(fields) => fields.values().any(has_content),
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) => true,
    }
}
