//! Label, annotation and object name constants shared by the controller and agents.

// Node labels
pub const EXTRACTED_LABEL: &str = "kbu.io/extracted";
pub const LOADED_LABEL: &str = "kbu.io/loaded";

// Node annotations
pub const BUNDLE_METADATA_ANNOTATION: &str = "kbu.io/bundle-metadata";
pub const PROGRESS_ANNOTATION: &str = "kbu.io/progress";

// ClusterVersion annotations
pub const BUNDLE_FILE_ANNOTATION: &str = "kbu.io/bundle-file";

// Managed object labels
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const NODE_LABEL: &str = "kbu.io/node";
pub const NODE_ANNOTATION: &str = "kbu.io/node-name";
pub const MANAGER: &str = "kbu";

/// Name shared by every object of the bundle transfer endpoint.
pub const BUNDLE_SERVER_NAME: &str = "kbu-bundle-server";
pub const EXTRACT_JOB_PREFIX: &str = "kbu-extract";
pub const LOAD_JOB_PREFIX: &str = "kbu-load";

/// Value written to a boolean label when set.
pub const TRUE: &str = "true";
