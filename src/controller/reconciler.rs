//! One reconcile pass against a [`ClusterStore`].

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::controller::ControllerSettings;
use crate::controller::plan::{self, Classification};
use crate::error::Result;
use crate::k8s::store::{Applied, ClusterStore};

/// What a reconcile pass ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The target already carries an upgrade request; nothing was touched.
    UpgradeAlreadyRequested,
    /// The target does not name a bundle file.
    NoBundle,
    /// Jobs and infrastructure were ensured; some nodes are not ready yet.
    Progressing(Classification),
    /// Every node was ready and the upgrade has been requested.
    UpgradeRequested { release: String },
}

impl Outcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UpgradeAlreadyRequested => "already_requested",
            Self::NoBundle => "no_bundle",
            Self::Progressing(_) => "progressing",
            Self::UpgradeRequested { .. } => "upgrade_requested",
        }
    }
}

pub struct Reconciler<S> {
    store: Arc<S>,
    settings: ControllerSettings,
}

impl<S: ClusterStore> Reconciler<S> {
    pub fn new(store: Arc<S>, settings: ControllerSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub async fn reconcile(&self) -> Result<Outcome> {
        let target = self.store.get_upgrade_target().await?;
        if target.upgrade_requested() {
            debug!(target = %target.name, "Upgrade already requested, nothing to do");
            return Ok(Outcome::UpgradeAlreadyRequested);
        }
        let Some(bundle_file) = target.bundle_file.as_deref() else {
            debug!(target = %target.name, "No bundle file annotation, nothing to do");
            return Ok(Outcome::NoBundle);
        };

        let nodes = self.store.list_nodes().await?;
        let plan = plan::plan(&self.settings, Path::new(bundle_file), &nodes)?;
        info!(
            needs_extraction = plan.classification.needs_extraction.len(),
            needs_load = plan.classification.needs_load.len(),
            ready = plan.classification.ready.len(),
            "Classified nodes"
        );

        for object in &plan.ensure {
            match self.store.create(object).await? {
                Applied::Created => info!(object = %object.key(), "Created"),
                _ => debug!(object = %object.key(), "Already exists"),
            }
        }
        for key in &plan.remove {
            if self.store.delete(key).await? == Applied::Deleted {
                info!(object = %key, "Deleted");
            }
        }

        match plan.request {
            Some(update) => {
                self.store.request_upgrade(&update).await?;
                info!(release = %update.image, "All nodes ready, requested cluster upgrade");
                Ok(Outcome::UpgradeRequested {
                    release: update.image,
                })
            }
            None => Ok(Outcome::Progressing(plan.classification)),
        }
    }
}
