//! kbu - disconnected cluster upgrades from pre-built image bundles.
//!
//! A controller tracks per-node progress through node labels, runs an
//! extraction job and then a loading job on every node, and requests the
//! cluster upgrade once every node has the bundle's images in its container
//! runtime.

pub mod agent;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod health;
pub mod k8s;
pub mod labels;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod transfer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");
