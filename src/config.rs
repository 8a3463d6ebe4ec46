use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::agent::extract::ExtractConfig;
use crate::agent::load::LoadConfig;
use crate::controller::ControllerSettings;
use crate::error::{KbuError, Result};

// ============================================
// Environment variable name constants
// ============================================
pub mod env {
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const NAMESPACE: &str = "KBU_NAMESPACE";
    pub const IMAGE: &str = "KBU_IMAGE";
    pub const TARGET_NAME: &str = "KBU_TARGET_NAME";
    pub const AGENT_SERVICE_ACCOUNT: &str = "KBU_AGENT_SERVICE_ACCOUNT";
    pub const EXTRACT_DIR: &str = "KBU_EXTRACT_DIR";
    pub const BUNDLE_SERVER_PORT: &str = "KBU_BUNDLE_SERVER_PORT";
    pub const RUNTIME_UNIT: &str = "KBU_RUNTIME_UNIT";
    pub const HEALTH_PORT: &str = "HEALTH_PORT";
    pub const METRICS_PORT: &str = "METRICS_PORT";
    pub const NODE_NAME: &str = "NODE_NAME";
    pub const BUNDLE_FILE: &str = "KBU_BUNDLE_FILE";
    pub const PEER_ADDRESS: &str = "KBU_PEER_ADDRESS";
    pub const RETRY_INTERVAL_SECS: &str = "KBU_RETRY_INTERVAL_SECS";
    pub const HOST_ROOT: &str = "KBU_HOST_ROOT";
    pub const LISTEN_ADDR: &str = "KBU_LISTEN_ADDR";
    pub const PORT: &str = "KBU_PORT";
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kbu",
    version,
    about = "Disconnected cluster upgrades from pre-built image bundles",
    long_about = "Distributes an image bundle to every node of a network-isolated cluster, loads its images into the container runtime and requests the cluster upgrade once all nodes are ready."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log format: json or pretty
    #[arg(long, global = true, env = env::LOG_FORMAT, default_value = "json")]
    pub log_format: String,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, global = true, env = env::LOG_LEVEL, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn from_args() -> Self {
        Self::parse()
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Reconcile nodes and request the upgrade once every node is ready
    Controller(ControllerArgs),
    /// Download and extract the bundle on this node
    Extract(ExtractArgs),
    /// Load the extracted bundle images into the container runtime
    Load(LoadArgs),
    /// Serve the bundle file to peer nodes
    ServeBundle(ServeBundleArgs),
    /// Show version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Namespace for jobs and bundle server objects
    #[arg(long, env = env::NAMESPACE, default_value = "kbu")]
    pub namespace: String,

    /// Container image used by agent jobs and the bundle server
    #[arg(long, env = env::IMAGE)]
    pub image: Option<String>,

    /// Name of the ClusterVersion object to upgrade
    #[arg(long, env = env::TARGET_NAME, default_value = "version")]
    pub target_name: String,

    /// Service account agent jobs run as
    #[arg(long, env = env::AGENT_SERVICE_ACCOUNT, default_value = "kbu-agent")]
    pub agent_service_account: String,

    /// Host directory the bundle is extracted into
    #[arg(long, env = env::EXTRACT_DIR, default_value = "/var/lib/kbu/bundle")]
    pub extract_dir: PathBuf,

    /// Port of the bundle transfer endpoint
    #[arg(long, env = env::BUNDLE_SERVER_PORT, default_value = "8090")]
    pub bundle_server_port: u16,

    /// systemd unit of the container runtime
    #[arg(long, env = env::RUNTIME_UNIT, default_value = "crio.service")]
    pub runtime_unit: String,

    /// Health check server port
    #[arg(long, env = env::HEALTH_PORT, default_value = "8080")]
    pub health_port: u16,

    /// Metrics server port
    #[arg(long, env = env::METRICS_PORT, default_value = "8081")]
    pub metrics_port: u16,
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    /// Name of the node this agent runs for
    #[arg(long, env = env::NODE_NAME)]
    pub node_name: Option<String>,

    /// Local path of the bundle file
    #[arg(long, env = env::BUNDLE_FILE)]
    pub bundle_file: Option<PathBuf>,

    /// host:port of the bundle transfer service
    #[arg(long, env = env::PEER_ADDRESS)]
    pub peer_address: Option<String>,

    /// Directory the bundle is extracted into
    #[arg(long, env = env::EXTRACT_DIR)]
    pub extract_dir: Option<PathBuf>,

    /// Seconds to wait between bundle source checks
    #[arg(long, env = env::RETRY_INTERVAL_SECS, default_value = "10")]
    pub retry_interval_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Name of the node this agent runs for
    #[arg(long, env = env::NODE_NAME)]
    pub node_name: Option<String>,

    /// Directory holding the extracted bundle
    #[arg(long, env = env::EXTRACT_DIR)]
    pub extract_dir: Option<PathBuf>,

    /// Where the host root filesystem is mounted
    #[arg(long, env = env::HOST_ROOT, default_value = "/")]
    pub host_root: PathBuf,

    /// systemd unit of the container runtime
    #[arg(long, env = env::RUNTIME_UNIT, default_value = "crio.service")]
    pub runtime_unit: String,

    /// Listen address of the private registry
    #[arg(long, env = env::LISTEN_ADDR, default_value = "127.0.0.1:0")]
    pub listen_addr: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ServeBundleArgs {
    /// Bundle file to serve
    #[arg(long, env = env::BUNDLE_FILE)]
    pub bundle_file: Option<PathBuf>,

    /// Port to listen on
    #[arg(long, env = env::PORT, default_value = "8090")]
    pub port: u16,
}

fn require<T>(value: Option<T>, flag: &str, errors: &mut Vec<String>) -> Option<T> {
    if value.is_none() {
        errors.push(format!("--{flag} is required"));
    }
    value
}

fn require_absolute(path: Option<&PathBuf>, flag: &str, errors: &mut Vec<String>) {
    if let Some(path) = path
        && !path.is_absolute()
    {
        errors.push(format!("--{flag} must be an absolute path"));
    }
}

impl ControllerArgs {
    pub fn validate(self) -> Result<ControllerSettings> {
        let mut errors = Vec::new();
        let image = require(self.image.filter(|i| !i.is_empty()), "image", &mut errors);
        require_absolute(Some(&self.extract_dir), "extract-dir", &mut errors);
        if self.namespace.is_empty() {
            errors.push("--namespace must not be empty".to_string());
        }

        match image {
            Some(image) if errors.is_empty() => Ok(ControllerSettings {
                namespace: self.namespace,
                image,
                target_name: self.target_name,
                agent_service_account: self.agent_service_account,
                extract_dir: self.extract_dir,
                bundle_server_port: self.bundle_server_port,
                runtime_unit: self.runtime_unit,
            }),
            _ => Err(KbuError::Configuration(errors)),
        }
    }
}

impl ExtractArgs {
    pub fn validate(self) -> Result<ExtractConfig> {
        let mut errors = Vec::new();
        let node_name = require(self.node_name, "node-name", &mut errors);
        require_absolute(self.bundle_file.as_ref(), "bundle-file", &mut errors);
        let bundle_file = require(self.bundle_file, "bundle-file", &mut errors);
        let peer_address = require(self.peer_address, "peer-address", &mut errors);
        if let Some(addr) = &peer_address
            && !has_port(addr)
        {
            errors.push("--peer-address must be host:port".to_string());
        }
        require_absolute(self.extract_dir.as_ref(), "extract-dir", &mut errors);
        let extract_dir = require(self.extract_dir, "extract-dir", &mut errors);

        match (node_name, bundle_file, peer_address, extract_dir) {
            (Some(node_name), Some(bundle_file), Some(peer_address), Some(extract_dir))
                if errors.is_empty() =>
            {
                Ok(ExtractConfig {
                    node_name,
                    bundle_file,
                    peer_address,
                    extract_dir,
                    retry_interval: Duration::from_secs(self.retry_interval_secs),
                })
            }
            _ => Err(KbuError::Configuration(errors)),
        }
    }
}

impl LoadArgs {
    pub fn validate(self) -> Result<LoadConfig> {
        let mut errors = Vec::new();
        let node_name = require(self.node_name, "node-name", &mut errors);
        require_absolute(self.extract_dir.as_ref(), "extract-dir", &mut errors);
        let extract_dir = require(self.extract_dir, "extract-dir", &mut errors);
        require_absolute(Some(&self.host_root), "host-root", &mut errors);

        match (node_name, extract_dir) {
            (Some(node_name), Some(extract_dir)) if errors.is_empty() => Ok(LoadConfig {
                node_name,
                extract_dir,
                host_root: self.host_root,
                runtime_unit: self.runtime_unit,
                listen_addr: self.listen_addr,
            }),
            _ => Err(KbuError::Configuration(errors)),
        }
    }
}

impl ServeBundleArgs {
    pub fn validate(self) -> Result<PathBuf> {
        let mut errors = Vec::new();
        let bundle_file = require(self.bundle_file, "bundle-file", &mut errors);
        match bundle_file {
            Some(path) if errors.is_empty() => Ok(path),
            _ => Err(KbuError::Configuration(errors)),
        }
    }
}

fn has_port(addr: &str) -> bool {
    addr.rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}
