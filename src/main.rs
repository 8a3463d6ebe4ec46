use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kbu::agent::extract::{ExtractAgent, ExtractOutcome};
use kbu::agent::load::LoadAgent;
use kbu::config::{Cli, Command};
use kbu::k8s::KubeNodeStore;
use kbu::runtime::RuntimeControl;
use kbu::{BUILD_DATE, COMMIT, VERSION, controller, logging, transfer};

#[tokio::main]
async fn main() {
    let cli = Cli::from_args();
    if let Command::Version = cli.command {
        println!("kbu {VERSION} (commit: {COMMIT}, build: {BUILD_DATE})");
        return;
    }

    logging::init(&cli.log_format, &cli.log_level);
    info!(
        version = VERSION,
        commit = COMMIT,
        build_date = BUILD_DATE,
        "Starting kbu"
    );

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    if let Err(e) = run(cli.command, shutdown_token()).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command, shutdown: CancellationToken) -> Result<()> {
    match command {
        Command::Controller(args) => {
            let (health_port, metrics_port) = (args.health_port, args.metrics_port);
            let settings = args.validate()?;
            controller::run(settings, health_port, metrics_port).await
        }
        Command::Extract(args) => {
            let config = args.validate()?;
            let node = config.node_name.clone();
            let store = Arc::new(KubeNodeStore::new(kube_client().await?));
            let agent = ExtractAgent::new(config, store)?;
            match agent
                .run(&shutdown)
                .await
                .with_context(|| format!("Bundle extraction failed on node {node}"))?
            {
                ExtractOutcome::AlreadyExtracted => info!(%node, "Nothing to extract"),
                ExtractOutcome::Extracted(metadata) => {
                    info!(%node, version = %metadata.version, "Extraction complete");
                }
            }
            Ok(())
        }
        Command::Load(args) => {
            let config = args.validate()?;
            let node = config.node_name.clone();
            let store = Arc::new(KubeNodeStore::new(kube_client().await?));
            let runtime = RuntimeControl::host(&config.host_root, &config.runtime_unit);
            let loaded = LoadAgent::new(config, store, runtime)
                .run(&shutdown)
                .await
                .with_context(|| format!("Bundle loading failed on node {node}"))?;
            info!(%node, images = loaded, "Loading complete");
            Ok(())
        }
        Command::ServeBundle(args) => {
            let port = args.port;
            let bundle_file = args.validate()?;
            transfer::serve(port, bundle_file, shutdown).await
        }
        Command::Version => Ok(()),
    }
}

async fn kube_client() -> Result<kube::Client> {
    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes API server");
    Ok(client)
}

/// Token cancelled on the first SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received SIGINT/SIGTERM, initiating graceful shutdown");
        trigger.cancel();
    });
    token
}

async fn wait_for_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
