use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use meshboot_api::HttpClientProvider;
use meshboot_cache::SecretStore;
use meshboot_core::{BootstrapConfig, Topology};
use meshboot_orchestrator::Orchestrator;
use tracing::info;

pub async fn run(
    topology_path: &Path,
    config_path: Option<&Path>,
    cache_path: &Path,
    primary_only: bool,
    request_timeout: u64,
) -> anyhow::Result<()> {
    let topology = Topology::from_file(topology_path)
        .with_context(|| format!("loading topology {}", topology_path.display()))?;
    let config = match config_path {
        Some(path) => BootstrapConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BootstrapConfig::default(),
    };
    let cache = SecretStore::open(cache_path)
        .with_context(|| format!("opening cache {}", cache_path.display()))?;
    info!(
        clusters = topology.clusters.len(),
        nodes = topology.nodes.len(),
        cache = %cache_path.display(),
        "inputs loaded"
    );

    let provider = HttpClientProvider::new().with_timeout(Duration::from_secs(request_timeout));
    let mut orchestrator = Orchestrator::new(
        Arc::new(topology),
        config,
        Arc::new(provider),
        Arc::new(cache),
    );
    orchestrator.run_bootstrap(primary_only).await?;

    println!("✓ mesh bootstrapped ({} credentials issued)", orchestrator.registry().len());
    Ok(())
}
