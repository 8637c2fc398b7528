// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dr_syncer::agent::AgentDaemon;
use dr_syncer::config::AgentConfig;
use dr_syncer::shutdown::wait_for_signal;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AgentConfig::from_env()?;
    info!(
        "Agent configuration loaded: node={}, port={}, leader_election={}",
        config.node_name, config.ssh_port, config.leader_election
    );

    let client = Client::try_default().await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    AgentDaemon::new(client, config).run(shutdown).await?;
    info!("dr-syncer agent stopped");
    Ok(())
}
