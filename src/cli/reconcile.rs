use anyhow::Result;

use agentbox::{Config, SandboxOrchestrator};

pub async fn run() -> Result<()> {
    let config = Config::load()?;
    let _lock = super::maintenance_lock(&config).await?;
    let orchestrator = SandboxOrchestrator::from_config(&config)?;

    let report = orchestrator.reconcile().await;

    for name in &report.removed_orphans {
        println!("removed orphan  {}", name);
    }
    for name in &report.removed_legacy {
        println!("removed legacy  {}", name);
    }
    println!(
        "{} removed, {} kept",
        report.removed(),
        report.kept.len()
    );
    Ok(())
}
