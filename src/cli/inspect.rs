use anyhow::{Context, Result, bail};
use clap::Args;

use agentbox::{Config, SandboxOrchestrator};

#[derive(Args)]
pub struct InspectArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: InspectArgs) -> Result<()> {
    let config = Config::load()?;
    let orchestrator = SandboxOrchestrator::from_config(&config)?;
    let report = match orchestrator.inspect().await {
        Ok(report) => report,
        Err(e) if e.is_unavailable() => bail!("Sandboxing unavailable: {}", e),
        Err(e) => return Err(e).context("Failed to inspect sandbox resources"),
    };

    if args.json {
        let volumes: Vec<_> = report
            .volumes
            .iter()
            .map(|v| {
                serde_json::json!({
                    "ecosystem": v.ecosystem.as_str(),
                    "volume": v.volume,
                    "bytes": v.bytes,
                })
            })
            .collect();
        let out = serde_json::json!({
            "engine_version": report.engine_version,
            "volumes": volumes,
            "live_containers": report.live_containers,
            "total_containers": report.total_containers,
            "warnings": report.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Engine: {}", report.engine_version);
    println!("Cache volumes:");
    for v in &report.volumes {
        println!("  {:<28} {:>10}", v.volume, human_bytes(v.bytes));
    }
    println!();
    println!(
        "Containers: {} running ({} total)",
        report.live_containers, report.total_containers
    );
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    Ok(())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
