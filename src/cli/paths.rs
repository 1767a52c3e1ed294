//! CLI subcommand: `agentbox paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use agentbox::Config;

pub fn run() -> Result<()> {
    // Load config so a [storage] data_dir override is reflected
    let config = Config::load()?;
    let paths = &config.paths;

    println!("agentbox Paths (XDG Base Directory)");
    println!("===================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data root:  {}", paths.data_dir.display());
    println!("  environments:   {}", paths.envs_dir().display());
    println!("  shared (ro):    {}", paths.shared_data_dir().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  env records:    {}", paths.env_store().display());
    println!("  logs:           {}", paths.logs_dir().display());
    println!();
    println!("Cache:      {}", paths.cache_dir.display());
    println!();
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available)"),
    }
    println!("  maintenance lock: {}", paths.maintenance_lock().display());

    Ok(())
}
