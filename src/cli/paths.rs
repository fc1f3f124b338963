//! CLI subcommand: `warden paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use crate::config::Config;
use crate::paths::Paths;

pub fn run(config: &Config) -> Result<()> {
    let paths = Paths::resolve()?;

    println!("warden Paths (XDG Base Directory)");
    println!("=================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  workspace:      {}", config.workspace()?.display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  audit log:      {}", config.audit_path()?.display());

    Ok(())
}
