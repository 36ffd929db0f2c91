//! Configuration commands

use std::path::Path;

use anyhow::{Context, Result, bail};
use cmdpipe::Config;

/// Print the effective configuration as TOML
pub fn cmd_config_show(explicit: Option<&Path>) -> Result<()> {
  let config = Config::load(explicit)?;

  match (explicit, Config::user_config_path()) {
    (Some(path), _) => println!("Using config: {:?}", path),
    (None, Some(user_path)) if user_path.exists() => println!("Using user config: {:?}", user_path),
    _ => println!("Using default configuration (no config file found)"),
  }
  println!();

  let toml_str = toml::to_string_pretty(&config)?;
  println!("{}", toml_str);

  Ok(())
}

/// Write the config template to the user config path
pub fn cmd_config_init(force: bool) -> Result<()> {
  let Some(config_path) = Config::user_config_path() else {
    bail!("Could not determine user config path");
  };

  if config_path.exists() && !force {
    bail!("Config file already exists: {:?} (use --force to overwrite)", config_path);
  }

  if let Some(parent) = config_path.parent() {
    std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
  }
  std::fs::write(&config_path, Config::generate_template())
    .with_context(|| format!("Failed to write {:?}", config_path))?;

  println!("Created config: {:?}", config_path);
  Ok(())
}
