pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::Config;

pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("read config {}", path))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = serde_yml::from_str(content)?;
    config.validate()?;
    Ok(config)
}
