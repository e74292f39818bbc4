//! Configuration loading

use std::path::Path;

use anyhow::{Context, Result};
use rollup_common::config::Config;

/// Load configuration from file, falling back to defaults when it is absent
pub async fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))
    } else {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }
}
