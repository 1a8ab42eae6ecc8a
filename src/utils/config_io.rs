use anyhow::Context;
use config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Loads `T` from a config file; the format follows the extension
/// (toml, json, yaml, ...).
pub fn load_cfg<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    load_cfg_with_env(path, None)
}

/// Like [`load_cfg`], with `PREFIX__FIELD` environment variables overriding
/// values from the file.
pub fn load_cfg_with_env<T: DeserializeOwned>(
    path: impl AsRef<Path>,
    env_prefix: Option<&str>,
) -> anyhow::Result<T> {
    let path = path.as_ref();
    let mut builder = Config::builder().add_source(File::from(path));
    if let Some(prefix) = env_prefix {
        builder = builder.add_source(Environment::with_prefix(prefix).separator("__"));
    }
    let cfg = builder
        .build()
        .with_context(|| format!("failed to read config from {}", path.display()))?;

    cfg.try_deserialize()
        .with_context(|| format!("failed to deserialize config from {}", path.display()))
}
