use std::{any::type_name, fs, path::Path};

use pgrollback_core::{
    config::ProxyConfig,
    err::{Context, Result},
};
use pgrollback_logging::{debug, info};
use serde::Deserialize;
use serde_yaml::Deserializer;

use crate::env::apply_overrides;

/// Parses and loads the configuration
pub struct ConfigLoader {}

impl ConfigLoader {
    /// Initialises the configuration loader
    pub fn new() -> Self {
        Self {}
    }

    /// Loads the proxy configuration from the supplied file, then applies
    /// the PGROLLBACK_* environment overrides.
    ///
    /// The file may be absent entirely when the environment supplies every
    /// required setting.
    pub fn load(&self, path: Option<&Path>) -> Result<ProxyConfig> {
        let mut config = match path {
            Some(path) => {
                let path = path
                    .canonicalize()
                    .context("Failed to get full config path")?;
                info!("Loading config from path {}", path.display());
                self.load_yaml(path.as_path())?
            }
            None => {
                info!("No config file supplied, loading from environment");
                serde_yaml::Value::Null
            }
        };

        apply_overrides(&mut config, |var| std::env::var(var).ok())?;

        debug!("Parsing into {}", type_name::<ProxyConfig>());
        let config: ProxyConfig =
            serde_yaml::from_value(config).context("Failed to parse yaml into ProxyConfig")?;

        Ok(config)
    }

    fn load_yaml(&self, path: &Path) -> Result<serde_yaml::Value> {
        let file_data = fs::read(path).with_context(|| {
            format!("Failed to read config from file {}", path.display())
        })?;

        let config = serde_yaml::Value::deserialize(Deserializer::from_slice(&file_data))
            .context("Failed to parse yaml")?;

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
