use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::{
    file::map_file,
    map::{MapOptions, DEFAULT_DISAMBIGUATE_PREFIXES},
};

/// Canonical prefix that stands in for one or more raw prefixes.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AliasConfig {
    pub target: String,
    pub prefixes: Vec<String>,
}

/// YAML configuration for map parsing.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub aliases: Vec<AliasConfig>,
    pub disambiguate_prefixes: Vec<String>,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            aliases: vec![],
            disambiguate_prefixes: DEFAULT_DISAMBIGUATE_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl MapConfig {
    pub fn to_options(&self) -> MapOptions {
        let mut options = MapOptions {
            disambiguate_prefixes: self.disambiguate_prefixes.clone(),
            ..Default::default()
        };
        for alias in &self.aliases {
            for prefix in &alias.prefixes {
                // Collisions are logged; the first registration is kept.
                options.aliases.register(&alias.target, prefix);
            }
        }
        options
    }
}

pub fn parse_config(config_str: &str) -> Result<MapConfig> { Ok(serde_yaml::from_str(config_str)?) }

pub fn read_config<P: AsRef<Path>>(path: P) -> Result<MapConfig> {
    let path = path.as_ref();
    let file = map_file(path)?;
    let config: MapConfig = serde_yaml::from_slice(file.as_slice())
        .with_context(|| format!("Failed to parse config '{}'", path.display()))?;
    tracing::debug!(
        "Loaded config '{}': {} aliases, {} disambiguation prefixes",
        path.display(),
        config.aliases.len(),
        config.disambiguate_prefixes.len()
    );
    Ok(config)
}

/// Options from the config at `path`, or the defaults without one.
pub fn load_options(path: Option<&Path>) -> Result<MapOptions> {
    match path {
        Some(path) => Ok(read_config(path)?.to_options()),
        None => Ok(MapOptions::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() -> Result<()> {
        let config = parse_config(
            r#"
aliases:
  - target: ".text."
    prefixes: ["text_", "code_"]
  - target: ".data."
    prefixes: ["text_"]
disambiguate_prefixes: [".bss.COMMON"]
"#,
        )?;
        assert_eq!(config.aliases.len(), 2);
        assert_eq!(config.disambiguate_prefixes, [".bss.COMMON"]);

        let options = config.to_options();
        assert_eq!(options.aliases.len(), 2);
        assert_eq!(options.aliases.encode("text_main"), ".text.text_main");
        assert_eq!(options.aliases.encode("code_isr"), ".text.code_isr");
        assert_eq!(options.disambiguate_prefixes, [".bss.COMMON"]);
        Ok(())
    }

    #[test]
    fn test_defaults() -> Result<()> {
        let config = parse_config("aliases: []\n")?;
        assert_eq!(config, MapConfig::default());
        let options = config.to_options();
        assert!(options.aliases.is_empty());
        assert_eq!(options.disambiguate_prefixes, DEFAULT_DISAMBIGUATE_PREFIXES);
        assert_eq!(load_options(None)?.disambiguate_prefixes, DEFAULT_DISAMBIGUATE_PREFIXES);
        Ok(())
    }

    #[test]
    fn test_unknown_shape_is_an_error() {
        assert!(parse_config("aliases: 3\n").is_err());
    }
}
