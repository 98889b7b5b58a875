use indexmap::{map::Entry, IndexMap};

use crate::mem::MapWarning;

/// Prefix rewrite table. A name starting with a registered alias prefix gets
/// the alias target prepended, letting one canonical prefix stand in for the
/// raw spellings a toolchain emits.
#[derive(Debug, Clone, Default)]
pub struct LinkAliases {
    aliases: IndexMap<String, String>,
}

impl LinkAliases {
    pub fn new() -> Self { Self::default() }

    /// Registers `alias` for `target`. The first registration of an alias
    /// wins; a later one with a different target is reported.
    pub fn register(&mut self, target: &str, alias: &str) -> Option<MapWarning> {
        match self.aliases.entry(alias.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get() == target {
                    return None;
                }
                let warning = MapWarning::AliasCollision {
                    alias: alias.to_string(),
                    existing: entry.get().clone(),
                    target: target.to_string(),
                };
                warning.emit();
                Some(warning)
            }
            Entry::Vacant(entry) => {
                entry.insert(target.to_string());
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool { self.aliases.is_empty() }

    pub fn len(&self) -> usize { self.aliases.len() }

    pub fn encode(&self, name: &str) -> String {
        for (alias, target) in &self.aliases {
            if name.starts_with(alias.as_str()) {
                return format!("{}{}", target, name);
            }
        }
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let mut aliases = LinkAliases::new();
        assert_eq!(aliases.encode("text_main"), "text_main");
        assert!(aliases.register(".", "text_").is_none());
        assert!(aliases.register(".", "text_").is_none());
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases.encode("text_main"), ".text_main");
        assert_eq!(aliases.encode(".data.x"), ".data.x");
    }

    #[test]
    fn test_collision_keeps_first() {
        let mut aliases = LinkAliases::new();
        aliases.register(".flash", "rom");
        let warning = aliases.register(".ram", "rom");
        assert_eq!(
            warning,
            Some(MapWarning::AliasCollision {
                alias: "rom".to_string(),
                existing: ".flash".to_string(),
                target: ".ram".to_string(),
            })
        );
        assert_eq!(aliases.encode("rom_table"), ".flashrom_table");
    }

    #[test]
    fn test_first_registered_prefix_wins() {
        let mut aliases = LinkAliases::new();
        aliases.register(".a", "x");
        aliases.register(".b", "xy");
        assert_eq!(aliases.encode("xyz"), ".axyz");
    }
}
