use crate::{catalog::ModConfiguration, selection::SelectionTable};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

pub const LIBRARY_FILE: &str = "library.json";

/// Everything the user curated: configurations (with their scan results and
/// source choices) and the selection table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Library {
    #[serde(default)]
    pub configurations: Vec<ModConfiguration>,
    #[serde(default)]
    pub selections: SelectionTable,
}

impl Library {
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let library_path = data_dir.join(LIBRARY_FILE);
        if library_path.exists() {
            let raw = fs::read_to_string(&library_path).context("read library.json")?;
            let mut library: Library = serde_json::from_str(&raw).context("parse library.json")?;
            library.normalize();
            return Ok(library);
        }

        let library = Library::default();
        library.save(data_dir)?;
        Ok(library)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir).context("create data dir")?;
        let library_path = data_dir.join(LIBRARY_FILE);
        let raw = serde_json::to_string_pretty(self).context("serialize library.json")?;
        fs::write(library_path, raw).context("write library.json")?;
        Ok(())
    }

    /// Drops duplicate configuration names (first wins) and stale source
    /// choices, and rebuilds derived indexes.
    pub fn normalize(&mut self) {
        let mut seen: Vec<String> = Vec::new();
        self.configurations.retain(|config| {
            let folded = config.display_name.trim().to_lowercase();
            if seen.contains(&folded) {
                false
            } else {
                seen.push(folded);
                true
            }
        });
        for config in &mut self.configurations {
            config.prune_disambiguation();
        }
        self.selections.rebuild_guest_index();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        environment::fixtures::{fk, mk},
        selection::{GuestAppearance, Selection},
    };
    use pretty_assertions::assert_eq;

    fn sample() -> Library {
        let mut config = ModConfiguration::new("Bijin");
        config.plugins = vec![mk("Bijin.esp"), mk("Bijin - Patch.esp")];
        config.npcs.insert(fk("013BBD:Skyrim.esm"));
        config.npc_sources.insert(
            fk("013BBD:Skyrim.esm"),
            vec![mk("Bijin.esp"), mk("Bijin - Patch.esp")],
        );
        config
            .disambiguation
            .insert(fk("013BBD:Skyrim.esm"), mk("Bijin.esp"));

        let mut library = Library {
            configurations: vec![config],
            selections: SelectionTable::default(),
        };
        library.selections.selections.insert(
            fk("013BBD:Skyrim.esm"),
            Selection {
                mod_name: "Bijin".to_string(),
                source_npc: fk("013BBD:Skyrim.esm"),
            },
        );
        library.selections.guests.insert(
            fk("013BBD:Skyrim.esm"),
            vec![GuestAppearance {
                mod_name: "Bijin".to_string(),
                source_npc: fk("013BBE:Skyrim.esm"),
                source_name: "Ysolda".to_string(),
            }],
        );
        library
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let library = sample();
        library.save(dir.path()).unwrap();
        let reloaded = Library::load_or_create(dir.path()).unwrap();
        assert_eq!(
            serde_json::to_value(&reloaded).unwrap(),
            serde_json::to_value(&library).unwrap()
        );
        assert_eq!(
            reloaded.selections.borrowers_of(&fk("013BBE:Skyrim.esm")),
            vec![fk("013BBD:Skyrim.esm")]
        );
    }

    #[test]
    fn creates_empty_library() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::load_or_create(dir.path()).unwrap();
        assert!(library.configurations.is_empty());
        assert!(dir.path().join(LIBRARY_FILE).exists());
    }

    #[test]
    fn duplicate_names_keep_the_first() {
        let mut library = sample();
        let mut duplicate = ModConfiguration::new(" bijin ");
        duplicate.plugins = vec![mk("Other.esp")];
        library.configurations.push(duplicate);
        library.normalize();
        assert_eq!(library.configurations.len(), 1);
        assert_eq!(library.configurations[0].plugins[0], mk("Bijin.esp"));
        assert_eq!(
            library.configurations[0]
                .disambiguation
                .get(&fk("013BBD:Skyrim.esm")),
            Some(&mk("Bijin.esp"))
        );
    }
}
