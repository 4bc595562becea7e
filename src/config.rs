use crate::{
    formkey::ModKey,
    game::{self, GameRelease},
    merge::{MissingAssetPolicy, PatchingMode, RunSettings},
};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_OUTPUT_PLUGIN: &str = "NPC Appearances Merged.esp";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub game: GameRelease,
    #[serde(default)]
    pub game_data_dir: Option<PathBuf>,
    #[serde(default)]
    pub plugins_txt: Option<PathBuf>,
    /// Record dumps of the plugins that live in the game data folder.
    #[serde(default)]
    pub record_dump_dir: Option<PathBuf>,
    #[serde(default)]
    pub mods_root: Option<PathBuf>,
    #[serde(default)]
    pub mugshots_root: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_output_plugin")]
    pub output_plugin_name: String,
    #[serde(default)]
    pub patching_mode: PatchingMode,
    #[serde(default)]
    pub missing_asset_policy: MissingAssetPolicy,
    #[serde(default = "default_true")]
    pub copy_assets: bool,
    #[serde(default)]
    pub include_game_data_assets: bool,
    #[serde(default)]
    pub suppressed_missing_assets: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_true")]
    pub confirm_destructive_actions: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            game: GameRelease::default(),
            game_data_dir: None,
            plugins_txt: None,
            record_dump_dir: None,
            mods_root: None,
            mugshots_root: None,
            output_dir: None,
            output_plugin_name: default_output_plugin(),
            patching_mode: PatchingMode::default(),
            missing_asset_policy: MissingAssetPolicy::default(),
            copy_assets: true,
            include_game_data_assets: false,
            suppressed_missing_assets: Vec::new(),
            language: None,
            confirm_destructive_actions: true,
        }
    }
}

impl AppConfig {
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).context("create app data dir")?;
        let path = data_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let mut config = AppConfig::default();
        if let Ok(paths) = game::detect_paths(config.game, None) {
            config.game_data_dir = Some(paths.data_dir);
            config.plugins_txt = paths.plugins_txt;
        }
        config.save(data_dir)?;
        Ok(config)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir).context("create app data dir")?;
        let path = data_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            output_dir: self.output_dir.clone(),
            output_plugin: ModKey::new(&self.output_plugin_name),
            patching_mode: self.patching_mode,
            missing_asset_policy: self.missing_asset_policy,
            copy_assets: self.copy_assets,
            include_game_data_assets: self.include_game_data_assets,
            suppressed_missing_assets: self.suppressed_missing_assets.clone(),
        }
    }
}

fn default_output_plugin() -> String {
    DEFAULT_OUTPUT_PLUGIN.to_string()
}

fn default_true() -> bool {
    true
}

pub fn base_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("VISAGESMITH_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("visagesmith"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_configs_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{ "game": "skyrim_vr", "output_dir": "/tmp/out", "missing_asset_policy": "skip_npc" }"#,
        )
        .unwrap();
        let config = AppConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(config.game, GameRelease::SkyrimVr);
        assert_eq!(config.output_plugin_name, DEFAULT_OUTPUT_PLUGIN);
        assert!(config.copy_assets);
        assert!(config.confirm_destructive_actions);

        let settings = config.run_settings();
        assert_eq!(settings.output_dir, Some(PathBuf::from("/tmp/out")));
        assert_eq!(settings.missing_asset_policy, MissingAssetPolicy::SkipNpc);
        assert_eq!(settings.patching_mode, PatchingMode::EasyNpcLike);
        assert_eq!(settings.output_plugin, ModKey::new(DEFAULT_OUTPUT_PLUGIN));
    }

    #[test]
    fn saves_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::load_or_create(dir.path()).unwrap();
        config.patching_mode = PatchingMode::Default;
        config.suppressed_missing_assets = vec!["textures/actors/character/".to_string()];
        config.save(dir.path()).unwrap();
        let reloaded = AppConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(reloaded.patching_mode, PatchingMode::Default);
        assert_eq!(reloaded.suppressed_missing_assets, config.suppressed_missing_assets);
    }
}
