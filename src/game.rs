use crate::skyrim;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameRelease {
    SkyrimSe,
    SkyrimVr,
    SkyrimLe,
}

impl Default for GameRelease {
    fn default() -> Self {
        GameRelease::SkyrimSe
    }
}

impl GameRelease {
    pub fn display_name(self) -> &'static str {
        match self {
            GameRelease::SkyrimSe => "Skyrim Special Edition",
            GameRelease::SkyrimVr => "Skyrim VR",
            GameRelease::SkyrimLe => "Skyrim",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameRelease::SkyrimSe => "skyrim_se",
            GameRelease::SkyrimVr => "skyrim_vr",
            GameRelease::SkyrimLe => "skyrim_le",
        }
    }

    pub fn install_folder(self) -> &'static str {
        match self {
            GameRelease::SkyrimSe => "Skyrim Special Edition",
            GameRelease::SkyrimVr => "SkyrimVR",
            GameRelease::SkyrimLe => "Skyrim",
        }
    }

    pub fn steam_app_id(self) -> &'static str {
        match self {
            GameRelease::SkyrimSe => "489830",
            GameRelease::SkyrimVr => "611670",
            GameRelease::SkyrimLe => "72850",
        }
    }

    pub fn local_app_data_folder(self) -> &'static str {
        match self {
            GameRelease::SkyrimSe => "Skyrim Special Edition",
            GameRelease::SkyrimVr => "Skyrim VR",
            GameRelease::SkyrimLe => "Skyrim",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        supported_releases()
            .into_iter()
            .find(|release| release.as_str().eq_ignore_ascii_case(value))
    }
}

pub fn supported_releases() -> Vec<GameRelease> {
    vec![
        GameRelease::SkyrimSe,
        GameRelease::SkyrimVr,
        GameRelease::SkyrimLe,
    ]
}

pub fn detect_paths(release: GameRelease, game_root_override: Option<&Path>) -> Result<skyrim::GamePaths> {
    skyrim::detect_paths(release, game_root_override)
}
