use crate::{formkey::ModKey, game::GameRelease};
use anyhow::{Context, Result};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

/// Masters the game loads whether or not plugins.txt lists them.
pub const IMPLICIT_MASTERS: [&str; 5] = [
    "Skyrim.esm",
    "Update.esm",
    "Dawnguard.esm",
    "HearthFires.esm",
    "Dragonborn.esm",
];

#[derive(Debug, Clone)]
pub struct GamePaths {
    pub game_root: PathBuf,
    pub data_dir: PathBuf,
    pub plugins_txt: Option<PathBuf>,
}

pub fn is_official_plugin(key: &ModKey) -> bool {
    if IMPLICIT_MASTERS
        .iter()
        .any(|master| master.eq_ignore_ascii_case(key.name()))
    {
        return true;
    }
    let folded = key.folded();
    folded.starts_with("cc") && (folded.ends_with(".esm") || folded.ends_with(".esl"))
}

pub fn detect_paths(release: GameRelease, game_root_override: Option<&Path>) -> Result<GamePaths> {
    let game_root = match game_root_override {
        Some(path) => path.to_path_buf(),
        None => find_game_root(release)
            .with_context(|| format!("locate {} game directory", release.display_name()))?,
    };
    let data_dir = game_root.join("Data");
    let plugins_txt = find_plugins_txt(release);
    Ok(GamePaths {
        game_root,
        data_dir,
        plugins_txt,
    })
}

fn find_game_root(release: GameRelease) -> Option<PathBuf> {
    steam_libraries()
        .into_iter()
        .map(|lib| lib.join("steamapps/common").join(release.install_folder()))
        .find(|candidate| looks_like_game_root(candidate))
}

fn steam_libraries() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = dirs_home() {
        candidates.push(home.join(".local/share/Steam"));
        candidates.push(home.join(".steam/steam"));
    }

    let mut libraries = Vec::new();
    for base in candidates {
        let vdf = base.join("steamapps/libraryfolders.vdf");
        if vdf.exists() {
            if let Ok(paths) = parse_steam_library_paths(&vdf) {
                libraries.extend(paths);
            }
        }
        libraries.push(base);
    }
    libraries
}

/// plugins.txt inside the Proton prefix of the release.
fn find_plugins_txt(release: GameRelease) -> Option<PathBuf> {
    steam_libraries()
        .into_iter()
        .map(|lib| {
            lib.join("steamapps/compatdata")
                .join(release.steam_app_id())
                .join("pfx/drive_c/users/steamuser/AppData/Local")
                .join(release.local_app_data_folder())
                .join("plugins.txt")
        })
        .find(|path| path.is_file())
}

fn parse_steam_library_paths(path: &Path) -> Result<Vec<PathBuf>> {
    let raw = fs::read_to_string(path).context("read libraryfolders.vdf")?;
    let mut paths = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if !line.contains("\"path\"") {
            continue;
        }

        let parts: Vec<&str> = line.split('"').collect();
        if parts.len() >= 4 {
            let path = parts[3].replace("\\\\", "\\");
            paths.push(PathBuf::from(path));
        }
    }

    Ok(paths)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

pub fn looks_like_game_root(path: &Path) -> bool {
    path.join("Data").is_dir()
}

/// Active load order: implicit masters first, then every `*` entry in file
/// order. Comments and disabled lines are skipped; duplicates keep their
/// first position.
pub fn read_load_order(path: &Path) -> Result<Vec<ModKey>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    Ok(parse_load_order(&raw))
}

pub fn parse_load_order(raw: &str) -> Vec<ModKey> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let active = raw.lines().filter_map(|line| {
        let line = line.trim();
        if line.starts_with('#') {
            return None;
        }
        line.strip_prefix('*').map(str::trim)
    });
    for name in IMPLICIT_MASTERS.iter().copied().chain(active) {
        if !ModKey::is_plugin_file(name) {
            continue;
        }
        let key = ModKey::new(name);
        if seen.insert(key.folded().to_string()) {
            order.push(key);
        }
    }
    order
}
