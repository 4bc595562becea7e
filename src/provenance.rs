use crate::{
    archive::{normalize_path, ArchiveAccess},
    catalog::ModConfiguration,
    formkey::{FormKey, ModKey},
};
use anyhow::{Context, Result};
use std::{
    collections::HashSet,
    fs::{self, File},
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

pub const FACEGEN_MESH_ROOT: &str = "meshes/actors/character/facegendata/facegeom";
pub const FACEGEN_TEXTURE_ROOT: &str = "textures/actors/character/facegendata/facetint";
const FACEGEN_MARKER: &str = "actors/character/facegendata/";
const PARTIAL_HASH_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceGenPaths {
    pub mesh: String,
    pub texture: String,
}

impl FaceGenPaths {
    pub fn both(&self) -> [&str; 2] {
        [&self.mesh, &self.texture]
    }
}

pub fn facegen_paths(npc: &FormKey) -> FaceGenPaths {
    let plugin = npc.mod_key.folded();
    FaceGenPaths {
        mesh: format!("{FACEGEN_MESH_ROOT}/{plugin}/{:08x}.nif", npc.id),
        texture: format!("{FACEGEN_TEXTURE_ROOT}/{plugin}/{:08x}.dds", npc.id),
    }
}

pub fn is_facegen_path(relative: &str) -> bool {
    normalize_path(relative).contains(FACEGEN_MARKER)
}

/// Lower-cased FaceGen paths available to one configuration, either as loose
/// files or inside archives.
#[derive(Debug, Clone, Default)]
pub struct FaceGenIndex {
    paths: HashSet<String>,
}

impl FaceGenIndex {
    pub fn loose(folders: &[PathBuf]) -> Self {
        let mut paths = HashSet::new();
        for folder in folders {
            let Ok(entries) = fs::read_dir(folder) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
                if name != "meshes" && name != "textures" {
                    continue;
                }
                for file in WalkDir::new(entry.path()).into_iter().filter_map(Result::ok) {
                    if !file.file_type().is_file() {
                        continue;
                    }
                    let rel = file.path().strip_prefix(folder).unwrap_or(file.path());
                    let rel = normalize_path(&rel.to_string_lossy());
                    if rel.contains(FACEGEN_MARKER) {
                        paths.insert(rel);
                    }
                }
            }
        }
        Self { paths }
    }

    /// Opens every archive of every plugin once and keeps the FaceGen entries.
    pub fn archives(
        folders: &[PathBuf],
        plugins: &[ModKey],
        archives: &dyn ArchiveAccess,
    ) -> Self {
        let mut paths = HashSet::new();
        for folder in folders {
            for plugin in plugins {
                for reader in archives.open_archive_readers(folder, plugin) {
                    paths.extend(
                        reader
                            .entries()
                            .into_iter()
                            .filter(|entry| entry.contains(FACEGEN_MARKER)),
                    );
                }
            }
        }
        Self { paths }
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.paths.contains(relative)
    }

    pub fn insert(&mut self, relative: &str) {
        self.paths.insert(normalize_path(relative));
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

pub fn facegen_exists(npc: &FormKey, loose: &FaceGenIndex, archive: &FaceGenIndex) -> bool {
    facegen_paths(npc)
        .both()
        .iter()
        .any(|path| loose.contains(path) || archive.contains(path))
}

/// Resolves a game-relative path under `root` regardless of on-disk casing.
pub fn locate_file(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = normalize_path(relative);
    let direct = root.join(&relative);
    if direct.is_file() {
        return Some(direct);
    }
    let mut current = root.to_path_buf();
    for component in relative.split('/').filter(|part| !part.is_empty()) {
        let exact = current.join(component);
        if exact.exists() {
            current = exact;
            continue;
        }
        let found = fs::read_dir(&current).ok()?.flatten().find(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .eq_ignore_ascii_case(component)
        })?;
        current = found.path();
    }
    current.is_file().then_some(current)
}

pub fn locate_dir(root: &Path, name: &str) -> Option<PathBuf> {
    fs::read_dir(root)
        .ok()?
        .flatten()
        .find(|entry| {
            entry.path().is_dir() && entry.file_name().to_string_lossy().eq_ignore_ascii_case(name)
        })
        .map(|entry| entry.path())
}

/// Cheap content equality: size plus a hash of the head and tail of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: u64,
    pub partial_hash: String,
}

impl Fingerprint {
    pub fn of(path: &Path) -> Result<Self> {
        let mut file = File::open(path).with_context(|| format!("open {:?}", path))?;
        let size = file.metadata().context("stat fingerprint source")?.len();
        let mut hasher = blake3::Hasher::new();
        let mut head = Vec::new();
        (&mut file)
            .take(PARTIAL_HASH_BYTES)
            .read_to_end(&mut head)
            .context("read fingerprint head")?;
        hasher.update(&head);
        if size > PARTIAL_HASH_BYTES * 2 {
            file.seek(SeekFrom::End(-(PARTIAL_HASH_BYTES as i64)))
                .context("seek fingerprint tail")?;
            let mut tail = Vec::new();
            file.read_to_end(&mut tail).context("read fingerprint tail")?;
            hasher.update(&tail);
        }
        Ok(Self {
            size,
            partial_hash: hasher.finalize().to_hex().to_string(),
        })
    }
}

/// Picks, among configurations that own the same plugin, the one whose loose
/// FaceGen files match what the game data folder actually contains.
pub fn disambiguate_by_content(
    candidates: &[&ModConfiguration],
    npc: &FormKey,
    game_data_dir: &Path,
) -> Option<String> {
    let paths = facegen_paths(npc);
    let mut references = Vec::new();
    for relative in paths.both() {
        if let Some(path) = locate_file(game_data_dir, relative) {
            if let Ok(fingerprint) = Fingerprint::of(&path) {
                references.push((relative, fingerprint));
            }
        }
    }
    if references.is_empty() {
        return None;
    }

    candidates
        .iter()
        .find(|config| {
            references.iter().all(|(relative, expected)| {
                config.folder_paths.iter().any(|folder| {
                    locate_file(folder, relative)
                        .and_then(|path| Fingerprint::of(&path).ok())
                        .map(|actual| actual == *expected)
                        .unwrap_or(false)
                })
            })
        })
        .map(|config| config.display_name.clone())
}
