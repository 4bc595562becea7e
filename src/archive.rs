use crate::formkey::ModKey;
use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use zip::ZipArchive;

/// One opened archive. Entry names are normalized (see [`normalize_path`]).
pub trait ArchiveReader: Send + Sync {
    fn path(&self) -> &Path;
    fn entries(&self) -> Vec<String>;
    fn contains(&self, relative: &str) -> bool;
    fn extract(&self, relative: &str, dest: &Path) -> Result<()>;
}

#[derive(Clone)]
pub struct ArchiveFile {
    pub archive: Arc<dyn ArchiveReader>,
    pub entry: String,
}

impl std::fmt::Debug for ArchiveFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}!{}", self.archive.path().display(), self.entry)
    }
}

pub trait ArchiveAccess: Send + Sync {
    /// Archives belonging to `plugin` inside `folder`.
    fn open_archive_readers(&self, folder: &Path, plugin: &ModKey) -> Vec<Arc<dyn ArchiveReader>>;

    fn have_file(&self, relative: &str, readers: &[Arc<dyn ArchiveReader>]) -> Option<ArchiveFile> {
        let relative = normalize_path(relative);
        readers
            .iter()
            .find(|reader| reader.contains(&relative))
            .map(|reader| ArchiveFile {
                archive: reader.clone(),
                entry: relative,
            })
    }

    fn extract_file(&self, file: &ArchiveFile, dest: &Path) -> Result<()> {
        file.archive.extract(&file.entry, dest)
    }
}

/// Game-relative path in canonical form: forward slashes, lower case, no
/// leading separator.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .trim_start_matches('/')
        .to_ascii_lowercase()
}

/// Archives named after their plugin: `Foo.zip` and `Foo - Textures.zip`
/// belong to `Foo.esp`.
pub fn archive_paths_for(folder: &Path, plugin: &ModKey) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(folder) else {
        return Vec::new();
    };
    let stem = plugin.stem().to_ascii_lowercase();
    let prefix = format!("{stem} - ");
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            != Some(true)
        {
            continue;
        }
        let file_stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if file_stem == stem || file_stem.starts_with(&prefix) {
            out.push(path);
        }
    }
    out.sort();
    out
}

pub struct ZipReader {
    path: PathBuf,
    names: HashMap<String, String>,
}

impl ZipReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open archive {:?}", path))?;
        let archive = ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("read archive {:?}", path))?;
        let names = archive
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(|name| (normalize_path(name), name.to_string()))
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            names,
        })
    }
}

impl ArchiveReader for ZipReader {
    fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> Vec<String> {
        self.names.keys().cloned().collect()
    }

    fn contains(&self, relative: &str) -> bool {
        self.names.contains_key(relative)
    }

    fn extract(&self, relative: &str, dest: &Path) -> Result<()> {
        let original = self
            .names
            .get(relative)
            .with_context(|| format!("{relative} not in {:?}", self.path))?;
        let file = File::open(&self.path).with_context(|| format!("open archive {:?}", self.path))?;
        let mut archive = ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("read archive {:?}", self.path))?;
        let mut entry = archive
            .by_name(original)
            .with_context(|| format!("locate {original} in {:?}", self.path))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context("create extraction dir")?;
        }
        let mut out = File::create(dest).with_context(|| format!("create {:?}", dest))?;
        io::copy(&mut entry, &mut out).with_context(|| format!("extract {original}"))?;
        Ok(())
    }
}

/// Default archive collaborator. Readers are shared by path, so concurrent
/// scans opening the same archive index it once.
#[derive(Default)]
pub struct ZipArchiveAccess {
    readers: Mutex<HashMap<PathBuf, Arc<ZipReader>>>,
}

impl ZipArchiveAccess {
    pub fn new() -> Self {
        Self::default()
    }

    fn reader(&self, path: &Path) -> Option<Arc<ZipReader>> {
        if let Some(reader) = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            return Some(reader.clone());
        }
        let reader = Arc::new(ZipReader::open(path).ok()?);
        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        Some(
            readers
                .entry(path.to_path_buf())
                .or_insert(reader)
                .clone(),
        )
    }
}

impl ArchiveAccess for ZipArchiveAccess {
    fn open_archive_readers(&self, folder: &Path, plugin: &ModKey) -> Vec<Arc<dyn ArchiveReader>> {
        archive_paths_for(folder, plugin)
            .iter()
            .filter_map(|path| self.reader(path))
            .map(|reader| reader as Arc<dyn ArchiveReader>)
            .collect()
    }
}

#[cfg(test)]
pub mod fixtures {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    pub fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, bytes) in files {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }
}
