use crate::{
    environment::{Plugin, PluginProvider},
    formkey::ModKey,
    provenance::locate_file,
};
use anyhow::{bail, Context, Result};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

/// Plugins as JSON record dumps: `Foo.esp` is read from `Foo.esp.json` in the
/// same folder. Parsed dumps are shared by path.
#[derive(Default)]
pub struct DumpPluginProvider {
    /// Searched after the caller's folders (game data dumps).
    fallback_dirs: Vec<PathBuf>,
    cache: Mutex<HashMap<PathBuf, Arc<Plugin>>>,
}

impl DumpPluginProvider {
    pub fn new(fallback_dirs: Vec<PathBuf>) -> Self {
        Self {
            fallback_dirs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, path: &Path) -> Option<Arc<Plugin>> {
        if let Some(plugin) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            return Some(plugin.clone());
        }
        let plugin = Arc::new(load_plugin(path).ok()?);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        Some(cache.entry(path.to_path_buf()).or_insert(plugin).clone())
    }
}

impl PluginProvider for DumpPluginProvider {
    fn try_get_plugin(&self, key: &ModKey, folders: &[PathBuf]) -> Option<(Arc<Plugin>, PathBuf)> {
        let file_name = dump_file_name(key);
        folders
            .iter()
            .chain(self.fallback_dirs.iter())
            .filter_map(|folder| locate_file(folder, &file_name))
            .find_map(|path| {
                let plugin = self.cached(&path)?;
                (plugin.mod_key == *key).then_some((plugin, path))
            })
    }
}

pub fn dump_file_name(key: &ModKey) -> String {
    format!("{}.json", key.name())
}

pub fn load_plugin(path: &Path) -> Result<Plugin> {
    let raw = fs::read_to_string(path).with_context(|| format!("read plugin dump {:?}", path))?;
    let mut plugin: Plugin =
        serde_json::from_str(&raw).with_context(|| format!("parse plugin dump {:?}", path))?;
    plugin.reindex();
    Ok(plugin)
}

pub fn write_plugin(plugin: &Plugin, dir: &Path) -> Result<PathBuf> {
    if plugin.records.is_empty() {
        bail!("refusing to write empty plugin {}", plugin.mod_key);
    }
    fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
    let path = dir.join(dump_file_name(&plugin.mod_key));
    let raw = serde_json::to_string_pretty(plugin).context("serialize plugin")?;
    fs::write(&path, raw).with_context(|| format!("write {:?}", path))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::fixtures::*;

    #[test]
    fn reads_dumps_from_folders_then_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let mods = dir.path().join("mods");
        let data = dir.path().join("data");
        write_plugin(
            &plugin("ModA.esp", &["Skyrim.esm"], vec![npc("000800:ModA.esp", "Hero", "013746:Skyrim.esm")]),
            &mods,
        )
        .unwrap();
        write_plugin(&plugin("Skyrim.esm", &[], vec![race("013746:Skyrim.esm", true)]), &data).unwrap();

        let provider = DumpPluginProvider::new(vec![data.clone()]);
        let (found, path) = provider.try_get_plugin(&mk("moda.esp"), &[mods.clone()]).unwrap();
        assert_eq!(path, mods.join("ModA.esp.json"));
        assert!(found.record(&fk("000800:ModA.esp")).is_some());
        assert_eq!(provider.master_plugins(&mk("ModA.esp"), &[mods.clone()]), Some(vec![mk("Skyrim.esm")]));

        let (base, _) = provider.try_get_plugin(&mk("Skyrim.esm"), &[mods.clone()]).unwrap();
        assert!(base.record(&fk("013746:Skyrim.esm")).is_some());
        let (again, _) = provider.try_get_plugin(&mk("Skyrim.esm"), &[]).unwrap();
        assert!(Arc::ptr_eq(&base, &again));
        assert!(provider.try_get_plugin(&mk("Missing.esp"), &[mods]).is_none());
    }

    #[test]
    fn broken_dump_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Bad.esp.json"), "{not json").unwrap();
        let provider = DumpPluginProvider::new(Vec::new());
        assert!(provider
            .try_get_plugin(&mk("Bad.esp"), &[dir.path().to_path_buf()])
            .is_none());
        assert!(load_plugin(&dir.path().join("Bad.esp.json")).is_err());
    }
}
