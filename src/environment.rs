use crate::{
    archive::ArchiveAccess,
    formkey::{FormKey, ModKey},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub form_key: FormKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_id: Option<String>,
    #[serde(flatten)]
    pub data: RecordData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordData {
    Npc(NpcData),
    Race(RaceData),
    Armor(ArmorData),
    ArmorAddon(ArmorAddonData),
    TextureSet(TextureSetData),
    HeadPart(HeadPartData),
    Hair(LinkData),
    Color(LinkData),
    Eyes(LinkData),
    LeveledNpc(LeveledNpcData),
    Other(OtherData),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NpcData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub localized_names: BTreeMap<String, String>,
    /// The "use traits" template flag: appearance comes from `template`.
    #[serde(default)]
    pub use_traits: bool,
    #[serde(default)]
    pub template: Option<FormKey>,
    #[serde(default)]
    pub outfit: Option<FormKey>,
    #[serde(default)]
    pub appearance: NpcAppearance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<FormKey>,
}

impl NpcData {
    pub fn display_name(&self, language: Option<&str>) -> Option<&str> {
        if let Some(language) = language {
            if let Some(name) = self.localized_names.get(language) {
                return Some(name.as_str());
            }
        }
        self.name.as_deref()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NpcAppearance {
    #[serde(default)]
    pub race: Option<FormKey>,
    #[serde(default)]
    pub head_parts: Vec<FormKey>,
    #[serde(default)]
    pub head_texture: Option<FormKey>,
    #[serde(default)]
    pub hair_color: Option<FormKey>,
    #[serde(default)]
    pub worn_armor: Option<FormKey>,
    #[serde(default)]
    pub face_morph: Option<Vec<f32>>,
    #[serde(default)]
    pub tint_layers: Vec<TintLayer>,
    #[serde(default)]
    pub height: Option<f32>,
    #[serde(default)]
    pub weight: Option<f32>,
    #[serde(default)]
    pub texture_lighting: Option<[u8; 4]>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TintLayer {
    pub index: u16,
    #[serde(default)]
    pub color: Option<[u8; 4]>,
    #[serde(default)]
    pub interpolation: Option<f32>,
    #[serde(default)]
    pub preset: Option<i16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RaceData {
    #[serde(default)]
    pub face_gen_head: bool,
    #[serde(default)]
    pub has_head_data: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<FormKey>,
}

impl RaceData {
    /// Races that can carry a generated head: everything else is a creature.
    pub fn is_humanoid_appearance(&self) -> bool {
        self.face_gen_head || self.has_head_data
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArmorData {
    #[serde(default)]
    pub armature: Vec<FormKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<FormKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArmorAddonData {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub skin_textures: Vec<FormKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<FormKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TextureSetData {
    /// Slot name (diffuse, normal, specular, ...) to texture path.
    #[serde(default)]
    pub textures: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeadPartData {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub texture_set: Option<FormKey>,
    #[serde(default)]
    pub extra_parts: Vec<FormKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<FormKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LinkData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<FormKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LeveledNpcData {
    #[serde(default)]
    pub entries: Vec<FormKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OtherData {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<FormKey>,
}

impl Record {
    pub fn npc(&self) -> Option<&NpcData> {
        match &self.data {
            RecordData::Npc(npc) => Some(npc),
            _ => None,
        }
    }

    pub fn npc_mut(&mut self) -> Option<&mut NpcData> {
        match &mut self.data {
            RecordData::Npc(npc) => Some(npc),
            _ => None,
        }
    }

    pub fn race(&self) -> Option<&RaceData> {
        match &self.data {
            RecordData::Race(race) => Some(race),
            _ => None,
        }
    }

    pub fn kind_label(&self) -> &str {
        match &self.data {
            RecordData::Npc(_) => "NPC_",
            RecordData::Race(_) => "RACE",
            RecordData::Armor(_) => "ARMO",
            RecordData::ArmorAddon(_) => "ARMA",
            RecordData::TextureSet(_) => "TXST",
            RecordData::HeadPart(_) => "HDPT",
            RecordData::Hair(_) => "HAIR",
            RecordData::Color(_) => "CLFM",
            RecordData::Eyes(_) => "EYES",
            RecordData::LeveledNpc(_) => "LVLN",
            RecordData::Other(other) => other.kind.as_str(),
        }
    }

    pub fn is_appearance_type(&self) -> bool {
        matches!(
            self.data,
            RecordData::Npc(_)
                | RecordData::Armor(_)
                | RecordData::ArmorAddon(_)
                | RecordData::TextureSet(_)
                | RecordData::HeadPart(_)
                | RecordData::Hair(_)
                | RecordData::Color(_)
                | RecordData::Eyes(_)
        )
    }

    pub fn display_name(&self, language: Option<&str>) -> String {
        if let Some(name) = self.npc().and_then(|npc| npc.display_name(language)) {
            return name.to_string();
        }
        self.editor_id
            .clone()
            .unwrap_or_else(|| self.form_key.to_string())
    }

    /// Every record this one references.
    pub fn links(&self) -> Vec<FormKey> {
        let mut out = Vec::new();
        match &self.data {
            RecordData::Npc(npc) => {
                let look = &npc.appearance;
                out.extend(look.race.iter().cloned());
                out.extend(look.head_parts.iter().cloned());
                out.extend(look.head_texture.iter().cloned());
                out.extend(look.hair_color.iter().cloned());
                out.extend(look.worn_armor.iter().cloned());
                out.extend(npc.template.iter().cloned());
                out.extend(npc.outfit.iter().cloned());
                out.extend(npc.links.iter().cloned());
            }
            RecordData::Race(race) => out.extend(race.links.iter().cloned()),
            RecordData::Armor(armor) => {
                out.extend(armor.armature.iter().cloned());
                out.extend(armor.links.iter().cloned());
            }
            RecordData::ArmorAddon(addon) => {
                out.extend(addon.skin_textures.iter().cloned());
                out.extend(addon.links.iter().cloned());
            }
            RecordData::TextureSet(_) => {}
            RecordData::HeadPart(part) => {
                out.extend(part.texture_set.iter().cloned());
                out.extend(part.extra_parts.iter().cloned());
                out.extend(part.links.iter().cloned());
            }
            RecordData::Hair(data) | RecordData::Color(data) | RecordData::Eyes(data) => {
                out.extend(data.links.iter().cloned())
            }
            RecordData::LeveledNpc(list) => out.extend(list.entries.iter().cloned()),
            RecordData::Other(other) => out.extend(other.links.iter().cloned()),
        }
        out.retain(|link| *link != self.form_key);
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    pub mod_key: ModKey,
    #[serde(default)]
    pub masters: Vec<ModKey>,
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(skip)]
    index: HashMap<FormKey, usize>,
}

impl Plugin {
    pub fn new(mod_key: ModKey, masters: Vec<ModKey>, records: Vec<Record>) -> Self {
        let mut plugin = Self {
            mod_key,
            masters,
            records,
            index: HashMap::new(),
        };
        plugin.reindex();
        plugin
    }

    pub fn reindex(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(idx, record)| (record.form_key.clone(), idx))
            .collect();
    }

    pub fn record(&self, form_key: &FormKey) -> Option<&Record> {
        self.index.get(form_key).map(|idx| &self.records[*idx])
    }

    /// Inserts or replaces a record.
    pub fn upsert(&mut self, record: Record) {
        if let Some(idx) = self.index.get(&record.form_key) {
            self.records[*idx] = record;
            return;
        }
        self.index
            .insert(record.form_key.clone(), self.records.len());
        self.records.push(record);
    }

    pub fn npcs(&self) -> impl Iterator<Item = (&Record, &NpcData)> {
        self.records
            .iter()
            .filter_map(|record| record.npc().map(|npc| (record, npc)))
    }

    /// Records owned by another plugin: overrides, or injected records.
    pub fn foreign_records(&self) -> impl Iterator<Item = &Record> {
        self.records
            .iter()
            .filter(move |record| record.form_key.mod_key != self.mod_key)
    }
}

#[derive(Debug, Clone)]
pub struct RecordContext {
    pub mod_key: ModKey,
    pub record: Arc<Record>,
}

/// Record lookup across the active load order.
pub trait LinkCache: Send + Sync {
    fn load_order(&self) -> &[ModKey];

    /// Every version of a record, winning override first, original definition last.
    fn resolve_all_contexts(&self, form_key: &FormKey) -> Vec<RecordContext>;

    fn resolve(&self, form_key: &FormKey) -> Option<Arc<Record>> {
        self.resolve_all_contexts(form_key)
            .into_iter()
            .next()
            .map(|context| context.record)
    }

    fn resolve_npc(&self, form_key: &FormKey) -> Option<Arc<Record>> {
        self.resolve(form_key).filter(|record| record.npc().is_some())
    }

    fn resolve_race(&self, form_key: &FormKey) -> Option<Arc<Record>> {
        self.resolve(form_key).filter(|record| record.race().is_some())
    }

    fn resolve_leveled_npc(&self, form_key: &FormKey) -> Option<Arc<Record>> {
        self.resolve(form_key)
            .filter(|record| matches!(record.data, RecordData::LeveledNpc(_)))
    }

    fn load_index(&self, mod_key: &ModKey) -> Option<usize> {
        self.load_order().iter().position(|entry| entry == mod_key)
    }

    fn contains_plugin(&self, mod_key: &ModKey) -> bool {
        self.load_index(mod_key).is_some()
    }

    /// Direct masters of a load-order plugin.
    fn masters_of(&self, _mod_key: &ModKey) -> Option<Vec<ModKey>> {
        None
    }
}

/// Source of plugin files living in arbitrary folders.
pub trait PluginProvider: Send + Sync {
    fn try_get_plugin(&self, key: &ModKey, folders: &[PathBuf]) -> Option<(Arc<Plugin>, PathBuf)>;

    fn master_plugins(&self, key: &ModKey, folders: &[PathBuf]) -> Option<Vec<ModKey>> {
        self.try_get_plugin(key, folders)
            .map(|(plugin, _)| plugin.masters.clone())
    }
}

/// In-memory link cache over the plugins of the active load order.
pub struct GameEnvironment {
    load_order: Vec<ModKey>,
    plugins: HashMap<ModKey, Arc<Plugin>>,
}

impl GameEnvironment {
    pub fn new(load_order: Vec<ModKey>, plugins: Vec<Arc<Plugin>>) -> Self {
        let plugins = plugins
            .into_iter()
            .map(|plugin| (plugin.mod_key.clone(), plugin))
            .collect();
        Self {
            load_order,
            plugins,
        }
    }

    /// Loads every plugin of `load_order` from `folders`; missing plugins are
    /// reported and dropped from the effective load order.
    pub fn load(
        load_order: &[ModKey],
        provider: &dyn PluginProvider,
        folders: &[PathBuf],
    ) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let mut found = Vec::new();
        let mut plugins = Vec::new();
        for key in load_order {
            match provider.try_get_plugin(key, folders) {
                Some((plugin, _)) => {
                    found.push(key.clone());
                    plugins.push(plugin);
                }
                None => warnings.push(format!("Load order plugin not found: {key}")),
            }
        }
        (Self::new(found, plugins), warnings)
    }

    pub fn plugin(&self, key: &ModKey) -> Option<&Arc<Plugin>> {
        self.plugins.get(key)
    }
}

impl LinkCache for GameEnvironment {
    fn load_order(&self) -> &[ModKey] {
        &self.load_order
    }

    fn resolve_all_contexts(&self, form_key: &FormKey) -> Vec<RecordContext> {
        let mut out = Vec::new();
        for key in self.load_order.iter().rev() {
            let Some(plugin) = self.plugins.get(key) else {
                continue;
            };
            if let Some(record) = plugin.record(form_key) {
                out.push(RecordContext {
                    mod_key: key.clone(),
                    record: Arc::new(record.clone()),
                });
            }
        }
        out
    }

    fn masters_of(&self, mod_key: &ModKey) -> Option<Vec<ModKey>> {
        self.plugins.get(mod_key).map(|plugin| plugin.masters.clone())
    }
}

/// Out-of-plugin records of one plugin, grouped by owning master.
#[derive(Debug, Clone, Default)]
pub struct OverrideSummary {
    pub by_master: BTreeMap<ModKey, Vec<FormKey>>,
}

impl OverrideSummary {
    pub fn of(plugin: &Plugin) -> Self {
        let mut by_master: BTreeMap<ModKey, Vec<FormKey>> = BTreeMap::new();
        for record in plugin.foreign_records() {
            by_master
                .entry(record.form_key.mod_key.clone())
                .or_default()
                .push(record.form_key.clone());
        }
        Self { by_master }
    }
}

type OverrideSlot = Arc<OnceLock<Arc<OverrideSummary>>>;

/// Shared across concurrent rescans: each (source path, plugin) pair is
/// summarized once, whichever configuration asks first.
#[derive(Default)]
pub struct OverrideCache {
    entries: Mutex<HashMap<(PathBuf, ModKey), OverrideSlot>>,
}

impl OverrideCache {
    pub fn get_or_compute(
        &self,
        source: &Path,
        plugin: &ModKey,
        compute: impl FnOnce() -> OverrideSummary,
    ) -> Arc<OverrideSummary> {
        let slot = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .entry((source.to_path_buf(), plugin.clone()))
                .or_default()
                .clone()
        };
        slot.get_or_init(|| Arc::new(compute())).clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Everything a core operation needs from the outside world.
pub struct EngineContext {
    pub link_cache: Arc<dyn LinkCache>,
    pub plugins: Arc<dyn PluginProvider>,
    pub archives: Arc<dyn ArchiveAccess>,
    pub game_data_dir: PathBuf,
    pub language: Option<String>,
    pub diagnostics_dir: PathBuf,
    pub override_cache: OverrideCache,
}

impl EngineContext {
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn diagnostics_dir_for(&self, configuration: &str) -> PathBuf {
        self.diagnostics_dir
            .join(crate::log::sanitize_file_name(configuration))
    }
}

#[cfg(test)]
pub mod fixtures {
    use super::*;
    use crate::archive::{ArchiveFile, ArchiveReader};
    use anyhow::Result;

    pub fn fk(raw: &str) -> FormKey {
        raw.parse().unwrap()
    }

    pub fn mk(raw: &str) -> ModKey {
        ModKey::new(raw)
    }

    pub fn npc(form_key: &str, name: &str, race: &str) -> Record {
        Record {
            form_key: fk(form_key),
            editor_id: Some(name.replace(' ', "")),
            data: RecordData::Npc(NpcData {
                name: Some(name.to_string()),
                appearance: NpcAppearance {
                    race: Some(fk(race)),
                    ..NpcAppearance::default()
                },
                ..NpcData::default()
            }),
        }
    }

    pub fn templated_npc(form_key: &str, name: &str, race: &str, template: &str) -> Record {
        let mut record = npc(form_key, name, race);
        if let Some(data) = record.npc_mut() {
            data.use_traits = true;
            data.template = Some(fk(template));
        }
        record
    }

    pub fn race(form_key: &str, humanoid: bool) -> Record {
        Record {
            form_key: fk(form_key),
            editor_id: Some(format!("Race{form_key}")),
            data: RecordData::Race(RaceData {
                face_gen_head: humanoid,
                has_head_data: humanoid,
                ..RaceData::default()
            }),
        }
    }

    pub fn other(form_key: &str, kind: &str) -> Record {
        Record {
            form_key: fk(form_key),
            editor_id: None,
            data: RecordData::Other(OtherData {
                kind: kind.to_string(),
                links: Vec::new(),
            }),
        }
    }

    pub fn plugin(name: &str, masters: &[&str], records: Vec<Record>) -> Plugin {
        Plugin::new(mk(name), masters.iter().map(|m| mk(m)).collect(), records)
    }

    /// Plugins keyed by (folder, name); an empty folder means "any folder".
    #[derive(Default)]
    pub struct MemoryPlugins {
        pub plugins: Mutex<Vec<(PathBuf, Arc<Plugin>)>>,
    }

    impl MemoryPlugins {
        pub fn add(&self, folder: &str, plugin: Plugin) {
            self.plugins
                .lock()
                .unwrap()
                .push((PathBuf::from(folder), Arc::new(plugin)));
        }
    }

    impl PluginProvider for MemoryPlugins {
        fn try_get_plugin(
            &self,
            key: &ModKey,
            folders: &[PathBuf],
        ) -> Option<(Arc<Plugin>, PathBuf)> {
            let plugins = self.plugins.lock().unwrap();
            for (folder, plugin) in plugins.iter() {
                if plugin.mod_key != *key {
                    continue;
                }
                if folder.as_os_str().is_empty() || folders.iter().any(|f| f == folder) {
                    return Some((plugin.clone(), folder.join(key.name())));
                }
            }
            None
        }
    }

    pub struct NoArchives;

    impl ArchiveAccess for NoArchives {
        fn open_archive_readers(
            &self,
            _folder: &Path,
            _plugin: &ModKey,
        ) -> Vec<Arc<dyn ArchiveReader>> {
            Vec::new()
        }

        fn extract_file(&self, file: &ArchiveFile, _dest: &Path) -> Result<()> {
            anyhow::bail!("no archives: {}", file.entry)
        }
    }

    pub fn context(
        load_order: Vec<Plugin>,
        provider: Arc<MemoryPlugins>,
        root: &Path,
    ) -> EngineContext {
        let order = load_order.iter().map(|p| p.mod_key.clone()).collect();
        let plugins = load_order.into_iter().map(Arc::new).collect();
        EngineContext {
            link_cache: Arc::new(GameEnvironment::new(order, plugins)),
            plugins: provider,
            archives: Arc::new(NoArchives),
            game_data_dir: root.join("Data"),
            language: None,
            diagnostics_dir: root.join("diagnostics"),
            override_cache: OverrideCache::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn winning_context_comes_first() {
        let base = plugin("Skyrim.esm", &[], vec![npc("000800:Skyrim.esm", "Lydia", "013746:Skyrim.esm")]);
        let patch = plugin(
            "Patch.esp",
            &["Skyrim.esm"],
            vec![npc("000800:Skyrim.esm", "Lydia Patched", "013746:Skyrim.esm")],
        );
        let env = GameEnvironment::new(
            vec![mk("Skyrim.esm"), mk("Patch.esp")],
            vec![Arc::new(base), Arc::new(patch)],
        );
        let contexts = env.resolve_all_contexts(&fk("000800:Skyrim.esm"));
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].mod_key, mk("Patch.esp"));
        assert_eq!(contexts[1].mod_key, mk("Skyrim.esm"));
        let winner = env.resolve_npc(&fk("000800:Skyrim.esm")).unwrap();
        assert_eq!(winner.display_name(None), "Lydia Patched");
        assert!(env.resolve_race(&fk("000800:Skyrim.esm")).is_none());
    }

    #[test]
    fn records_round_trip_through_json() {
        let record = templated_npc("000801:Mod.esp", "Guard", "013746:Skyrim.esm", "000802:Mod.esp");
        let raw = serde_json::to_string(&record).unwrap();
        assert!(raw.contains("\"type\":\"npc\""));
        let back: Record = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, record);
        assert_eq!(
            back.links(),
            vec![fk("013746:Skyrim.esm"), fk("000802:Mod.esp")]
        );
    }

    #[test]
    fn override_cache_computes_once() {
        let cache = OverrideCache::default();
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let plugin = plugin(
            "Mod.esp",
            &["Skyrim.esm"],
            vec![npc("000800:Skyrim.esm", "Lydia", "013746:Skyrim.esm")],
        );
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let summary = cache.get_or_compute(Path::new("/mods/a"), &plugin.mod_key, || {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        OverrideSummary::of(&plugin)
                    });
                    assert_eq!(summary.by_master.len(), 1);
                });
            }
        });
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }
}
