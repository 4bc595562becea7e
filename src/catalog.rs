use crate::{
    environment::{EngineContext, LinkCache, OverrideSummary, Plugin},
    formkey::{FormKey, ModKey},
    log::LogFile,
    progress::{self, ProgressCallback, Stage},
    provenance::{facegen_exists, FaceGenIndex},
    snapshot::{needs_rescan, ConfigSnapshot},
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fs, mem,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

pub const DEFAULT_MAX_NESTED_SEARCH_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverrideHandling {
    /// Referenced records that already exist in the load order are left alone.
    Ignore,
    /// The source plugin's override of a load-order record is carried over too.
    Include,
}

impl Default for OverrideHandling {
    fn default() -> Self {
        Self::Ignore
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NpcDetails {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub editor_id: Option<String>,
    #[serde(default)]
    pub template: Option<FormKey>,
    #[serde(default)]
    pub has_facegen: bool,
    /// Own race resolved to a humanoid appearance race. False for NPCs that
    /// only inherit a race through their template.
    #[serde(default = "default_true")]
    pub race_valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModConfiguration {
    pub display_name: String,
    #[serde(default)]
    pub plugins: Vec<ModKey>,
    #[serde(default)]
    pub folder_paths: Vec<PathBuf>,
    #[serde(default)]
    pub image_paths: Vec<PathBuf>,
    #[serde(default)]
    pub resource_only_plugins: BTreeSet<ModKey>,
    #[serde(default)]
    pub disambiguation: BTreeMap<FormKey, ModKey>,
    #[serde(default)]
    pub notifications: BTreeMap<FormKey, String>,
    #[serde(default)]
    pub ambiguous_npcs: BTreeSet<FormKey>,
    #[serde(default)]
    pub npcs: BTreeSet<FormKey>,
    #[serde(default)]
    pub npc_sources: BTreeMap<FormKey, Vec<ModKey>>,
    #[serde(default)]
    pub npc_details: BTreeMap<FormKey, NpcDetails>,
    #[serde(default)]
    pub npc_count: usize,
    #[serde(default)]
    pub snapshot: Option<ConfigSnapshot>,
    #[serde(default = "default_true")]
    pub merge_in_dependency_records: bool,
    #[serde(default)]
    pub merge_in_user_override: bool,
    #[serde(default)]
    pub include_outfits: bool,
    #[serde(default)]
    pub handle_injected_records: bool,
    #[serde(default)]
    pub override_handling: OverrideHandling,
    #[serde(default = "default_search_depth")]
    pub max_nested_search_depth: usize,
    #[serde(default)]
    pub is_auto_generated: bool,
}

impl ModConfiguration {
    pub fn new(display_name: &str) -> Self {
        Self {
            display_name: display_name.trim().to_string(),
            plugins: Vec::new(),
            folder_paths: Vec::new(),
            image_paths: Vec::new(),
            resource_only_plugins: BTreeSet::new(),
            disambiguation: BTreeMap::new(),
            notifications: BTreeMap::new(),
            ambiguous_npcs: BTreeSet::new(),
            npcs: BTreeSet::new(),
            npc_sources: BTreeMap::new(),
            npc_details: BTreeMap::new(),
            npc_count: 0,
            snapshot: None,
            merge_in_dependency_records: true,
            merge_in_user_override: false,
            include_outfits: false,
            handle_injected_records: false,
            override_handling: OverrideHandling::default(),
            max_nested_search_depth: DEFAULT_MAX_NESTED_SEARCH_DEPTH,
            is_auto_generated: false,
        }
    }

    pub fn is_named(&self, name: &str) -> bool {
        same_name(&self.display_name, name)
    }

    /// Plugins scanned for appearance records.
    pub fn appearance_plugins(&self) -> Vec<ModKey> {
        self.plugins
            .iter()
            .filter(|plugin| !self.resource_only_plugins.contains(*plugin))
            .cloned()
            .collect()
    }

    pub fn owns_plugin(&self, plugin: &ModKey) -> bool {
        self.plugins.contains(plugin)
    }

    pub fn candidate_plugins(&self, npc: &FormKey) -> &[ModKey] {
        self.npc_sources
            .get(npc)
            .map(|plugins| plugins.as_slice())
            .unwrap_or(&[])
    }

    /// The plugin that provides `npc`: the only candidate, or the stored
    /// disambiguation when it is still one of the candidates.
    pub fn source_plugin(&self, npc: &FormKey) -> Option<ModKey> {
        let candidates = self.candidate_plugins(npc);
        match candidates.len() {
            0 => None,
            1 => Some(candidates[0].clone()),
            _ => self
                .disambiguation
                .get(npc)
                .filter(|chosen| candidates.contains(*chosen))
                .cloned(),
        }
    }

    pub fn has_mugshots(&self) -> bool {
        !self.image_paths.is_empty()
    }

    pub fn can_delete(&self) -> bool {
        self.folder_paths.is_empty() && self.image_paths.is_empty()
    }

    /// Drops disambiguation entries for NPCs that are no longer ambiguous.
    pub fn prune_disambiguation(&mut self) {
        let sources = &self.npc_sources;
        self.disambiguation.retain(|npc, chosen| {
            sources
                .get(npc)
                .map(|candidates| candidates.len() > 1 && candidates.contains(chosen))
                .unwrap_or(false)
        });
        self.ambiguous_npcs
            .retain(|npc| sources.get(npc).map(|c| c.len() > 1).unwrap_or(false));
    }
}

/// One NPC as seen across every configuration that offers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpcAppearanceRecord {
    pub key: FormKey,
    pub display_name: String,
    pub editor_id: Option<String>,
    pub race_valid: bool,
    pub has_facegen: bool,
    pub template: Option<FormKey>,
    /// Configuration name to the plugin it takes the NPC from (None while ambiguous).
    pub offered_by: BTreeMap<String, Option<ModKey>>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub configurations: Vec<ModConfiguration>,
    npcs: BTreeMap<FormKey, NpcAppearanceRecord>,
}

impl Catalog {
    pub fn new(configurations: Vec<ModConfiguration>) -> Self {
        let mut catalog = Self {
            configurations,
            npcs: BTreeMap::new(),
        };
        catalog.rebuild_npc_index();
        catalog
    }

    pub fn configuration(&self, name: &str) -> Option<&ModConfiguration> {
        self.configurations.iter().find(|config| config.is_named(name))
    }

    pub fn configuration_mut(&mut self, name: &str) -> Option<&mut ModConfiguration> {
        self.configurations
            .iter_mut()
            .find(|config| config.is_named(name))
    }

    pub fn add_configuration(&mut self, config: ModConfiguration) -> Result<()> {
        if config.display_name.is_empty() {
            bail!("configuration name is empty");
        }
        if self.configuration(&config.display_name).is_some() {
            bail!("a configuration named {:?} already exists", config.display_name);
        }
        self.configurations.push(config);
        self.rebuild_npc_index();
        Ok(())
    }

    /// Only empty configurations (no folders, no mugshots) can be removed.
    pub fn remove_configuration(&mut self, name: &str) -> Result<ModConfiguration> {
        let idx = self
            .configurations
            .iter()
            .position(|config| config.is_named(name))
            .with_context(|| format!("unknown configuration {name:?}"))?;
        if !self.configurations[idx].can_delete() {
            bail!(
                "configuration {:?} still has folder or mugshot paths",
                self.configurations[idx].display_name
            );
        }
        let removed = self.configurations.remove(idx);
        self.rebuild_npc_index();
        Ok(removed)
    }

    /// Changing folders invalidates the snapshot so the next rescan covers it.
    pub fn set_folder_paths(&mut self, name: &str, folders: Vec<PathBuf>) -> Result<()> {
        let config = self
            .configuration_mut(name)
            .with_context(|| format!("unknown configuration {name:?}"))?;
        if config.folder_paths != folders {
            config.folder_paths = folders;
            config.snapshot = None;
        }
        Ok(())
    }

    pub fn npc(&self, key: &FormKey) -> Option<&NpcAppearanceRecord> {
        self.npcs.get(key)
    }

    pub fn npcs(&self) -> impl Iterator<Item = &NpcAppearanceRecord> {
        self.npcs.values()
    }

    pub fn is_known_npc(&self, key: &FormKey) -> bool {
        self.npcs.contains_key(key)
    }

    pub fn configurations_offering(&self, npc: &FormKey) -> Vec<&ModConfiguration> {
        self.configurations
            .iter()
            .filter(|config| config.npcs.contains(npc))
            .collect()
    }

    pub fn configurations_owning(&self, plugin: &ModKey) -> Vec<&ModConfiguration> {
        self.configurations
            .iter()
            .filter(|config| config.owns_plugin(plugin))
            .collect()
    }

    pub fn rebuild_npc_index(&mut self) {
        let mut npcs: BTreeMap<FormKey, NpcAppearanceRecord> = BTreeMap::new();
        for config in &self.configurations {
            for key in &config.npcs {
                let details = config.npc_details.get(key).cloned().unwrap_or_default();
                let entry = npcs
                    .entry(key.clone())
                    .or_insert_with(|| NpcAppearanceRecord {
                        key: key.clone(),
                        display_name: details
                            .name
                            .clone()
                            .or_else(|| details.editor_id.clone())
                            .unwrap_or_else(|| key.to_string()),
                        editor_id: details.editor_id.clone(),
                        race_valid: false,
                        has_facegen: false,
                        template: details.template.clone(),
                        offered_by: BTreeMap::new(),
                    });
                entry.race_valid |= details.race_valid;
                entry.has_facegen |= details.has_facegen;
                entry
                    .offered_by
                    .insert(config.display_name.clone(), config.source_plugin(key));
            }
        }
        self.npcs = npcs;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub accepted: usize,
    pub rejected: Vec<(FormKey, String)>,
    pub warnings: Vec<String>,
}

/// Rebuilds the NPC sets of one configuration from its plugins.
pub fn rescan_configuration(
    config: &mut ModConfiguration,
    loose: &FaceGenIndex,
    archive: &FaceGenIndex,
    ctx: &EngineContext,
) -> ScanReport {
    let diagnostics = LogFile::new(ctx.diagnostics_dir_for(&config.display_name).join("scan.log"));
    diagnostics.truncate();
    let mut report = ScanReport::default();

    let previous = mem::take(&mut config.disambiguation);
    config.npcs.clear();
    config.npc_sources.clear();
    config.npc_details.clear();
    config.ambiguous_npcs.clear();
    config.notifications.clear();

    let loaded: Vec<Arc<Plugin>> = config
        .appearance_plugins()
        .iter()
        .filter_map(|key| match ctx.plugins.try_get_plugin(key, &config.folder_paths) {
            Some((plugin, _)) => Some(plugin),
            None => {
                let message = format!("Plugin {key} not found in {}", config.display_name);
                diagnostics.warn(&message);
                report.warnings.push(message);
                None
            }
        })
        .collect();

    for plugin in &loaded {
        let mut race_cache: HashMap<FormKey, Result<bool, String>> = HashMap::new();
        for (record, npc) in plugin.npcs() {
            let key = &record.form_key;
            let inherits = npc.use_traits && npc.template.is_some();
            let has_facegen = facegen_exists(key, loose, archive);

            let own_race = npc.appearance.race.is_some();
            let race_problem = match &npc.appearance.race {
                Some(race) => {
                    let valid = race_cache
                        .entry(race.clone())
                        .or_insert_with(|| {
                            race_validity(race, plugin, &loaded, ctx.link_cache.as_ref())
                        })
                        .clone();
                    match valid {
                        Ok(true) => None,
                        Ok(false) => Some(format!("race {race} is not a humanoid appearance race")),
                        Err(reason) => Some(reason),
                    }
                }
                None if inherits => None,
                None => Some("no race assigned".to_string()),
            };
            let rejection = race_problem.or_else(|| {
                (!has_facegen && !inherits)
                    .then(|| "no FaceGen mesh or texture found".to_string())
            });

            if let Some(reason) = rejection {
                diagnostics.info(&format!(
                    "Rejected {key} ({}) from {}: {reason}",
                    record.display_name(ctx.language()),
                    plugin.mod_key
                ));
                report.rejected.push((key.clone(), reason));
                continue;
            }

            config.npcs.insert(key.clone());
            let sources = config.npc_sources.entry(key.clone()).or_default();
            if !sources.contains(&plugin.mod_key) {
                sources.push(plugin.mod_key.clone());
            }
            config.npc_details.insert(
                key.clone(),
                NpcDetails {
                    name: npc.display_name(ctx.language()).map(|name| name.to_string()),
                    editor_id: record.editor_id.clone(),
                    template: npc.template.clone(),
                    has_facegen,
                    race_valid: own_race,
                },
            );
            if inherits {
                if let Some(template) = &npc.template {
                    config.notifications.insert(
                        key.clone(),
                        format!(
                            "Uses template {template} for its traits; its appearance may not be stable"
                        ),
                    );
                }
            }
        }
    }

    let ambiguous: Vec<(FormKey, Vec<ModKey>)> = config
        .npc_sources
        .iter()
        .filter(|(_, sources)| sources.len() > 1)
        .map(|(npc, sources)| (npc.clone(), sources.clone()))
        .collect();
    for (npc, candidates) in ambiguous {
        config.ambiguous_npcs.insert(npc.clone());
        let kept = previous
            .get(&npc)
            .filter(|chosen| candidates.contains(*chosen))
            .cloned();
        let chosen = kept.or_else(|| choose_default_source_in(&candidates, config, ctx));
        if let Some(chosen) = chosen {
            config.disambiguation.insert(npc, chosen);
        }
    }

    config.npc_count = config.npcs.len();
    report.accepted = config.npc_count;
    diagnostics.info(&format!(
        "Scan finished: {} accepted, {} rejected",
        report.accepted,
        report.rejected.len()
    ));
    report
}

fn race_validity(
    race: &FormKey,
    plugin: &Plugin,
    siblings: &[Arc<Plugin>],
    link_cache: &dyn LinkCache,
) -> Result<bool, String> {
    if let Some(data) = plugin.record(race).and_then(|record| record.race()) {
        return Ok(data.is_humanoid_appearance());
    }
    for sibling in siblings {
        if let Some(data) = sibling.record(race).and_then(|record| record.race()) {
            return Ok(data.is_humanoid_appearance());
        }
    }
    match link_cache.resolve_race(race) {
        Some(record) => Ok(record
            .race()
            .map(|data| data.is_humanoid_appearance())
            .unwrap_or(false)),
        None => Err(format!("race {race} could not be resolved")),
    }
}

/// Default pick among plugins of one configuration that all define an NPC.
///
/// 1. All candidates in the load order: the one that loads last.
/// 2. Otherwise, among candidates whose whole master chain can be satisfied by
///    the load order or the configuration's plugins, the one with the most
///    masters; ties go to the alphabetically first file name of the tie.
/// 3. Otherwise the alphabetically first candidate.
pub fn choose_default_source(
    candidates: &[ModKey],
    config_plugins: &[ModKey],
    load_order: &[ModKey],
    masters_of: &dyn Fn(&ModKey) -> Option<Vec<ModKey>>,
) -> Option<ModKey> {
    if candidates.is_empty() {
        return None;
    }
    let load_index = |key: &ModKey| load_order.iter().position(|entry| entry == key);
    if candidates.iter().all(|candidate| load_index(candidate).is_some()) {
        return candidates
            .iter()
            .max_by_key(|candidate| load_index(candidate))
            .cloned();
    }

    let satisfiable = |key: &ModKey| load_index(key).is_some() || config_plugins.contains(key);
    let mut depths: Vec<(&ModKey, usize)> = Vec::new();
    for candidate in candidates {
        let Some(chain) = master_chain(candidate, masters_of) else {
            continue;
        };
        if chain.iter().all(|master| satisfiable(master)) {
            depths.push((candidate, chain.len()));
        }
    }

    if let Some(deepest) = depths.iter().map(|(_, depth)| *depth).max() {
        let mut tied: Vec<&ModKey> = depths
            .iter()
            .filter(|(_, depth)| *depth == deepest)
            .map(|(candidate, _)| *candidate)
            .collect();
        tied.sort();
        return tied.first().map(|key| (*key).clone());
    }

    let mut all: Vec<&ModKey> = candidates.iter().collect();
    all.sort();
    all.first().map(|key| (*key).clone())
}

fn choose_default_source_in(
    candidates: &[ModKey],
    config: &ModConfiguration,
    ctx: &EngineContext,
) -> Option<ModKey> {
    let folders = config.folder_paths.clone();
    let masters_of = |key: &ModKey| {
        ctx.plugins
            .master_plugins(key, &folders)
            .or_else(|| ctx.link_cache.masters_of(key))
    };
    choose_default_source(
        candidates,
        &config.plugins,
        ctx.link_cache.load_order(),
        &masters_of,
    )
}

/// Every transitive master of `key`, or None when some plugin of the chain
/// cannot be found.
fn master_chain(
    key: &ModKey,
    masters_of: &dyn Fn(&ModKey) -> Option<Vec<ModKey>>,
) -> Option<BTreeSet<ModKey>> {
    let mut chain = BTreeSet::new();
    let mut pending = vec![key.clone()];
    let mut visited = HashSet::new();
    while let Some(current) = pending.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        for master in masters_of(&current)? {
            if master != *key {
                chain.insert(master.clone());
            }
            pending.push(master);
        }
    }
    Some(chain)
}

/// Points one ambiguous NPC at `plugin`. Returns whether anything changed.
pub fn set_single_source(config: &mut ModConfiguration, npc: &FormKey, plugin: &ModKey) -> bool {
    if !config.owns_plugin(plugin) {
        return false;
    }
    let still_ambiguous = config
        .npc_sources
        .get(npc)
        .map(|candidates| candidates.len() > 1 && candidates.contains(plugin))
        .unwrap_or(false);
    if !still_ambiguous {
        config.prune_disambiguation();
        return false;
    }
    if config.disambiguation.get(npc) == Some(plugin) {
        return false;
    }
    config.disambiguation.insert(npc.clone(), plugin.clone());
    true
}

/// Points every ambiguous NPC that `plugin` defines at `plugin`.
pub fn set_source_for_all_applicable(config: &mut ModConfiguration, plugin: &ModKey) -> bool {
    if !config.owns_plugin(plugin) {
        return false;
    }
    let applicable: Vec<FormKey> = config
        .npc_sources
        .iter()
        .filter(|(_, candidates)| candidates.len() > 1 && candidates.contains(plugin))
        .map(|(npc, _)| npc.clone())
        .collect();
    let mut changed = false;
    for npc in applicable {
        if config.disambiguation.get(&npc) != Some(plugin) {
            config.disambiguation.insert(npc, plugin.clone());
            changed = true;
        }
    }
    changed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeInSuitability {
    pub appearance_records: usize,
    pub other_records: usize,
    pub suitable: bool,
}

/// Plugins dominated by non-appearance records should stay active on their
/// own rather than being merged into the output.
pub fn check_merge_in_suitability(
    config: &mut ModConfiguration,
    ctx: &EngineContext,
) -> MergeInSuitability {
    let mut appearance_records = 0usize;
    let mut other_records = 0usize;
    for key in config.appearance_plugins() {
        let Some((plugin, _)) = ctx.plugins.try_get_plugin(&key, &config.folder_paths) else {
            continue;
        };
        for record in &plugin.records {
            if record.is_appearance_type() {
                appearance_records += 1;
            } else {
                other_records += 1;
            }
        }
    }
    let suitable = !config.is_auto_generated && other_records <= appearance_records;
    if !config.merge_in_user_override {
        config.merge_in_dependency_records = suitable;
    }
    MergeInSuitability {
        appearance_records,
        other_records,
        suitable,
    }
}

#[derive(Debug, Clone, Default)]
pub struct InjectionReport {
    pub injected: Vec<FormKey>,
    pub missing_masters: Vec<ModKey>,
    pub warnings: Vec<String>,
}

/// Finds records a plugin claims for another master that the master does not
/// actually define.
pub fn detect_injected_records(config: &mut ModConfiguration, ctx: &EngineContext) -> InjectionReport {
    let mut report = InjectionReport::default();
    let link_cache = ctx.link_cache.as_ref();
    for key in config.appearance_plugins() {
        let Some((plugin, source)) = ctx.plugins.try_get_plugin(&key, &config.folder_paths) else {
            report
                .warnings
                .push(format!("Plugin {key} not found in {}", config.display_name));
            continue;
        };
        let summary = ctx
            .override_cache
            .get_or_compute(&source, &key, || OverrideSummary::of(&plugin));
        for (master, records) in &summary.by_master {
            if config.owns_plugin(master) {
                continue;
            }
            if !link_cache.contains_plugin(master) {
                if !report.missing_masters.contains(master) {
                    report.missing_masters.push(master.clone());
                    report.warnings.push(format!(
                        "{}: master {master} of {key} is not in the load order; injected record scan is incomplete",
                        config.display_name
                    ));
                }
                continue;
            }
            for record in records {
                let defined = link_cache
                    .resolve_all_contexts(record)
                    .iter()
                    .any(|context| context.mod_key == *master);
                if !defined {
                    report.injected.push(record.clone());
                }
            }
        }
    }
    if !report.injected.is_empty() {
        config.handle_injected_records = true;
    }
    report
}

#[derive(Debug, Clone, Default)]
pub struct RescanReport {
    pub scanned: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rejected: usize,
    pub warnings: Vec<String>,
}

/// Rescans every configuration whose files changed (or all of them with
/// `force`) on a bounded pool of worker threads, then rebuilds the NPC index.
pub fn rescan_all(
    catalog: &mut Catalog,
    ctx: &EngineContext,
    force: bool,
    progress: Option<ProgressCallback>,
) -> RescanReport {
    let total_configs = catalog.configurations.len();
    let work: Vec<&mut ModConfiguration> = catalog
        .configurations
        .iter_mut()
        .filter(|config| force || needs_rescan(config.snapshot.as_ref(), &config.folder_paths))
        .collect();
    let total = work.len();
    let mut report = RescanReport {
        skipped: total_configs - total,
        ..RescanReport::default()
    };

    let workers = thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
        .min(total.max(1));
    let queue = Mutex::new(work);
    let outcomes: Mutex<Vec<(String, Result<ScanReport, String>)>> = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop();
                let Some(config) = next else {
                    break;
                };
                let name = config.display_name.clone();
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| scan_unit(config, ctx))) {
                    Ok(Ok(scan)) => Ok(scan),
                    Ok(Err(err)) => Err(format!("{err:?}")),
                    Err(payload) => {
                        config.snapshot = None;
                        Err(panic_message(payload.as_ref()))
                    }
                };
                if let Err(error) = &outcome {
                    LogFile::new(ctx.diagnostics_dir_for(&name).join("errors.log")).error(error);
                }
                let mut outcomes = outcomes.lock().unwrap_or_else(PoisonError::into_inner);
                outcomes.push((name.clone(), outcome));
                progress::report(progress.as_ref(), Stage::Rescanning, outcomes.len(), total, Some(name));
            });
        }
    });
    drop(queue);

    let mut outcomes = outcomes.into_inner().unwrap_or_else(PoisonError::into_inner);
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, outcome) in outcomes {
        match outcome {
            Ok(scan) => {
                report.scanned += 1;
                report.rejected += scan.rejected.len();
                report.warnings.extend(scan.warnings);
            }
            Err(error) => {
                report.failed += 1;
                let first_line = error.lines().next().unwrap_or("").to_string();
                report
                    .warnings
                    .push(format!("Rescan of {name} failed: {first_line}"));
            }
        }
    }
    catalog.rebuild_npc_index();
    report
}

fn scan_unit(config: &mut ModConfiguration, ctx: &EngineContext) -> Result<ScanReport> {
    for folder in &config.folder_paths {
        if !folder.is_dir() {
            bail!("folder {:?} does not exist", folder);
        }
    }
    let loose = FaceGenIndex::loose(&config.folder_paths);
    let archive = FaceGenIndex::archives(
        &config.folder_paths,
        &config.appearance_plugins(),
        ctx.archives.as_ref(),
    );
    let mut scan = rescan_configuration(config, &loose, &archive, ctx);
    check_merge_in_suitability(config, ctx);
    let injection = detect_injected_records(config, ctx);
    scan.warnings.extend(injection.warnings);
    config.snapshot = Some(ConfigSnapshot::of(&config.folder_paths));
    Ok(scan)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return format!("panic: {message}");
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return format!("panic: {message}");
    }
    "panic during rescan".to_string()
}

/// Where configurations come from besides the saved library.
#[derive(Debug, Clone, Default)]
pub struct CatalogSources {
    pub mods_root: Option<PathBuf>,
    pub mugshots_root: Option<PathBuf>,
    pub game_data_dir: Option<PathBuf>,
    pub load_order: Vec<ModKey>,
}

/// Builds the configuration list from saved configurations, mugshot-only
/// folders, mod-file-only folders and the base game.
pub fn populate_catalog(
    saved: Vec<ModConfiguration>,
    sources: &CatalogSources,
) -> (Vec<ModConfiguration>, Vec<String>) {
    let mut configs = saved;
    let mut notes = Vec::new();

    if let Some(root) = &sources.mugshots_root {
        for (name, dir) in subdirectories(root) {
            match configs.iter_mut().find(|config| config.is_named(&name)) {
                Some(config) => {
                    if !config.image_paths.contains(&dir) {
                        config.image_paths.push(dir);
                    }
                }
                None => {
                    let mut config = ModConfiguration::new(&name);
                    config.image_paths.push(dir);
                    notes.push(format!("Added mugshot-only configuration {name}"));
                    configs.push(config);
                }
            }
        }
    }

    if let Some(root) = &sources.mods_root {
        for (name, dir) in subdirectories(root) {
            if configs.iter().any(|config| config.folder_paths.contains(&dir)) {
                continue;
            }
            let plugins = plugin_files_in(&dir);
            if plugins.is_empty() && !has_asset_dirs(&dir) {
                continue;
            }
            match configs.iter_mut().find(|config| config.is_named(&name)) {
                Some(config) => {
                    config.folder_paths.push(dir);
                    for plugin in plugins {
                        if !config.plugins.contains(&plugin) {
                            config.plugins.push(plugin);
                        }
                    }
                    config.snapshot = None;
                }
                None => {
                    let mut config = ModConfiguration::new(&name);
                    config.folder_paths.push(dir);
                    config.plugins = plugins;
                    notes.push(format!("Added mod-folder configuration {name}"));
                    configs.push(config);
                }
            }
        }
    }

    if let Some(data_dir) = &sources.game_data_dir {
        if !configs.iter().any(|config| config.is_auto_generated) {
            if let Some(config) = base_game_configuration(data_dir, &sources.load_order) {
                notes.push(format!("Added {}", config.display_name));
                configs.push(config);
            }
        }
    }

    (configs, notes)
}

pub const BASE_GAME_CONFIGURATION: &str = "Base Game";

/// Official masters and Creation Club content from the game data folder.
pub fn base_game_configuration(data_dir: &Path, load_order: &[ModKey]) -> Option<ModConfiguration> {
    let plugins: Vec<ModKey> = load_order
        .iter()
        .filter(|key| crate::skyrim::is_official_plugin(key))
        .cloned()
        .collect();
    if plugins.is_empty() {
        return None;
    }
    let mut config = ModConfiguration::new(BASE_GAME_CONFIGURATION);
    config.folder_paths.push(data_dir.to_path_buf());
    config.plugins = plugins;
    config.is_auto_generated = true;
    config.merge_in_dependency_records = false;
    Some(config)
}

fn subdirectories(root: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut out: Vec<(String, PathBuf)> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().to_string();
            Some((name, path))
        })
        .collect();
    out.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));
    out
}

fn plugin_files_in(dir: &Path) -> Vec<ModKey> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut plugins: Vec<ModKey> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            ModKey::is_plugin_file(&name).then(|| ModKey::new(&name))
        })
        .collect();
    plugins.sort();
    plugins
}

fn has_asset_dirs(dir: &Path) -> bool {
    ["meshes", "textures"]
        .iter()
        .any(|name| crate::provenance::locate_dir(dir, name).is_some())
}

pub fn same_name(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

fn default_true() -> bool {
    true
}

fn default_search_depth() -> usize {
    DEFAULT_MAX_NESTED_SEARCH_DEPTH
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::fixtures::*;
    use crate::provenance::facegen_paths;
    use pretty_assertions::assert_eq;

    const HUMAN: &str = "013746:Skyrim.esm";
    const WOLF: &str = "01320A:Skyrim.esm";

    fn base_game() -> Plugin {
        plugin(
            "Skyrim.esm",
            &[],
            vec![
                race(HUMAN, true),
                race(WOLF, false),
                npc("001234:Skyrim.esm", "Lydia", HUMAN),
                npc("001235:Skyrim.esm", "Faendal", HUMAN),
            ],
        )
    }

    fn loose_for(npcs: &[&str]) -> FaceGenIndex {
        let mut index = FaceGenIndex::default();
        for key in npcs {
            index.insert(&facegen_paths(&fk(key)).mesh);
        }
        index
    }

    fn config_with(name: &str, plugins: &[&str], folder: &str) -> ModConfiguration {
        let mut config = ModConfiguration::new(name);
        config.plugins = plugins.iter().map(|p| mk(p)).collect();
        config.folder_paths = vec![PathBuf::from(folder)];
        config
    }

    #[test]
    fn rejects_creature_race_without_facegen() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MemoryPlugins::default());
        provider.add(
            "/mods/a",
            plugin("ModA.esp", &["Skyrim.esm"], vec![npc("001234:Skyrim.esm", "Lydia", WOLF)]),
        );
        let ctx = context(vec![base_game()], provider, dir.path());
        let mut config = config_with("ModA", &["ModA.esp"], "/mods/a");

        let report = rescan_configuration(
            &mut config,
            &FaceGenIndex::default(),
            &FaceGenIndex::default(),
            &ctx,
        );

        assert!(config.npcs.is_empty());
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(config.npc_count, 0);
        let log = fs::read_to_string(ctx.diagnostics_dir_for("ModA").join("scan.log")).unwrap();
        assert!(log.contains("Rejected 001234:Skyrim.esm"));
    }

    #[test]
    fn templated_npcs_skip_facegen_requirement() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MemoryPlugins::default());
        provider.add(
            "/mods/a",
            plugin(
                "ModA.esp",
                &["Skyrim.esm"],
                vec![
                    templated_npc("000800:ModA.esp", "Bandit", HUMAN, "001235:Skyrim.esm"),
                    npc("001234:Skyrim.esm", "Lydia", HUMAN),
                ],
            ),
        );
        let ctx = context(vec![base_game()], provider, dir.path());
        let mut config = config_with("ModA", &["ModA.esp"], "/mods/a");

        rescan_configuration(&mut config, &FaceGenIndex::default(), &FaceGenIndex::default(), &ctx);

        assert_eq!(
            config.npcs.iter().cloned().collect::<Vec<_>>(),
            vec![fk("000800:ModA.esp")]
        );
        assert!(config.notifications.contains_key(&fk("000800:ModA.esp")));
    }

    #[test]
    fn race_validity_is_recorded_per_npc() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MemoryPlugins::default());
        let mut raceless = templated_npc("000801:ModA.esp", "Guard", HUMAN, "001235:Skyrim.esm");
        raceless.npc_mut().unwrap().appearance.race = None;
        provider.add(
            "/mods/a",
            plugin(
                "ModA.esp",
                &["Skyrim.esm"],
                vec![
                    templated_npc("000800:ModA.esp", "Bandit", HUMAN, "001235:Skyrim.esm"),
                    raceless,
                ],
            ),
        );
        let ctx = context(vec![base_game()], provider, dir.path());
        let mut config = config_with("ModA", &["ModA.esp"], "/mods/a");
        rescan_configuration(&mut config, &FaceGenIndex::default(), &FaceGenIndex::default(), &ctx);

        let catalog = Catalog::new(vec![config]);
        assert!(catalog.npc(&fk("000800:ModA.esp")).unwrap().race_valid);
        assert!(!catalog.npc(&fk("000801:ModA.esp")).unwrap().race_valid);
    }

    #[test]
    fn unambiguous_npcs_have_no_stored_choice() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MemoryPlugins::default());
        provider.add(
            "/mods/a",
            plugin("ModA.esp", &["Skyrim.esm"], vec![npc("001234:Skyrim.esm", "Lydia", HUMAN)]),
        );
        provider.add(
            "/mods/a",
            plugin(
                "ModA Extra.esp",
                &["Skyrim.esm"],
                vec![
                    npc("001234:Skyrim.esm", "Lydia", HUMAN),
                    npc("001235:Skyrim.esm", "Faendal", HUMAN),
                ],
            ),
        );
        let ctx = context(vec![base_game()], provider, dir.path());
        let mut config = config_with("ModA", &["ModA.esp", "ModA Extra.esp"], "/mods/a");
        config
            .disambiguation
            .insert(fk("001235:Skyrim.esm"), mk("ModA.esp"));

        let loose = loose_for(&["001234:Skyrim.esm", "001235:Skyrim.esm"]);
        rescan_configuration(&mut config, &loose, &FaceGenIndex::default(), &ctx);

        assert_eq!(config.npcs.len(), 2);
        assert!(!config.disambiguation.contains_key(&fk("001235:Skyrim.esm")));
        assert!(config.ambiguous_npcs.contains(&fk("001234:Skyrim.esm")));
        // Neither plugin is in the load order and both have satisfiable
        // masters of equal depth: alphabetical.
        assert_eq!(
            config.disambiguation.get(&fk("001234:Skyrim.esm")),
            Some(&mk("ModA Extra.esp"))
        );
    }

    #[test]
    fn prior_valid_choice_survives_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MemoryPlugins::default());
        for name in ["A.esp", "B.esp"] {
            provider.add(
                "/mods/a",
                plugin(name, &["Skyrim.esm"], vec![npc("001234:Skyrim.esm", "Lydia", HUMAN)]),
            );
        }
        let ctx = context(vec![base_game()], provider, dir.path());
        let mut config = config_with("Mod", &["A.esp", "B.esp"], "/mods/a");
        config.disambiguation.insert(fk("001234:Skyrim.esm"), mk("B.esp"));
        let loose = loose_for(&["001234:Skyrim.esm"]);
        rescan_configuration(&mut config, &loose, &FaceGenIndex::default(), &ctx);
        assert_eq!(config.source_plugin(&fk("001234:Skyrim.esm")), Some(mk("B.esp")));
    }

    fn masters(table: &[(&str, &[&str])]) -> impl Fn(&ModKey) -> Option<Vec<ModKey>> {
        let table: HashMap<ModKey, Vec<ModKey>> = table
            .iter()
            .map(|(k, ms)| (mk(k), ms.iter().map(|m| mk(m)).collect()))
            .collect();
        move |key: &ModKey| table.get(key).cloned()
    }

    #[test]
    fn default_source_prefers_latest_in_load_order() {
        let order = vec![mk("Skyrim.esm"), mk("P2.esp"), mk("P1.esp")];
        let lookup = masters(&[]);
        let chosen = choose_default_source(&[mk("P1.esp"), mk("P2.esp")], &[], &order, &lookup);
        assert_eq!(chosen, Some(mk("P1.esp")));
    }

    #[test]
    fn default_source_prefers_deeper_master_chain() {
        let order = vec![mk("Skyrim.esm")];
        let lookup = masters(&[
            ("Skyrim.esm", &[]),
            ("P1.esp", &["Skyrim.esm"]),
            ("P2.esp", &["Skyrim.esm", "P1.esp"]),
        ]);
        let config = [mk("P1.esp"), mk("P2.esp")];
        let chosen = choose_default_source(&[mk("P1.esp"), mk("P2.esp")], &config, &order, &lookup);
        assert_eq!(chosen, Some(mk("P2.esp")));
    }

    #[test]
    fn default_source_breaks_depth_ties_alphabetically_within_tie() {
        let order = vec![mk("Skyrim.esm")];
        let lookup = masters(&[
            ("Skyrim.esm", &[]),
            ("Zeta.esp", &["Skyrim.esm"]),
            ("Beta.esp", &["Skyrim.esm"]),
            ("Alpha.esp", &["Missing.esm"]),
        ]);
        let candidates = [mk("Zeta.esp"), mk("Beta.esp"), mk("Alpha.esp")];
        let chosen = choose_default_source(&candidates, &candidates, &order, &lookup);
        assert_eq!(chosen, Some(mk("Beta.esp")));
    }

    #[test]
    fn default_source_falls_back_to_alphabetical() {
        let lookup = masters(&[("Zeta.esp", &["Gone.esm"])]);
        let candidates = [mk("Zeta.esp"), mk("beta.esp")];
        let chosen = choose_default_source(&candidates, &candidates, &[], &lookup);
        assert_eq!(chosen, Some(mk("beta.esp")));
    }

    #[test]
    fn single_source_updates_only_ambiguous_npcs() {
        let mut config = config_with("Mod", &["A.esp", "B.esp"], "/mods/a");
        let lydia = fk("001234:Skyrim.esm");
        let faendal = fk("001235:Skyrim.esm");
        config.npc_sources.insert(lydia.clone(), vec![mk("A.esp"), mk("B.esp")]);
        config.npc_sources.insert(faendal.clone(), vec![mk("A.esp")]);
        config.disambiguation.insert(lydia.clone(), mk("A.esp"));

        assert!(set_single_source(&mut config, &lydia, &mk("B.esp")));
        assert!(!set_single_source(&mut config, &lydia, &mk("B.esp")));
        assert!(!set_single_source(&mut config, &faendal, &mk("A.esp")));
        assert!(!set_single_source(&mut config, &lydia, &mk("Other.esp")));
        assert_eq!(config.source_plugin(&lydia), Some(mk("B.esp")));

        assert!(set_source_for_all_applicable(&mut config, &mk("A.esp")));
        assert_eq!(config.source_plugin(&lydia), Some(mk("A.esp")));
        assert!(!config.disambiguation.contains_key(&faendal));
    }

    #[test]
    fn merge_in_suitability_counts_record_types() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MemoryPlugins::default());
        provider.add(
            "/mods/a",
            plugin(
                "Quest.esp",
                &["Skyrim.esm"],
                vec![
                    npc("000800:Quest.esp", "Hero", HUMAN),
                    other("000801:Quest.esp", "QUST"),
                    other("000802:Quest.esp", "DIAL"),
                ],
            ),
        );
        let ctx = context(vec![base_game()], provider, dir.path());
        let mut config = config_with("Quest", &["Quest.esp"], "/mods/a");
        let result = check_merge_in_suitability(&mut config, &ctx);
        assert_eq!(result.appearance_records, 1);
        assert_eq!(result.other_records, 2);
        assert!(!result.suitable);
        assert!(!config.merge_in_dependency_records);

        config.merge_in_user_override = true;
        config.merge_in_dependency_records = true;
        check_merge_in_suitability(&mut config, &ctx);
        assert!(config.merge_in_dependency_records);
    }

    #[test]
    fn detects_injected_records_and_missing_masters() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MemoryPlugins::default());
        provider.add(
            "/mods/a",
            plugin(
                "ModA.esp",
                &["Skyrim.esm", "Absent.esm"],
                vec![
                    npc("001234:Skyrim.esm", "Lydia", HUMAN),
                    npc("00ABCD:Skyrim.esm", "Injected", HUMAN),
                    npc("000900:Absent.esm", "Elsewhere", HUMAN),
                ],
            ),
        );
        let ctx = context(vec![base_game()], provider, dir.path());
        let mut config = config_with("ModA", &["ModA.esp"], "/mods/a");
        let report = detect_injected_records(&mut config, &ctx);
        assert_eq!(report.injected, vec![fk("00ABCD:Skyrim.esm")]);
        assert_eq!(report.missing_masters, vec![mk("Absent.esm")]);
        assert_eq!(report.warnings.len(), 1);
        assert!(config.handle_injected_records);
    }

    #[test]
    fn rescan_all_isolates_failures_and_indexes_npcs() {
        let dir = tempfile::tempdir().unwrap();
        let good_dir = dir.path().join("good");
        let facegen = good_dir.join(facegen_paths(&fk("001234:Skyrim.esm")).mesh);
        fs::create_dir_all(facegen.parent().unwrap()).unwrap();
        fs::write(&facegen, b"nif").unwrap();

        let provider = Arc::new(MemoryPlugins::default());
        provider.add(
            good_dir.to_str().unwrap(),
            plugin("Good.esp", &["Skyrim.esm"], vec![npc("001234:Skyrim.esm", "Lydia", HUMAN)]),
        );
        let ctx = context(vec![base_game()], provider, dir.path());

        let mut good = ModConfiguration::new("Good");
        good.plugins = vec![mk("Good.esp")];
        good.folder_paths = vec![good_dir.clone()];
        let mut broken = ModConfiguration::new("Broken");
        broken.folder_paths = vec![dir.path().join("missing")];
        let mut catalog = Catalog::new(vec![good, broken]);

        let report = rescan_all(&mut catalog, &ctx, false, None);
        assert_eq!(report.scanned, 1);
        assert_eq!(report.failed, 1);
        assert!(report.warnings.iter().any(|w| w.contains("Broken")));
        let npc = catalog.npc(&fk("001234:Skyrim.esm")).unwrap();
        assert_eq!(npc.display_name, "Lydia");
        assert_eq!(npc.offered_by.get("Good"), Some(&Some(mk("Good.esp"))));
        assert!(catalog.configuration("good").unwrap().snapshot.is_some());

        let again = rescan_all(&mut catalog, &ctx, false, None);
        assert_eq!(again.skipped, 1);
        assert_eq!(again.scanned, 0);
    }

    #[test]
    fn removal_requires_empty_configuration() {
        let mut config = ModConfiguration::new("Mod");
        config.image_paths.push(PathBuf::from("/mugshots/Mod"));
        let mut catalog = Catalog::new(vec![config]);
        assert!(catalog.remove_configuration("mod").is_err());
        catalog.configuration_mut("Mod").unwrap().image_paths.clear();
        assert!(catalog.remove_configuration("MOD").is_ok());
        assert!(catalog.configurations.is_empty());
        assert!(catalog
            .add_configuration(ModConfiguration::new("Mod"))
            .is_ok());
        assert!(catalog
            .add_configuration(ModConfiguration::new("mod"))
            .is_err());
    }

    #[test]
    fn populates_from_all_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mods = dir.path().join("mods");
        let shots = dir.path().join("mugshots");
        fs::create_dir_all(mods.join("Pretty Faces")).unwrap();
        fs::write(mods.join("Pretty Faces").join("PrettyFaces.esp"), b"").unwrap();
        fs::create_dir_all(mods.join("Empty")).unwrap();
        fs::create_dir_all(shots.join("pretty faces")).unwrap();
        fs::create_dir_all(shots.join("Only Pictures")).unwrap();

        let saved = vec![ModConfiguration::new("Pretty Faces")];
        let sources = CatalogSources {
            mods_root: Some(mods.clone()),
            mugshots_root: Some(shots.clone()),
            game_data_dir: Some(dir.path().join("Data")),
            load_order: vec![mk("Skyrim.esm"), mk("Other.esp")],
        };
        let (configs, notes) = populate_catalog(saved, &sources);
        let names: Vec<&str> = configs.iter().map(|c| c.display_name.as_str()).collect();
        assert_eq!(names, vec!["Pretty Faces", "Only Pictures", BASE_GAME_CONFIGURATION]);
        assert_eq!(configs[0].plugins, vec![mk("PrettyFaces.esp")]);
        assert_eq!(configs[0].image_paths, vec![shots.join("pretty faces")]);
        assert!(configs[1].folder_paths.is_empty());
        assert_eq!(configs[2].plugins, vec![mk("Skyrim.esm")]);
        assert_eq!(notes.len(), 2);
    }
}
