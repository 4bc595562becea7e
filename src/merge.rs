use crate::{
    archive::{normalize_path, ArchiveFile, ArchiveReader},
    catalog::{Catalog, ModConfiguration, OverrideHandling},
    dump::write_plugin,
    environment::{EngineContext, Plugin, Record, RecordContext, RecordData},
    formkey::{FormKey, ModKey},
    log::LogFile,
    nif::{texture_references, texture_references_in_file},
    progress::{self, ProgressCallback, Stage},
    provenance::{facegen_paths, is_facegen_path, locate_file},
    selection::{Selection, SelectionTable},
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

const STAGING_DIR: &str = ".visagesmith-staging";
pub const RUN_REPORT_FILE: &str = "run_report.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatchingMode {
    /// Appearance fields are copied onto the record that wins in the load order.
    EasyNpcLike,
    /// The appearance mod's record is forwarded whole.
    Default,
}

impl Default for PatchingMode {
    fn default() -> Self {
        Self::EasyNpcLike
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingAssetPolicy {
    Warn,
    SkipNpc,
    AbortRun,
}

impl Default for MissingAssetPolicy {
    fn default() -> Self {
        Self::Warn
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub output_dir: Option<PathBuf>,
    pub output_plugin: ModKey,
    pub patching_mode: PatchingMode,
    pub missing_asset_policy: MissingAssetPolicy,
    pub copy_assets: bool,
    pub include_game_data_assets: bool,
    pub suppressed_missing_assets: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    PluginRecord,
    FaceGenOnly,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchedNpc {
    pub npc: FormKey,
    pub mod_name: String,
    pub kind: PatchKind,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub output_plugin: Option<PathBuf>,
    pub masters: Vec<ModKey>,
    pub patched: Vec<PatchedNpc>,
    pub skipped: Vec<(FormKey, String)>,
    pub records_written: usize,
    pub assets_copied: usize,
    pub missing_assets: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
#[error("run aborted: {npc} is missing {asset}")]
pub struct MissingAssetAbort {
    pub npc: FormKey,
    pub asset: String,
}

#[derive(Debug, Clone)]
enum AssetSource {
    Loose(PathBuf),
    Archive(ArchiveFile),
    GameData(PathBuf),
}

type DuplicationKey = (ModKey, ModKey);

/// Everything one NPC contributes; applied only when the NPC succeeds.
struct NpcPatch {
    result: PatchedNpc,
    records: Vec<Record>,
    visited: Vec<(DuplicationKey, FormKey)>,
    assets: Vec<(String, AssetSource)>,
    missing: Vec<String>,
    warnings: Vec<String>,
}

enum NpcStep {
    Patched(NpcPatch),
    Skipped(String),
}

struct RunState {
    output: Plugin,
    duplicated: HashMap<DuplicationKey, HashSet<FormKey>>,
    copies: BTreeMap<String, AssetSource>,
    report: RunReport,
}

impl RunState {
    fn commit(&mut self, patch: NpcPatch) {
        for record in patch.records {
            self.output.upsert(record);
        }
        for (key, form_key) in patch.visited {
            self.duplicated.entry(key).or_default().insert(form_key);
        }
        for (dest, source) in patch.assets {
            self.copies.entry(dest).or_insert(source);
        }
        self.report.missing_assets.extend(patch.missing);
        self.report.warnings.extend(patch.warnings);
        self.report.patched.push(patch.result);
    }
}

/// Builds the output plugin and asset tree from the selection table.
pub fn run_patch(
    catalog: &Catalog,
    table: &SelectionTable,
    ctx: &EngineContext,
    settings: &RunSettings,
    progress: Option<ProgressCallback>,
) -> Result<RunReport> {
    let Some(output_dir) = settings.output_dir.as_deref() else {
        bail!("output directory is not set");
    };
    if catalog.configurations.is_empty() {
        bail!("no appearance configurations are loaded");
    }
    if ctx.link_cache.load_order().is_empty() {
        bail!("game environment is not available (empty load order)");
    }
    if table.selections.is_empty() {
        bail!("no NPC has a selected appearance");
    }

    let run_log = LogFile::new(ctx.diagnostics_dir.join("run.log"));
    run_log.truncate();
    run_log.info(&format!(
        "Patching {} NPCs into {}",
        table.selections.len(),
        settings.output_plugin
    ));
    let staging = output_dir.join(STAGING_DIR);
    let mut state = RunState {
        output: Plugin::new(settings.output_plugin.clone(), Vec::new(), Vec::new()),
        duplicated: HashMap::new(),
        copies: BTreeMap::new(),
        report: RunReport::default(),
    };

    let total = table.selections.len();
    for (idx, (npc, selection)) in table.selections.iter().enumerate() {
        progress::report(progress.as_ref(), Stage::Patching, idx, total, Some(npc.to_string()));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            NpcJob::prepare(npc, selection, catalog, ctx, settings, &staging, &state)
                .and_then(|job| match job {
                    Ok(job) => job.run(),
                    Err(reason) => Ok(NpcStep::Skipped(reason)),
                })
        }));
        match outcome {
            Ok(Ok(NpcStep::Patched(patch))) => {
                for warning in &patch.warnings {
                    run_log.warn(warning);
                }
                state.commit(patch);
            }
            Ok(Ok(NpcStep::Skipped(reason))) => {
                run_log.warn(&format!("Skipped {npc}: {reason}"));
                state.report.skipped.push((npc.clone(), reason));
            }
            Ok(Err(err)) if err.is::<MissingAssetAbort>() => {
                run_log.error(&err.to_string());
                let _ = fs::remove_dir_all(&staging);
                return Err(err);
            }
            Ok(Err(err)) => {
                let reason = format!("{err:#}");
                LogFile::new(ctx.diagnostics_dir_for(&selection.mod_name).join("errors.log"))
                    .error(&format!("{npc}: {err:?}"));
                run_log.error(&format!("Failed {npc}: {reason}"));
                state.report.skipped.push((npc.clone(), reason));
            }
            Err(_) => {
                let reason = "unexpected panic while patching".to_string();
                LogFile::new(ctx.diagnostics_dir_for(&selection.mod_name).join("errors.log"))
                    .error(&format!("{npc}: {reason}"));
                state.report.skipped.push((npc.clone(), reason));
            }
        }
    }

    if settings.copy_assets {
        copy_assets(&mut state, output_dir, progress.as_ref(), &run_log);
    }
    let _ = fs::remove_dir_all(&staging);

    state.output.masters = compute_masters(&state.output, ctx);
    state.report.masters = state.output.masters.clone();
    state.report.records_written = state.output.records.len();
    if state.output.records.is_empty() {
        state
            .report
            .warnings
            .push("No records were written; the output plugin was not created".to_string());
    } else {
        let path = write_plugin(&state.output, output_dir)?;
        state.report.output_plugin = Some(path);
    }

    fs::create_dir_all(output_dir).with_context(|| format!("create {:?}", output_dir))?;
    let report_path = output_dir.join(RUN_REPORT_FILE);
    let raw = serde_json::to_string_pretty(&state.report).context("serialize run report")?;
    fs::write(&report_path, raw).with_context(|| format!("write {:?}", report_path))?;
    run_log.info(&format!(
        "Run finished: {} patched, {} skipped, {} assets",
        state.report.patched.len(),
        state.report.skipped.len(),
        state.report.assets_copied
    ));
    Ok(state.report)
}

fn copy_assets(
    state: &mut RunState,
    output_dir: &Path,
    progress: Option<&ProgressCallback>,
    run_log: &LogFile,
) {
    let total = state.copies.len();
    for (idx, (dest_rel, source)) in state.copies.iter().enumerate() {
        progress::report(progress, Stage::CopyingAssets, idx, total, Some(dest_rel.clone()));
        let dest = output_dir.join(dest_rel);
        match copy_asset(source, &dest) {
            Ok(()) => state.report.assets_copied += 1,
            Err(err) => {
                let message = format!("Could not copy {dest_rel}: {err:#}");
                run_log.warn(&message);
                state.report.warnings.push(message);
            }
        }
    }
}

fn copy_asset(source: &AssetSource, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    match source {
        AssetSource::Loose(path) | AssetSource::GameData(path) => {
            fs::copy(path, dest).with_context(|| format!("copy {:?}", path))?;
            let meta = fs::metadata(path).context("stat copied asset")?;
            let mtime = filetime::FileTime::from_last_modification_time(&meta);
            filetime::set_file_mtime(dest, mtime).context("keep asset timestamp")?;
        }
        AssetSource::Archive(file) => {
            file.archive
                .extract(&file.entry, dest)
                .with_context(|| format!("extract {file:?}"))?;
        }
    }
    Ok(())
}

/// Load-order plugins the output records point into, in load order.
fn compute_masters(output: &Plugin, ctx: &EngineContext) -> Vec<ModKey> {
    let mut used: BTreeSet<ModKey> = BTreeSet::new();
    for record in &output.records {
        used.insert(record.form_key.mod_key.clone());
        for link in record.links() {
            used.insert(link.mod_key);
        }
    }
    ctx.link_cache
        .load_order()
        .iter()
        .filter(|key| **key != output.mod_key && used.contains(*key))
        .cloned()
        .collect()
}

/// The winning version of a record, ignoring a previous output plugin.
fn winning(ctx: &EngineContext, form_key: &FormKey, output: &ModKey) -> Option<RecordContext> {
    ctx.link_cache
        .resolve_all_contexts(form_key)
        .into_iter()
        .find(|context| context.mod_key != *output)
}

fn original(ctx: &EngineContext, form_key: &FormKey, output: &ModKey) -> Option<RecordContext> {
    ctx.link_cache
        .resolve_all_contexts(form_key)
        .into_iter()
        .filter(|context| context.mod_key != *output)
        .last()
}

pub fn is_suppressed(relative: &str, suppressed: &[String]) -> bool {
    let relative = normalize_path(relative);
    suppressed
        .iter()
        .map(|entry| normalize_path(entry))
        .any(|entry| !entry.is_empty() && relative.starts_with(&entry))
}

fn mesh_path(raw: &str) -> String {
    prefixed(raw, "meshes/")
}

fn texture_path(raw: &str) -> String {
    prefixed(raw, "textures/")
}

fn prefixed(raw: &str, root: &str) -> String {
    let path = normalize_path(raw);
    let path = path.strip_prefix("data/").unwrap_or(&path);
    if path.starts_with(root) {
        path.to_string()
    } else {
        format!("{root}{path}")
    }
}

/// Finds assets for one configuration: loose files (first folder wins), then
/// archives (last folder wins), then optionally the game data folder.
struct AssetResolver<'a> {
    folders: &'a [PathBuf],
    readers: Vec<Arc<dyn ArchiveReader>>,
    ctx: &'a EngineContext,
    include_game_data: bool,
}

impl<'a> AssetResolver<'a> {
    fn new(
        config: &'a ModConfiguration,
        source_plugin: Option<&ModKey>,
        ctx: &'a EngineContext,
        include_game_data: bool,
    ) -> Self {
        let mut plugins: Vec<&ModKey> = source_plugin.into_iter().collect();
        plugins.extend(
            config
                .plugins
                .iter()
                .filter(|plugin| Some(*plugin) != source_plugin),
        );
        let mut readers = Vec::new();
        for folder in config.folder_paths.iter().rev() {
            for plugin in &plugins {
                readers.extend(ctx.archives.open_archive_readers(folder, plugin));
            }
        }
        Self {
            folders: &config.folder_paths,
            readers,
            ctx,
            include_game_data,
        }
    }

    fn resolve(&self, relative: &str) -> Option<AssetSource> {
        if let Some(path) = self
            .folders
            .iter()
            .find_map(|folder| locate_file(folder, relative))
        {
            return Some(AssetSource::Loose(path));
        }
        if let Some(file) = self.ctx.archives.have_file(relative, &self.readers) {
            return Some(AssetSource::Archive(file));
        }
        if self.include_game_data && !is_facegen_path(relative) {
            return locate_file(&self.ctx.game_data_dir, relative).map(AssetSource::GameData);
        }
        None
    }
}

struct NpcJob<'a> {
    target: &'a FormKey,
    selection: &'a Selection,
    config: &'a ModConfiguration,
    ctx: &'a EngineContext,
    settings: &'a RunSettings,
    staging: &'a Path,
    state: &'a RunState,
    source_plugin: Option<Arc<Plugin>>,
    config_plugins: Vec<Arc<Plugin>>,
    resolver: AssetResolver<'a>,
    patch: NpcPatch,
}

impl<'a> NpcJob<'a> {
    /// `Ok(Err(reason))` when the NPC cannot be patched from its selection.
    fn prepare(
        target: &'a FormKey,
        selection: &'a Selection,
        catalog: &'a Catalog,
        ctx: &'a EngineContext,
        settings: &'a RunSettings,
        staging: &'a Path,
        state: &'a RunState,
    ) -> Result<std::result::Result<Self, String>> {
        let Some(config) = catalog.configuration(&selection.mod_name) else {
            return Ok(Err(format!(
                "configuration {:?} no longer exists",
                selection.mod_name
            )));
        };
        let config_plugins: Vec<Arc<Plugin>> = config
            .plugins
            .iter()
            .filter_map(|key| ctx.plugins.try_get_plugin(key, &config.folder_paths))
            .map(|(plugin, _)| plugin)
            .collect();
        let source_key = config.source_plugin(&selection.source_npc);
        if source_key.is_none() && config.candidate_plugins(&selection.source_npc).len() > 1 {
            return Ok(Err(format!(
                "{} is defined by several plugins of {} and none is chosen",
                selection.source_npc, config.display_name
            )));
        }
        let source_plugin = source_key.as_ref().and_then(|key| {
            config_plugins
                .iter()
                .find(|plugin| plugin.mod_key == *key)
                .cloned()
        });
        let resolver = AssetResolver::new(config, source_key.as_ref(), ctx, settings.include_game_data_assets);
        Ok(Ok(Self {
            target,
            selection,
            config,
            ctx,
            settings,
            staging,
            state,
            source_plugin,
            config_plugins,
            resolver,
            patch: NpcPatch {
                result: PatchedNpc {
                    npc: target.clone(),
                    mod_name: config.display_name.clone(),
                    kind: PatchKind::PluginRecord,
                },
                records: Vec::new(),
                visited: Vec::new(),
                assets: Vec::new(),
                missing: Vec::new(),
                warnings: Vec::new(),
            },
        }))
    }

    fn run(mut self) -> Result<NpcStep> {
        let output = self.settings.output_plugin.clone();
        let source_record = self
            .source_plugin
            .as_ref()
            .and_then(|plugin| plugin.record(&self.selection.source_npc))
            .filter(|record| record.npc().is_some())
            .cloned();
        let winner = winning(self.ctx, self.target, &output).map(|context| context.record);

        let record = match source_record {
            Some(source) => {
                let record = match self.settings.patching_mode {
                    PatchingMode::EasyNpcLike => {
                        let mut base = winner
                            .as_deref()
                            .cloned()
                            .unwrap_or_else(|| source.clone());
                        base.form_key = self.target.clone();
                        copy_appearance(&source, &mut base, self.config.include_outfits);
                        base
                    }
                    PatchingMode::Default => {
                        let mut forwarded = source.clone();
                        forwarded.form_key = self.target.clone();
                        forwarded
                    }
                };
                self.patch.result.kind = PatchKind::PluginRecord;
                record
            }
            None => {
                let base = match self.settings.patching_mode {
                    PatchingMode::EasyNpcLike => winner.map(|record| record.as_ref().clone()),
                    PatchingMode::Default => {
                        original(self.ctx, self.target, &output).map(|context| context.record.as_ref().clone())
                    }
                };
                let Some(base) = base else {
                    return Ok(NpcStep::Skipped(format!(
                        "{} offers no record for {} and it is not in the load order",
                        self.config.display_name, self.target
                    )));
                };
                if !self.has_facegen() {
                    return Ok(NpcStep::Skipped(format!(
                        "{} offers neither a record nor FaceGen for {}",
                        self.config.display_name, self.selection.source_npc
                    )));
                }
                self.patch.result.kind = PatchKind::FaceGenOnly;
                base
            }
        };

        let uses_traits = record.npc().map(|npc| npc.use_traits).unwrap_or(false);
        if self.patch.result.kind == PatchKind::PluginRecord {
            self.duplicate_dependencies(&record);
        }
        if self.settings.copy_assets {
            if let Some(reason) = self.collect_assets(&record, uses_traits)? {
                return Ok(NpcStep::Skipped(reason));
            }
        }
        self.patch.records.push(record);
        Ok(NpcStep::Patched(self.patch))
    }

    fn has_facegen(&self) -> bool {
        facegen_paths(&self.selection.source_npc)
            .both()
            .iter()
            .any(|path| self.resolver.resolve(path).is_some())
    }

    /// Looks a record up in the configuration's plugins, source plugin first.
    fn lookup_in_config(&self, form_key: &FormKey) -> Option<(Record, ModKey)> {
        self.source_plugin
            .iter()
            .chain(self.config_plugins.iter())
            .find_map(|plugin| {
                plugin
                    .record(form_key)
                    .map(|record| (record.clone(), plugin.mod_key.clone()))
            })
    }

    fn already_present(&self, form_key: &FormKey, key: &DuplicationKey) -> bool {
        self.state.output.record(form_key).is_some()
            || self.patch.records.iter().any(|r| r.form_key == *form_key)
            || self
                .state
                .duplicated
                .get(key)
                .map(|seen| seen.contains(form_key))
                .unwrap_or(false)
            || self.patch.visited.iter().any(|(k, f)| k == key && f == form_key)
    }

    /// Copies referenced records the load order cannot supply, so the output
    /// plugin is self-contained.
    fn duplicate_dependencies(&mut self, root: &Record) {
        let output = self.settings.output_plugin.clone();
        let source_key = self
            .source_plugin
            .as_ref()
            .map(|plugin| plugin.mod_key.clone())
            .unwrap_or_else(|| output.clone());
        let max_depth = self.config.max_nested_search_depth;

        let mut queue: VecDeque<(FormKey, usize, ModKey)> = root
            .links()
            .into_iter()
            .map(|link| (link, 1, source_key.clone()))
            .collect();
        while let Some((link, depth, referencing)) = queue.pop_front() {
            let cache_key = (source_key.clone(), referencing);
            if self.already_present(&link, &cache_key) {
                continue;
            }
            if depth > max_depth {
                self.patch.warnings.push(format!(
                    "{}: stopped following references at {link} (depth {max_depth})",
                    self.target
                ));
                continue;
            }
            self.patch.visited.push((cache_key, link.clone()));

            let local = self.lookup_in_config(&link);
            let winner = winning(self.ctx, &link, &output);
            let owner_loaded = self.ctx.link_cache.contains_plugin(&link.mod_key);
            let staged = match (local, winner) {
                (Some((record, plugin)), None) => {
                    if owner_loaded && !self.config.handle_injected_records {
                        self.patch.warnings.push(format!(
                            "{}: {link} is injected into {} by {plugin}; enable injected record handling to merge it",
                            self.target, link.mod_key
                        ));
                        None
                    } else if !self.config.merge_in_dependency_records
                        && !record.is_appearance_type()
                        && record.race().is_none()
                    {
                        self.patch.warnings.push(format!(
                            "{}: {link} ({}) from {plugin} is not merged in",
                            self.target,
                            record.kind_label()
                        ));
                        None
                    } else {
                        Some((record, plugin))
                    }
                }
                (Some((record, plugin)), Some(winner)) => {
                    if let (Some(_), Some(_)) = (record.race(), winner.record.race()) {
                        race_delta(&record, &winner.record).map(|patched| (patched, plugin))
                    } else if self.config.override_handling == OverrideHandling::Include
                        && record != *winner.record
                    {
                        Some((record, plugin))
                    } else {
                        None
                    }
                }
                (None, Some(_)) => None,
                (None, None) => {
                    self.patch
                        .warnings
                        .push(format!("{}: reference {link} could not be resolved", self.target));
                    None
                }
            };

            if let Some((record, plugin)) = staged {
                for next in record.links() {
                    queue.push_back((next, depth + 1, plugin.clone()));
                }
                self.patch.records.push(record);
            }
        }
    }

    /// Returns a skip reason when a missing asset skips the NPC.
    fn collect_assets(&mut self, record: &Record, uses_traits: bool) -> Result<Option<String>> {
        let source_facegen = facegen_paths(&self.selection.source_npc);
        let target_facegen = facegen_paths(self.target);
        let mut wanted: Vec<(String, String, bool)> = vec![
            (source_facegen.mesh.clone(), target_facegen.mesh.clone(), !uses_traits),
            (source_facegen.texture.clone(), target_facegen.texture.clone(), !uses_traits),
        ];
        if self.patch.result.kind == PatchKind::PluginRecord {
            for path in self.extra_assets(record) {
                wanted.push((path.clone(), path, true));
            }
        }

        let mut meshes: Vec<(String, AssetSource)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for (source_rel, dest_rel, required) in wanted {
            if !seen.insert(dest_rel.clone()) {
                continue;
            }
            match self.resolver.resolve(&source_rel) {
                Some(found) => {
                    if dest_rel.ends_with(".nif") {
                        meshes.push((source_rel.clone(), found.clone()));
                    }
                    self.patch.assets.push((dest_rel, found));
                }
                None if required => {
                    if let Some(reason) = self.missing(&source_rel)? {
                        return Ok(Some(reason));
                    }
                }
                None => {}
            }
        }

        // Textures baked into meshes.
        for (mesh_rel, found) in meshes {
            let textures = match &found {
                AssetSource::Loose(path) | AssetSource::GameData(path) => {
                    texture_references_in_file(path)?
                }
                AssetSource::Archive(file) => {
                    let staged = self.staging.join(&mesh_rel);
                    self.ctx
                        .archives
                        .extract_file(file, &staged)
                        .with_context(|| format!("extract {file:?}"))?;
                    let bytes = fs::read(&staged).with_context(|| format!("read {:?}", staged))?;
                    texture_references(&bytes)
                }
            };
            for texture in textures {
                if !seen.insert(texture.clone()) {
                    continue;
                }
                if let Some(found) = self.resolver.resolve(&texture) {
                    self.patch.assets.push((texture, found));
                }
            }
        }
        Ok(None)
    }

    fn missing(&mut self, relative: &str) -> Result<Option<String>> {
        if is_suppressed(relative, &self.settings.suppressed_missing_assets) {
            return Ok(None);
        }
        match self.settings.missing_asset_policy {
            MissingAssetPolicy::Warn => {
                self.patch
                    .missing
                    .push(format!("{} ({}): {relative}", self.target, self.config.display_name));
                Ok(None)
            }
            MissingAssetPolicy::SkipNpc => Ok(Some(format!("missing asset {relative}"))),
            MissingAssetPolicy::AbortRun => Err(MissingAssetAbort {
                npc: self.target.clone(),
                asset: relative.to_string(),
            }
            .into()),
        }
    }

    /// Meshes and textures of head parts (with extra parts), head texture and
    /// worn armor provided by the configuration's own plugins.
    fn extra_assets(&self, record: &Record) -> Vec<String> {
        let Some(npc) = record.npc() else {
            return Vec::new();
        };
        let look = &npc.appearance;
        let mut out: Vec<String> = Vec::new();
        let mut visited: HashSet<FormKey> = HashSet::new();
        let mut pending: Vec<FormKey> = look.head_parts.clone();
        pending.extend(look.head_texture.iter().cloned());
        pending.extend(look.worn_armor.iter().cloned());

        while let Some(key) = pending.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            let Some((record, _)) = self.lookup_in_config(&key) else {
                continue;
            };
            match &record.data {
                RecordData::HeadPart(part) => {
                    out.extend(part.model.iter().map(|model| mesh_path(model)));
                    pending.extend(part.texture_set.iter().cloned());
                    pending.extend(part.extra_parts.iter().cloned());
                }
                RecordData::TextureSet(set) => {
                    out.extend(set.textures.values().map(|path| texture_path(path)));
                }
                RecordData::Armor(armor) => pending.extend(armor.armature.iter().cloned()),
                RecordData::ArmorAddon(addon) => {
                    out.extend(addon.models.iter().map(|model| mesh_path(model)));
                    pending.extend(addon.skin_textures.iter().cloned());
                }
                _ => {}
            }
        }
        out.sort();
        out.dedup();
        out
    }
}

/// Copies the appearance of `source` onto `base`.
fn copy_appearance(source: &Record, base: &mut Record, include_outfit: bool) {
    let (Some(from), Some(to)) = (source.npc(), base.npc_mut()) else {
        return;
    };
    to.appearance = from.appearance.clone();
    if from.use_traits {
        to.use_traits = true;
        to.template = from.template.clone();
    }
    if include_outfit {
        to.outfit = from.outfit.clone();
    }
}

/// The winning race with only the properties the source changes. None when
/// nothing differs.
fn race_delta(source: &Record, winner: &Record) -> Option<Record> {
    let (Some(from), Some(base)) = (source.race(), winner.race()) else {
        return None;
    };
    let mut patched = winner.clone();
    let mut changed = false;
    if let RecordData::Race(race) = &mut patched.data {
        if from.face_gen_head != base.face_gen_head {
            race.face_gen_head = from.face_gen_head;
            changed = true;
        }
        if from.has_head_data != base.has_head_data {
            race.has_head_data = from.has_head_data;
            changed = true;
        }
        for (name, value) in &from.properties {
            if base.properties.get(name) != Some(value) {
                race.properties.insert(name.clone(), value.clone());
                changed = true;
            }
        }
    }
    changed.then_some(patched)
}
