use crate::{
    archive::ZipArchiveAccess,
    backup,
    catalog::{
        check_merge_in_suitability, detect_injected_records, populate_catalog, rescan_all,
        same_name, set_single_source, set_source_for_all_applicable, Catalog, CatalogSources,
        InjectionReport, MergeInSuitability, RescanReport,
    },
    config::AppConfig,
    dump::DumpPluginProvider,
    environment::{EngineContext, GameEnvironment, LinkCache, OverrideCache},
    formkey::{FormKey, ModKey},
    library::Library,
    log::{LogEntry, LogFile, LogLevel},
    merge::{run_patch, RunReport},
    portrait::PortraitFetcher,
    progress::ProgressCallback,
    selection::{
        preview_import, Arbiter, BatchOptions, BatchReport, EngineEvent, GuestAppearance,
        ImportPreview, Selection,
    },
    skyrim,
    template::{resolve_template_chain, TemplateChain},
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, TryRecvError},
        Arc,
    },
    time::Duration,
};

const LOG_CAPACITY: usize = 500;
const PORTRAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct NpcOverview {
    pub key: FormKey,
    pub display_name: String,
    pub offered_by: Vec<String>,
    pub selection: Option<Selection>,
    pub guests: Vec<GuestAppearance>,
    pub borrowed_by: Vec<FormKey>,
}

pub struct App {
    pub data_dir: PathBuf,
    pub config: AppConfig,
    pub catalog: Catalog,
    pub arbiter: Arbiter,
    pub ctx: EngineContext,
    pub load_order: Vec<ModKey>,
    pub logs: Vec<LogEntry>,
    /// NPCs whose selection changed since the library was last saved.
    pub changed: BTreeSet<FormKey>,
    pub portraits: PortraitFetcher,
    events: Receiver<EngineEvent>,
    log: LogFile,
}

impl App {
    pub fn initialize(data_dir: &Path) -> Result<Self> {
        let config = AppConfig::load_or_create(data_dir)?;
        let library = Library::load_or_create(data_dir)?;
        let log = LogFile::new(data_dir.join("visagesmith.log"));
        let mut startup_warnings = Vec::new();

        let load_order = match &config.plugins_txt {
            Some(path) => match skyrim::read_load_order(path) {
                Ok(order) => order,
                Err(err) => {
                    startup_warnings.push(format!("Load order unavailable: {err:#}"));
                    Vec::new()
                }
            },
            None => {
                startup_warnings.push("plugins.txt is not configured".to_string());
                Vec::new()
            }
        };

        let sources = CatalogSources {
            mods_root: config.mods_root.clone(),
            mugshots_root: config.mugshots_root.clone(),
            game_data_dir: config.game_data_dir.clone(),
            load_order: load_order.clone(),
        };
        let (configurations, notes) = populate_catalog(library.configurations, &sources);
        let catalog = Catalog::new(configurations);

        let mod_folders: Vec<PathBuf> = catalog
            .configurations
            .iter()
            .flat_map(|config| config.folder_paths.iter().cloned())
            .collect();
        let (ctx, env_warnings) = build_context(&config, &load_order, &mod_folders, data_dir);
        startup_warnings.extend(env_warnings);

        let (events_tx, events_rx) = mpsc::channel();
        let arbiter = Arbiter::new(library.selections).with_events(events_tx);

        let mut app = Self {
            data_dir: data_dir.to_path_buf(),
            config,
            catalog,
            arbiter,
            ctx,
            load_order,
            logs: Vec::new(),
            changed: BTreeSet::new(),
            portraits: PortraitFetcher::new(),
            events: events_rx,
            log,
        };
        for warning in startup_warnings {
            app.log_warn(warning);
        }
        for note in notes {
            app.log_info(note);
        }
        app.save_library()?;
        Ok(app)
    }

    pub fn log_info(&mut self, message: String) {
        self.push_log(LogLevel::Info, message);
    }

    pub fn log_warn(&mut self, message: String) {
        self.push_log(LogLevel::Warn, message);
    }

    pub fn log_error(&mut self, message: String) {
        self.push_log(LogLevel::Error, message);
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            message: message.clone(),
        });
        if self.logs.len() > LOG_CAPACITY {
            let overflow = self.logs.len() - LOG_CAPACITY;
            self.logs.drain(0..overflow);
        }
        self.log.write(level, &message);
    }

    pub fn library_snapshot(&self) -> Library {
        Library {
            configurations: self.catalog.configurations.clone(),
            selections: self.arbiter.table().clone(),
        }
    }

    pub fn save_library(&mut self) -> Result<()> {
        self.poll_events();
        self.library_snapshot().save(&self.data_dir)?;
        self.changed.clear();
        Ok(())
    }

    /// Drains engine notifications into the pending-save set.
    pub fn poll_events(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.events.try_recv() {
                Ok(EngineEvent::SelectionChanged { npc, .. }) => {
                    self.changed.insert(npc);
                    handled += 1;
                }
                Ok(EngineEvent::GuestsChanged { target }) => {
                    self.changed.insert(target);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        handled
    }

    fn backup(&mut self, reason: &str) -> Result<PathBuf> {
        let dir = backup::create_backup(&self.data_dir, &self.library_snapshot(), Some(reason))?;
        self.log_info(format!("Backup written to {}", dir.display()));
        Ok(dir)
    }

    pub fn rescan(&mut self, force: bool, progress: Option<ProgressCallback>) -> Result<RescanReport> {
        let report = rescan_all(&mut self.catalog, &self.ctx, force, progress);
        self.log_info(format!(
            "Rescan: {} scanned, {} unchanged, {} failed, {} NPCs rejected",
            report.scanned, report.skipped, report.failed, report.rejected
        ));
        for warning in report.warnings.clone() {
            self.log_warn(warning);
        }
        self.save_library()?;
        Ok(report)
    }

    fn configuration_name(&self, name: &str) -> Result<String> {
        self.catalog
            .configuration(name)
            .map(|config| config.display_name.clone())
            .with_context(|| format!("unknown configuration {name:?}"))
    }

    pub fn template_chain(&self, name: &str, npc: &FormKey) -> Result<TemplateChain> {
        let config = self
            .catalog
            .configuration(name)
            .with_context(|| format!("unknown configuration {name:?}"))?;
        Ok(resolve_template_chain(npc, config, &self.ctx)?)
    }

    pub fn select(&mut self, npc: &FormKey, name: &str) -> Result<bool> {
        let name = self.configuration_name(name)?;
        let offered = self
            .catalog
            .configuration(&name)
            .map(|config| config.npcs.contains(npc))
            .unwrap_or(false);
        if !offered {
            bail!("{name} does not offer {npc}");
        }
        let changed = self.arbiter.select(npc, &name, npc);
        self.save_library()?;
        Ok(changed)
    }

    pub fn clear(&mut self, npc: &FormKey) -> Result<bool> {
        let cleared = self.arbiter.clear(npc).is_some();
        self.save_library()?;
        Ok(cleared)
    }

    pub fn add_guest(&mut self, target: &FormKey, name: &str, source: &FormKey) -> Result<bool> {
        let name = self.configuration_name(name)?;
        if !self.catalog.is_known_npc(target) {
            bail!("{target} is not a cataloged NPC");
        }
        let source_name = self
            .catalog
            .npc(source)
            .filter(|record| record.offered_by.keys().any(|offered| offered == &name))
            .map(|record| record.display_name.clone())
            .with_context(|| format!("{name} does not offer {source}"))?;
        let added = self.arbiter.add_guest(
            target,
            GuestAppearance {
                mod_name: name,
                source_npc: source.clone(),
                source_name,
            },
        );
        self.save_library()?;
        Ok(added)
    }

    /// Selects a guest appearance previously offered to `target`.
    pub fn select_guest(&mut self, target: &FormKey, name: &str, source: &FormKey) -> Result<bool> {
        let name = self.configuration_name(name)?;
        let offered = self
            .arbiter
            .guests(target)
            .iter()
            .any(|guest| same_name(&guest.mod_name, &name) && guest.source_npc == *source);
        if !offered {
            bail!("{target} has no guest {source} from {name}");
        }
        let changed = self.arbiter.select(target, &name, source);
        self.save_library()?;
        Ok(changed)
    }

    pub fn remove_guest(&mut self, target: &FormKey, name: &str, source: &FormKey) -> Result<bool> {
        let name = self.configuration_name(name)?;
        let removed = self.arbiter.remove_guest(target, &name, source);
        if removed {
            self.log_info(format!("Removed guest {source} ({name}) from {target}"));
        }
        self.save_library()?;
        Ok(removed)
    }

    /// Replaces the folders of configuration `name`; the next rescan picks it up.
    pub fn set_folders(&mut self, name: &str, folders: Vec<PathBuf>) -> Result<()> {
        let name = self.configuration_name(name)?;
        for folder in &folders {
            if !folder.is_dir() {
                bail!("{} is not a directory", folder.display());
            }
        }
        self.catalog.set_folder_paths(&name, folders)?;
        self.log_info(format!("Updated folders of {name}"));
        self.save_library()
    }

    /// Everything known about one NPC: who offers it, what is chosen, and
    /// who borrows its appearance.
    pub fn npc_overview(&self, npc: &FormKey) -> Result<NpcOverview> {
        let record = self
            .catalog
            .npc(npc)
            .with_context(|| format!("{npc} is not a cataloged NPC"))?;
        Ok(NpcOverview {
            key: npc.clone(),
            display_name: record.display_name.clone(),
            offered_by: self
                .catalog
                .configurations_offering(npc)
                .into_iter()
                .map(|config| config.display_name.clone())
                .collect(),
            selection: self.arbiter.selection(npc).cloned(),
            guests: self.arbiter.guests(npc).to_vec(),
            borrowed_by: self.arbiter.table().borrowers_of(npc),
        })
    }

    pub fn select_all(&mut self, name: &str, only_unselected: bool) -> Result<BatchReport> {
        let report = self.arbiter.select_all_from_configuration(
            &self.catalog,
            name,
            BatchOptions {
                only_unselected,
                visible: None,
            },
            &self.ctx,
        )?;
        for warning in report.warnings.clone() {
            self.log_warn(warning);
        }
        self.save_library()?;
        Ok(report)
    }

    pub fn import_load_order(&mut self, only_unselected: bool) -> Result<BatchReport> {
        let output_plugin = ModKey::new(&self.config.output_plugin_name);
        let report = self
            .arbiter
            .import_from_load_order(&self.catalog, &self.ctx, &output_plugin, only_unselected);
        for warning in report.warnings.clone() {
            self.log_warn(warning);
        }
        self.save_library()?;
        Ok(report)
    }

    pub fn set_source(&mut self, name: &str, plugin: &ModKey, npc: Option<&FormKey>) -> Result<bool> {
        let config = self
            .catalog
            .configuration_mut(name)
            .with_context(|| format!("unknown configuration {name:?}"))?;
        let changed = match npc {
            Some(npc) => set_single_source(config, npc, plugin),
            None => set_source_for_all_applicable(config, plugin),
        };
        self.save_library()?;
        Ok(changed)
    }

    pub fn inspect_configuration(&mut self, name: &str) -> Result<(MergeInSuitability, InjectionReport)> {
        let config = self
            .catalog
            .configuration_mut(name)
            .with_context(|| format!("unknown configuration {name:?}"))?;
        let suitability = check_merge_in_suitability(config, &self.ctx);
        let injection = detect_injected_records(config, &self.ctx);
        for warning in injection.warnings.clone() {
            self.log_warn(warning);
        }
        self.save_library()?;
        Ok((suitability, injection))
    }

    pub fn export_selections(&mut self, path: &Path) -> Result<usize> {
        let count = self.arbiter.export_selections(path)?;
        self.log_info(format!("Exported {count} selections to {}", path.display()));
        Ok(count)
    }

    pub fn preview_import(&self, path: &Path) -> Result<ImportPreview> {
        preview_import(path, &self.catalog, &self.ctx)
    }

    pub fn apply_import(&mut self, preview: &ImportPreview) -> Result<usize> {
        self.backup("import selections")?;
        let applied = self.arbiter.apply_import(preview, &self.catalog);
        self.log_info(format!(
            "Imported {applied} selections ({} rejected)",
            preview.rejected()
        ));
        self.save_library()?;
        Ok(applied)
    }

    pub fn clear_all(&mut self) -> Result<usize> {
        self.backup("clear all selections")?;
        let cleared = self.arbiter.clear_all();
        self.log_info(format!("Cleared {cleared} selections"));
        self.save_library()?;
        Ok(cleared)
    }

    pub fn remove_configuration(&mut self, name: &str) -> Result<usize> {
        let name = self.configuration_name(name)?;
        self.backup(&format!("remove configuration {name}"))?;
        self.catalog.remove_configuration(&name)?;
        let dropped = self.arbiter.remove_configuration_references(&name);
        self.log_info(format!(
            "Removed configuration {name} and {dropped} selections using it"
        ));
        self.save_library()?;
        Ok(dropped)
    }

    pub fn restore_last_backup(&mut self) -> Result<PathBuf> {
        let Some(dir) = backup::load_last_backup(&self.data_dir)? else {
            bail!("no backup to restore");
        };
        let library = backup::load_backup_library(&dir)?;
        self.catalog = Catalog::new(library.configurations);
        let (events_tx, events_rx) = mpsc::channel();
        self.arbiter = Arbiter::new(library.selections).with_events(events_tx);
        self.events = events_rx;
        self.log_info(format!("Restored library from {}", dir.display()));
        self.save_library()?;
        Ok(dir)
    }

    pub fn run(&mut self, progress: Option<ProgressCallback>) -> Result<RunReport> {
        let settings = self.config.run_settings();
        let result = run_patch(
            &self.catalog,
            self.arbiter.table(),
            &self.ctx,
            &settings,
            progress,
        );
        match result {
            Ok(report) => {
                self.log_info(format!(
                    "Patched {} NPCs, skipped {}, copied {} assets",
                    report.patched.len(),
                    report.skipped.len(),
                    report.assets_copied
                ));
                for warning in report.warnings.clone() {
                    self.log_warn(warning);
                }
                Ok(report)
            }
            Err(err) => {
                self.log_error(format!("Run failed: {err:#}"));
                Err(err)
            }
        }
    }

    /// Mugshot of `npc` from configuration `name`, fetched off-thread.
    pub fn mugshot(&self, name: &str, npc: &FormKey) -> Result<Option<PathBuf>> {
        let config = self
            .catalog
            .configuration(name)
            .with_context(|| format!("unknown configuration {name:?}"))?;
        self.portraits.focus(npc.clone(), config.image_paths.clone());
        Ok(self
            .portraits
            .wait(PORTRAIT_TIMEOUT)
            .and_then(|message| message.path))
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }
}

/// Wires the default collaborators. Plugins of the load order are looked up in
/// the game data folder, then in mod folders, then in the record dump folder.
pub fn build_context(
    config: &AppConfig,
    load_order: &[ModKey],
    mod_folders: &[PathBuf],
    data_dir: &Path,
) -> (EngineContext, Vec<String>) {
    let game_data_dir = config.game_data_dir.clone().unwrap_or_default();
    let fallback_dirs = config.record_dump_dir.iter().cloned().collect();
    let provider = Arc::new(DumpPluginProvider::new(fallback_dirs));
    let mut folders = Vec::new();
    if !game_data_dir.as_os_str().is_empty() {
        folders.push(game_data_dir.clone());
    }
    for folder in mod_folders {
        if !folders.contains(folder) {
            folders.push(folder.clone());
        }
    }
    let (environment, warnings) = GameEnvironment::load(load_order, provider.as_ref(), &folders);
    let link_cache: Arc<dyn LinkCache> = Arc::new(environment);
    let ctx = EngineContext {
        link_cache,
        plugins: provider,
        archives: Arc::new(ZipArchiveAccess::new()),
        game_data_dir,
        language: config.language.clone(),
        diagnostics_dir: data_dir.join("diagnostics"),
        override_cache: OverrideCache::default(),
    };
    (ctx, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dump::write_plugin,
        environment::fixtures::{fk, mk, npc, plugin, race},
        merge::{PatchingMode, RUN_REPORT_FILE},
    };
    use std::fs;

    /// Game data with Skyrim.esm, one mod folder with Bijin.esp, and a
    /// load order that activates it.
    fn setup() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let data = root.join("game").join("Data");
        let dumps = root.join("dumps");
        let mods = root.join("mods");
        let bijin = mods.join("Bijin");
        fs::create_dir_all(&data).unwrap();

        let lydia = "0A2C94:Skyrim.esm";
        write_plugin(
            &plugin(
                "Skyrim.esm",
                &[],
                vec![npc(lydia, "Lydia", "013746:Skyrim.esm"), race("013746:Skyrim.esm", true)],
            ),
            &dumps,
        )
        .unwrap();
        write_plugin(
            &plugin("Bijin.esp", &["Skyrim.esm"], vec![npc(lydia, "Lydia", "013746:Skyrim.esm")]),
            &bijin,
        )
        .unwrap();
        fs::write(bijin.join("Bijin.esp"), b"").unwrap();
        let facegen = bijin.join("meshes/actors/character/facegendata/facegeom/skyrim.esm");
        fs::create_dir_all(&facegen).unwrap();
        fs::write(facegen.join("000a2c94.nif"), b"nif").unwrap();
        let tint = bijin.join("textures/actors/character/facegendata/facetint/skyrim.esm");
        fs::create_dir_all(&tint).unwrap();
        fs::write(tint.join("000a2c94.dds"), b"dds").unwrap();

        let plugins_txt = root.join("plugins.txt");
        fs::write(&plugins_txt, "*Bijin.esp\n").unwrap();

        let data_dir = root.join("appdata");
        let config = AppConfig {
            game_data_dir: Some(data),
            plugins_txt: Some(plugins_txt),
            record_dump_dir: Some(dumps),
            mods_root: Some(mods),
            output_dir: Some(root.join("out")),
            patching_mode: PatchingMode::Default,
            ..AppConfig::default()
        };
        config.save(&data_dir).unwrap();
        (dir, data_dir)
    }

    #[test]
    fn scan_select_and_run_end_to_end() {
        let (_dir, data_dir) = setup();
        let mut app = App::initialize(&data_dir).unwrap();
        assert!(app.catalog.configuration("Bijin").is_some());
        assert!(app.catalog.configuration(crate::catalog::BASE_GAME_CONFIGURATION).is_some());

        let report = app.rescan(false, None).unwrap();
        assert_eq!(report.failed, 0);
        let lydia = fk("0A2C94:Skyrim.esm");
        assert!(app.catalog.is_known_npc(&lydia));

        let batch = app.select_all("bijin", false).unwrap();
        assert_eq!(batch.applied, 1);
        assert!(app.changed.is_empty());
        assert_eq!(app.arbiter.selection(&lydia).unwrap().mod_name, "Bijin");

        let run = app.run(None).unwrap();
        assert_eq!(run.patched.len(), 1);
        let out = app.config.output_dir.clone().unwrap();
        assert!(out.join(RUN_REPORT_FILE).exists());
        assert!(out
            .join("meshes/actors/character/facegendata/facegeom/skyrim.esm/000a2c94.nif")
            .exists());

        let reopened = App::initialize(&data_dir).unwrap();
        assert_eq!(reopened.arbiter.selection(&lydia).unwrap().mod_name, "Bijin");
    }

    #[test]
    fn destructive_actions_can_be_undone() {
        let (_dir, data_dir) = setup();
        let mut app = App::initialize(&data_dir).unwrap();
        app.rescan(true, None).unwrap();
        let lydia = fk("0A2C94:Skyrim.esm");
        assert!(app.select(&lydia, "Bijin").unwrap());

        assert_eq!(app.clear_all().unwrap(), 1);
        assert!(app.arbiter.selection(&lydia).is_none());
        app.restore_last_backup().unwrap();
        assert_eq!(app.arbiter.selection(&lydia).unwrap().mod_name, "Bijin");
    }

    #[test]
    fn mod_folder_configuration_cannot_be_removed() {
        let (_dir, data_dir) = setup();
        let mut app = App::initialize(&data_dir).unwrap();
        assert!(app.remove_configuration("Bijin").is_err());
        assert!(app.select(&fk("0A2C94:Skyrim.esm"), "Missing").is_err());
        assert!(app.set_source("Bijin", &mk("Bijin.esp"), None).is_ok());
    }

    #[test]
    fn guests_and_folders_round_trip_through_the_app() {
        let (dir, data_dir) = setup();
        let mut app = App::initialize(&data_dir).unwrap();
        app.rescan(true, None).unwrap();
        let lydia = fk("0A2C94:Skyrim.esm");

        assert!(app.select_guest(&lydia, "Bijin", &lydia).is_err());
        assert!(app.add_guest(&lydia, "Bijin", &lydia).unwrap());
        assert!(app.select_guest(&lydia, "bijin", &lydia).unwrap());
        let overview = app.npc_overview(&lydia).unwrap();
        assert_eq!(overview.selection.unwrap().mod_name, "Bijin");
        assert_eq!(overview.guests.len(), 1);
        assert_eq!(overview.borrowed_by, vec![lydia.clone()]);
        assert!(overview.offered_by.iter().any(|name| name == "Bijin"));

        assert!(app.remove_guest(&lydia, "Bijin", &lydia).unwrap());
        assert!(!app.remove_guest(&lydia, "Bijin", &lydia).unwrap());
        assert!(app.arbiter.selection(&lydia).is_none());
        assert!(app.npc_overview(&lydia).unwrap().borrowed_by.is_empty());

        let bijin = dir.path().join("mods").join("Bijin");
        let extra = dir.path().join("extras");
        fs::create_dir_all(&extra).unwrap();
        assert!(app.set_folders("Bijin", vec![dir.path().join("missing")]).is_err());
        app.set_folders("Bijin", vec![bijin.clone(), extra.clone()]).unwrap();
        assert!(app.catalog.configuration("Bijin").unwrap().snapshot.is_none());
        let report = app.rescan(false, None).unwrap();
        assert!(report.scanned >= 1);
        let config = app.catalog.configuration("Bijin").unwrap();
        assert_eq!(config.folder_paths, vec![bijin, extra]);
        assert!(config.snapshot.is_some());
        assert!(app.catalog.is_known_npc(&lydia));
    }

    #[test]
    fn missing_output_dir_is_logged() {
        let (_dir, data_dir) = setup();
        let mut app = App::initialize(&data_dir).unwrap();
        app.config.output_dir = None;
        assert!(app.run(None).is_err());
        let raw = fs::read_to_string(app.log_path()).unwrap();
        assert!(raw.contains("[ERROR] Run failed"));
    }
}
