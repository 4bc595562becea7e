use crate::{
    catalog::{same_name, Catalog},
    environment::EngineContext,
    formkey::{FormKey, FormKeyError, ModKey},
    provenance::disambiguate_by_content,
    template::resolve_template_chain,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
    sync::mpsc::Sender,
};
use thiserror::Error;

/// Which configuration an NPC takes its appearance from, and from which NPC
/// of that configuration (itself, or another NPC for a guest appearance).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selection {
    pub mod_name: String,
    pub source_npc: FormKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuestAppearance {
    pub mod_name: String,
    pub source_npc: FormKey,
    #[serde(default)]
    pub source_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionTable {
    #[serde(default)]
    pub selections: BTreeMap<FormKey, Selection>,
    #[serde(default)]
    pub guests: BTreeMap<FormKey, Vec<GuestAppearance>>,
    /// Source NPC to the targets borrowing its appearance.
    #[serde(skip)]
    guest_of: BTreeMap<FormKey, BTreeSet<FormKey>>,
}

impl SelectionTable {
    pub fn rebuild_guest_index(&mut self) {
        let mut guest_of: BTreeMap<FormKey, BTreeSet<FormKey>> = BTreeMap::new();
        for (target, guests) in &self.guests {
            for guest in guests {
                guest_of
                    .entry(guest.source_npc.clone())
                    .or_default()
                    .insert(target.clone());
            }
        }
        self.guest_of = guest_of;
    }

    pub fn borrowers_of(&self, source: &FormKey) -> Vec<FormKey> {
        self.guest_of
            .get(source)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Notifications for whatever presents the engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    SelectionChanged {
        npc: FormKey,
        selection: Option<Selection>,
    },
    GuestsChanged {
        target: FormKey,
    },
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions<'a> {
    pub only_unselected: bool,
    /// Restricts the batch to NPCs currently visible under active filters.
    pub visible: Option<&'a BTreeSet<FormKey>>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub applied: usize,
    pub skipped: usize,
    pub warnings: Vec<String>,
}

/// Sole writer of the selection table.
#[derive(Default)]
pub struct Arbiter {
    table: SelectionTable,
    events: Option<Sender<EngineEvent>>,
}

impl Arbiter {
    pub fn new(mut table: SelectionTable) -> Self {
        table.rebuild_guest_index();
        Self {
            table,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Sender<EngineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn table(&self) -> &SelectionTable {
        &self.table
    }

    pub fn selection(&self, npc: &FormKey) -> Option<&Selection> {
        self.table.selections.get(npc)
    }

    pub fn guests(&self, target: &FormKey) -> &[GuestAppearance] {
        self.table
            .guests
            .get(target)
            .map(|guests| guests.as_slice())
            .unwrap_or(&[])
    }

    /// Returns whether the table changed.
    pub fn select(&mut self, npc: &FormKey, mod_name: &str, source_npc: &FormKey) -> bool {
        let selection = Selection {
            mod_name: mod_name.to_string(),
            source_npc: source_npc.clone(),
        };
        if self.table.selections.get(npc) == Some(&selection) {
            return false;
        }
        self.table
            .selections
            .insert(npc.clone(), selection.clone());
        self.emit(EngineEvent::SelectionChanged {
            npc: npc.clone(),
            selection: Some(selection),
        });
        true
    }

    pub fn clear(&mut self, npc: &FormKey) -> Option<Selection> {
        let removed = self.table.selections.remove(npc)?;
        self.emit(EngineEvent::SelectionChanged {
            npc: npc.clone(),
            selection: None,
        });
        Some(removed)
    }

    pub fn clear_all(&mut self) -> usize {
        let keys: Vec<FormKey> = self.table.selections.keys().cloned().collect();
        keys.iter().filter(|npc| self.clear(npc).is_some()).count()
    }

    /// Selects configuration `name` for every NPC it offers. NPCs that take
    /// their appearance from a template pull the configuration's own chain
    /// members along; a chain that cannot be resolved skips only that NPC.
    pub fn select_all_from_configuration(
        &mut self,
        catalog: &Catalog,
        name: &str,
        options: BatchOptions<'_>,
        ctx: &EngineContext,
    ) -> Result<BatchReport> {
        let config = catalog
            .configuration(name)
            .with_context(|| format!("unknown configuration {name:?}"))?;
        let mut report = BatchReport::default();

        for npc in &config.npcs {
            if let Some(visible) = options.visible {
                if !visible.contains(npc) {
                    continue;
                }
            }
            if options.only_unselected && self.table.selections.contains_key(npc) {
                report.skipped += 1;
                continue;
            }
            let chain = match resolve_template_chain(npc, config, ctx) {
                Ok(chain) => chain,
                Err(err) => {
                    report.warnings.push(format!("{npc}: {err}"));
                    report.skipped += 1;
                    continue;
                }
            };
            self.select(npc, &config.display_name, npc);
            report.applied += 1;
            if chain.inherits() {
                for member in chain.local_keys().iter().skip(1) {
                    if options.only_unselected && self.table.selections.contains_key(member) {
                        continue;
                    }
                    self.select(member, &config.display_name, member);
                }
            }
        }
        Ok(report)
    }

    /// Selects, for every cataloged NPC, the configuration that owns the
    /// plugin currently winning in the load order. A previously generated
    /// `output_plugin` never counts as the winner.
    pub fn import_from_load_order(
        &mut self,
        catalog: &Catalog,
        ctx: &EngineContext,
        output_plugin: &ModKey,
        only_unselected: bool,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for record in catalog.npcs() {
            let npc = &record.key;
            if only_unselected && self.table.selections.contains_key(npc) {
                report.skipped += 1;
                continue;
            }
            let Some(winner) = ctx
                .link_cache
                .resolve_all_contexts(npc)
                .into_iter()
                .map(|context| context.mod_key)
                .find(|mod_key| mod_key != output_plugin)
            else {
                report.skipped += 1;
                continue;
            };
            let owners: Vec<_> = catalog
                .configurations_owning(&winner)
                .into_iter()
                .filter(|config| config.npcs.contains(npc))
                .collect();

            let chosen = match owners.len() {
                0 => {
                    report.skipped += 1;
                    continue;
                }
                1 => Some(owners[0].display_name.clone()),
                _ => disambiguate_by_content(&owners, npc, &ctx.game_data_dir).or_else(|| {
                    let by_plugin: Vec<_> = owners
                        .iter()
                        .filter(|config| config.source_plugin(npc).as_ref() == Some(&winner))
                        .collect();
                    (by_plugin.len() == 1).then(|| by_plugin[0].display_name.clone())
                }),
            };
            match chosen {
                Some(name) => {
                    self.select(npc, &name, npc);
                    report.applied += 1;
                }
                None => {
                    let names: Vec<&str> =
                        owners.iter().map(|config| config.display_name.as_str()).collect();
                    report.warnings.push(format!(
                        "{npc}: {winner} is owned by {} and none could be told apart",
                        names.join(", ")
                    ));
                    report.skipped += 1;
                }
            }
        }
        report
    }

    pub fn add_guest(&mut self, target: &FormKey, guest: GuestAppearance) -> bool {
        let guests = self.table.guests.entry(target.clone()).or_default();
        if guests
            .iter()
            .any(|g| same_name(&g.mod_name, &guest.mod_name) && g.source_npc == guest.source_npc)
        {
            return false;
        }
        self.table
            .guest_of
            .entry(guest.source_npc.clone())
            .or_default()
            .insert(target.clone());
        guests.push(guest);
        self.emit(EngineEvent::GuestsChanged {
            target: target.clone(),
        });
        true
    }

    /// Removes one guest of `target`. The selection it backed is cleared.
    pub fn remove_guest(&mut self, target: &FormKey, mod_name: &str, source_npc: &FormKey) -> bool {
        let Some(guests) = self.table.guests.get_mut(target) else {
            return false;
        };
        let before = guests.len();
        guests.retain(|g| !(same_name(&g.mod_name, mod_name) && g.source_npc == *source_npc));
        if guests.len() == before {
            return false;
        }
        if guests.is_empty() {
            self.table.guests.remove(target);
        }
        self.table.rebuild_guest_index();

        let backed = self
            .table
            .selections
            .get(target)
            .map(|s| same_name(&s.mod_name, mod_name) && s.source_npc == *source_npc)
            .unwrap_or(false);
        if backed {
            self.clear(target);
        }
        self.emit(EngineEvent::GuestsChanged {
            target: target.clone(),
        });
        true
    }

    /// Drops every selection and guest entry naming configuration `name`.
    pub fn remove_configuration_references(&mut self, name: &str) -> usize {
        let selected: Vec<FormKey> = self
            .table
            .selections
            .iter()
            .filter(|(_, selection)| same_name(&selection.mod_name, name))
            .map(|(npc, _)| npc.clone())
            .collect();
        let mut removed = 0;
        for npc in selected {
            if self.clear(&npc).is_some() {
                removed += 1;
            }
        }

        let mut touched = Vec::new();
        self.table.guests.retain(|target, guests| {
            let before = guests.len();
            guests.retain(|g| !same_name(&g.mod_name, name));
            if guests.len() != before {
                touched.push(target.clone());
            }
            !guests.is_empty()
        });
        removed += touched.len();
        self.table.rebuild_guest_index();
        for target in touched {
            self.emit(EngineEvent::GuestsChanged { target });
        }
        removed
    }

    pub fn export_selections(&self, path: &Path) -> Result<usize> {
        let entries: BTreeMap<String, ExportEntry> = self
            .table
            .selections
            .iter()
            .map(|(npc, selection)| {
                (
                    npc.to_string(),
                    ExportEntry {
                        mod_name: selection.mod_name.clone(),
                        source_npc: selection.source_npc.to_string(),
                    },
                )
            })
            .collect();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create export dir")?;
        }
        let raw = serde_json::to_string_pretty(&entries).context("serialize selections")?;
        fs::write(path, raw).with_context(|| format!("write {:?}", path))?;
        Ok(entries.len())
    }

    /// Applies every valid entry of a previewed import at once. Entries that
    /// borrow another NPC's look also register that look as a guest.
    pub fn apply_import(&mut self, preview: &ImportPreview, catalog: &Catalog) -> usize {
        let mut changed = 0;
        for (npc, selection) in &preview.valid {
            if selection.source_npc != *npc {
                let source_name = catalog
                    .npc(&selection.source_npc)
                    .map(|record| record.display_name.clone())
                    .unwrap_or_else(|| selection.source_npc.to_string());
                self.add_guest(
                    npc,
                    GuestAppearance {
                        mod_name: selection.mod_name.clone(),
                        source_npc: selection.source_npc.clone(),
                        source_name,
                    },
                );
            }
            if self.select(npc, &selection.mod_name, &selection.source_npc) {
                changed += 1;
            }
        }
        changed
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExportEntry {
    #[serde(rename = "ModName")]
    mod_name: String,
    #[serde(rename = "SourceNpcFormKey")]
    source_npc: String,
}

#[derive(Debug, Error)]
pub enum ImportEntryError {
    #[error("bad target form key: {0}")]
    Target(FormKeyError),
    #[error("bad source form key: {0}")]
    Source(FormKeyError),
    #[error("entry is not {{ModName, SourceNpcFormKey}}: {0}")]
    Shape(serde_json::Error),
}

#[derive(Debug, Default)]
pub struct ImportPreview {
    pub valid: Vec<(FormKey, Selection)>,
    pub malformed: Vec<(String, ImportEntryError)>,
    /// Entries whose target or source NPC does not exist.
    pub unresolved: Vec<(String, String)>,
    /// Entries naming a configuration that is not loaded.
    pub unrecognized: Vec<(String, String)>,
}

impl ImportPreview {
    pub fn rejected(&self) -> usize {
        self.malformed.len() + self.unresolved.len() + self.unrecognized.len()
    }
}

/// Validates a selection file without touching the table.
pub fn preview_import(path: &Path, catalog: &Catalog, ctx: &EngineContext) -> Result<ImportPreview> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    let entries: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&raw).context("selection file must be a JSON object")?;
    if entries.is_empty() {
        bail!("selection file {:?} has no entries", path);
    }

    let resolvable = |npc: &FormKey| catalog.is_known_npc(npc) || ctx.link_cache.resolve_npc(npc).is_some();
    let mut preview = ImportPreview::default();
    for (target_raw, value) in entries {
        let target = match target_raw.parse::<FormKey>() {
            Ok(target) => target,
            Err(err) => {
                preview
                    .malformed
                    .push((target_raw, ImportEntryError::Target(err)));
                continue;
            }
        };
        let entry: ExportEntry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(err) => {
                preview.malformed.push((target_raw, ImportEntryError::Shape(err)));
                continue;
            }
        };
        let source = match entry.source_npc.parse::<FormKey>() {
            Ok(source) => source,
            Err(err) => {
                preview
                    .malformed
                    .push((target_raw, ImportEntryError::Source(err)));
                continue;
            }
        };
        let Some(config) = catalog.configuration(&entry.mod_name) else {
            preview.unrecognized.push((target_raw, entry.mod_name));
            continue;
        };
        if !resolvable(&target) {
            preview
                .unresolved
                .push((target_raw, format!("target {target} not found")));
            continue;
        }
        if !resolvable(&source) {
            preview
                .unresolved
                .push((target_raw, format!("source {source} not found")));
            continue;
        }
        preview.valid.push((
            target,
            Selection {
                mod_name: config.display_name.clone(),
                source_npc: source,
            },
        ));
    }
    Ok(preview)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModConfiguration;
    use crate::environment::fixtures::*;
    use pretty_assertions::assert_eq;
    use std::{path::PathBuf, sync::mpsc, sync::Arc};

    const HUMAN: &str = "013746:Skyrim.esm";

    fn base_game() -> crate::environment::Plugin {
        plugin(
            "Skyrim.esm",
            &[],
            vec![
                race(HUMAN, true),
                npc("001234:Skyrim.esm", "Lydia", HUMAN),
                npc("001235:Skyrim.esm", "Faendal", HUMAN),
            ],
        )
    }

    fn mod_a() -> ModConfiguration {
        let mut config = ModConfiguration::new("ModA");
        config.plugins = vec![mk("ModA.esp")];
        config.folder_paths = vec![PathBuf::from("/mods/a")];
        config
    }

    #[test]
    fn batch_selection_propagates_along_template_chain() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MemoryPlugins::default());
        provider.add(
            "/mods/a",
            plugin(
                "ModA.esp",
                &["Skyrim.esm"],
                vec![
                    templated_npc("000800:ModA.esp", "X", HUMAN, "000801:ModA.esp"),
                    npc("000801:ModA.esp", "Y", HUMAN),
                    templated_npc("000802:ModA.esp", "Broken", HUMAN, "00FFFF:ModA.esp"),
                ],
            ),
        );
        let ctx = context(vec![base_game()], provider, dir.path());
        let mut config = mod_a();
        config.npcs.insert(fk("000800:ModA.esp"));
        config.npcs.insert(fk("000802:ModA.esp"));
        let catalog = Catalog::new(vec![config]);

        let (tx, rx) = mpsc::channel();
        let mut arbiter = Arbiter::new(SelectionTable::default()).with_events(tx);
        let report = arbiter
            .select_all_from_configuration(&catalog, "moda", BatchOptions::default(), &ctx)
            .unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("000802:ModA.esp"));
        for key in ["000800:ModA.esp", "000801:ModA.esp"] {
            assert_eq!(
                arbiter.selection(&fk(key)),
                Some(&Selection {
                    mod_name: "ModA".to_string(),
                    source_npc: fk(key),
                })
            );
        }
        assert_eq!(rx.try_iter().count(), 2);
        assert!(arbiter.selection(&fk("000802:ModA.esp")).is_none());
    }

    #[test]
    fn only_unselected_keeps_existing_choices() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MemoryPlugins::default());
        provider.add(
            "/mods/a",
            plugin(
                "ModA.esp",
                &["Skyrim.esm"],
                vec![
                    npc("001234:Skyrim.esm", "Lydia", HUMAN),
                    templated_npc("000800:ModA.esp", "X", HUMAN, "000801:ModA.esp"),
                    npc("000801:ModA.esp", "Y", HUMAN),
                ],
            ),
        );
        let ctx = context(vec![base_game()], provider, dir.path());
        let mut config = mod_a();
        config.npcs.insert(fk("001234:Skyrim.esm"));
        config.npcs.insert(fk("000800:ModA.esp"));
        let catalog = Catalog::new(vec![config]);

        let mut arbiter = Arbiter::default();
        arbiter.select(&fk("001234:Skyrim.esm"), "Other", &fk("001234:Skyrim.esm"));
        arbiter.select(&fk("000801:ModA.esp"), "Other", &fk("000801:ModA.esp"));
        let options = BatchOptions {
            only_unselected: true,
            visible: None,
        };
        let report = arbiter
            .select_all_from_configuration(&catalog, "ModA", options, &ctx)
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(
            arbiter.selection(&fk("001234:Skyrim.esm")).unwrap().mod_name,
            "Other"
        );
        assert_eq!(arbiter.selection(&fk("000800:ModA.esp")).unwrap().mod_name, "ModA");
        assert_eq!(
            arbiter.selection(&fk("000801:ModA.esp")).unwrap().mod_name,
            "Other"
        );
    }

    #[test]
    fn removing_active_sole_guest_clears_selection() {
        let mut arbiter = Arbiter::default();
        let target = fk("001234:Skyrim.esm");
        let source = fk("001235:Skyrim.esm");
        assert!(arbiter.add_guest(
            &target,
            GuestAppearance {
                mod_name: "ModA".to_string(),
                source_npc: source.clone(),
                source_name: "Faendal".to_string(),
            },
        ));
        assert_eq!(arbiter.table().borrowers_of(&source), vec![target.clone()]);
        arbiter.select(&target, "ModA", &source);

        assert!(arbiter.remove_guest(&target, "moda", &source));
        assert!(arbiter.selection(&target).is_none());
        assert!(arbiter.guests(&target).is_empty());
        assert!(!arbiter.table().guests.contains_key(&target));
        assert!(arbiter.table().borrowers_of(&source).is_empty());
    }

    #[test]
    fn configuration_removal_drops_references() {
        let mut arbiter = Arbiter::default();
        let lydia = fk("001234:Skyrim.esm");
        let faendal = fk("001235:Skyrim.esm");
        arbiter.select(&lydia, "ModA", &lydia);
        arbiter.select(&faendal, "ModB", &faendal);
        arbiter.add_guest(
            &faendal,
            GuestAppearance {
                mod_name: "ModA".to_string(),
                source_npc: lydia.clone(),
                source_name: "Lydia".to_string(),
            },
        );
        assert_eq!(arbiter.remove_configuration_references("MODA"), 2);
        assert!(arbiter.selection(&lydia).is_none());
        assert_eq!(arbiter.selection(&faendal).unwrap().mod_name, "ModB");
        assert!(arbiter.guests(&faendal).is_empty());
    }

    #[test]
    fn export_then_import_reproduces_table() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(vec![base_game()], Arc::new(MemoryPlugins::default()), dir.path());
        let catalog = Catalog::new(vec![mod_a(), ModConfiguration::new("ModB")]);

        let mut original = Arbiter::default();
        original.select(&fk("001234:Skyrim.esm"), "ModA", &fk("001234:Skyrim.esm"));
        original.select(&fk("001235:Skyrim.esm"), "ModB", &fk("001234:Skyrim.esm"));
        let path = dir.path().join("choices.json");
        assert_eq!(original.export_selections(&path).unwrap(), 2);

        let preview = preview_import(&path, &catalog, &ctx).unwrap();
        assert_eq!(preview.rejected(), 0);
        let mut restored = Arbiter::default();
        assert_eq!(restored.apply_import(&preview, &catalog), 2);
        assert_eq!(restored.table().selections, original.table().selections);
        assert_eq!(
            restored.guests(&fk("001235:Skyrim.esm")),
            &[GuestAppearance {
                mod_name: "ModB".to_string(),
                source_npc: fk("001234:Skyrim.esm"),
                source_name: "001234:Skyrim.esm".to_string(),
            }]
        );
        assert!(restored.guests(&fk("001234:Skyrim.esm")).is_empty());
        assert_eq!(
            restored.table().borrowers_of(&fk("001234:Skyrim.esm")),
            vec![fk("001235:Skyrim.esm")]
        );
    }

    #[test]
    fn import_buckets_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(vec![base_game()], Arc::new(MemoryPlugins::default()), dir.path());
        let catalog = Catalog::new(vec![mod_a()]);
        let path = dir.path().join("choices.json");
        fs::write(
            &path,
            r#"{
                "001234:Skyrim.esm": {"ModName": "ModA", "SourceNpcFormKey": "001234:Skyrim.esm"},
                "001235:Skyrim.esm": {"ModName": "Nobody", "SourceNpcFormKey": "001235:Skyrim.esm"},
                "00ABCD:Skyrim.esm": {"ModName": "ModA", "SourceNpcFormKey": "00ABCD:Skyrim.esm"},
                "garbage": {"ModName": "ModA", "SourceNpcFormKey": "001234:Skyrim.esm"},
                "001236:Skyrim.esm": {"Mod": "ModA"}
            }"#,
        )
        .unwrap();

        let preview = preview_import(&path, &catalog, &ctx).unwrap();
        assert_eq!(preview.valid.len(), 1);
        assert_eq!(preview.unrecognized, vec![("001235:Skyrim.esm".to_string(), "Nobody".to_string())]);
        assert_eq!(preview.unresolved.len(), 1);
        assert_eq!(preview.malformed.len(), 2);

        let mut arbiter = Arbiter::default();
        arbiter.apply_import(&preview, &catalog);
        assert!(arbiter.selection(&fk("001235:Skyrim.esm")).is_none());
        assert!(arbiter.selection(&fk("001234:Skyrim.esm")).is_some());
    }

    #[test]
    fn load_order_import_uses_content_to_split_owners() {
        let dir = tempfile::tempdir().unwrap();
        let npc_key = fk("001234:Skyrim.esm");
        let mesh = crate::provenance::facegen_paths(&npc_key).mesh;
        let write = |root: &Path, bytes: &[u8]| {
            let path = root.join(&mesh);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, bytes).unwrap();
        };
        write(&dir.path().join("Data"), b"deployed");
        write(&dir.path().join("Install1"), b"older!!!");
        write(&dir.path().join("Install2"), b"deployed");

        let patch = plugin("Foo.esp", &["Skyrim.esm"], vec![npc("001234:Skyrim.esm", "Lydia", HUMAN)]);
        let ctx = context(vec![base_game(), patch], Arc::new(MemoryPlugins::default()), dir.path());
        let configs = ["Install1", "Install2"]
            .iter()
            .map(|name| {
                let mut config = ModConfiguration::new(name);
                config.plugins = vec![mk("Foo.esp")];
                config.folder_paths = vec![dir.path().join(name)];
                config.npcs.insert(npc_key.clone());
                config.npc_sources.insert(npc_key.clone(), vec![mk("Foo.esp")]);
                config
            })
            .collect();
        let catalog = Catalog::new(configs);

        let mut arbiter = Arbiter::default();
        let report = arbiter.import_from_load_order(&catalog, &ctx, &mk("Merged.esp"), false);
        assert_eq!(report.applied, 1);
        assert_eq!(arbiter.selection(&npc_key).unwrap().mod_name, "Install2");
    }

    #[test]
    fn load_order_import_looks_past_generated_output() {
        let dir = tempfile::tempdir().unwrap();
        let npc_key = fk("001234:Skyrim.esm");
        let foo = plugin("Foo.esp", &["Skyrim.esm"], vec![npc("001234:Skyrim.esm", "Lydia", HUMAN)]);
        let merged = plugin(
            "NPC Appearances Merged.esp",
            &["Skyrim.esm", "Foo.esp"],
            vec![npc("001234:Skyrim.esm", "Lydia", HUMAN)],
        );
        let ctx = context(
            vec![base_game(), foo, merged],
            Arc::new(MemoryPlugins::default()),
            dir.path(),
        );
        let mut config = ModConfiguration::new("Foo");
        config.plugins = vec![mk("Foo.esp")];
        config.folder_paths = vec![dir.path().join("Foo")];
        config.npcs.insert(npc_key.clone());
        let catalog = Catalog::new(vec![config]);

        let mut arbiter = Arbiter::default();
        let report =
            arbiter.import_from_load_order(&catalog, &ctx, &mk("NPC Appearances Merged.esp"), false);
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(arbiter.selection(&npc_key).unwrap().mod_name, "Foo");
    }

    #[test]
    fn table_round_trips_through_json() {
        let mut arbiter = Arbiter::default();
        let target = fk("001234:Skyrim.esm");
        arbiter.select(&target, "ModA", &fk("001235:Skyrim.esm"));
        arbiter.add_guest(
            &target,
            GuestAppearance {
                mod_name: "ModA".to_string(),
                source_npc: fk("001235:Skyrim.esm"),
                source_name: "Faendal".to_string(),
            },
        );
        let raw = serde_json::to_string(arbiter.table()).unwrap();
        let mut back: SelectionTable = serde_json::from_str(&raw).unwrap();
        back.rebuild_guest_index();
        assert_eq!(&back, arbiter.table());
    }
}
