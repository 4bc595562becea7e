use crate::{
    app::App,
    config,
    formkey::{FormKey, ModKey},
    progress::{Progress, ProgressCallback},
};
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Scan { force: bool },
    List,
    Chain { config: String, npc: FormKey },
    Select { npc: FormKey, config: String },
    Clear { npc: FormKey },
    Guest { target: FormKey, config: String, source: FormKey },
    SelectGuest { target: FormKey, config: String, source: FormKey },
    RemoveGuest { target: FormKey, config: String, source: FormKey },
    Show { npc: FormKey },
    SetFolders { config: String, folders: Vec<PathBuf> },
    SelectAll { config: String, only_unselected: bool },
    ImportLoadOrder { only_unselected: bool },
    SetSource { config: String, plugin: ModKey, npc: Option<FormKey> },
    Inspect { config: String },
    Mugshot { config: String, npc: FormKey },
    Export { path: PathBuf },
    Import { path: PathBuf, yes: bool },
    ClearAll { yes: bool },
    Remove { config: String, yes: bool },
    RestoreBackup,
    Run,
    Paths,
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (format, command) = parse_args(&args)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("VisageSmith v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let data_dir = config::base_data_dir()?;
            let mut app = App::initialize(&data_dir)?;
            run_command(&mut app, command, format)
        }
    }
}

fn parse_args(args: &[String]) -> Result<(OutputFormat, CliCommand)> {
    let (format, tokens) = parse_global_options(args);
    let Some(head) = tokens.first() else {
        return Ok((format, CliCommand::Help));
    };
    let rest = &tokens[1..];
    let flag = |name: &str| rest.iter().any(|arg| arg == name);
    let positional = Positional::new(head, rest);
    let arg = |index: usize, what: &'static str| positional.arg(index, what);
    let form_key = |index: usize, what: &'static str| positional.form_key(index, what);

    let command = match head.as_str() {
        "help" | "--help" | "-h" => CliCommand::Help,
        "version" | "--version" | "-V" => CliCommand::Version,
        "scan" => CliCommand::Scan {
            force: flag("--force"),
        },
        "list" => CliCommand::List,
        "chain" => CliCommand::Chain {
            config: arg(0, "config")?.to_string(),
            npc: form_key(1, "formkey")?,
        },
        "select" => CliCommand::Select {
            npc: form_key(0, "formkey")?,
            config: arg(1, "config")?.to_string(),
        },
        "clear" => CliCommand::Clear {
            npc: form_key(0, "formkey")?,
        },
        "guest" => CliCommand::Guest {
            target: form_key(0, "target")?,
            config: arg(1, "config")?.to_string(),
            source: form_key(2, "source")?,
        },
        "select-guest" => CliCommand::SelectGuest {
            target: form_key(0, "target")?,
            config: arg(1, "config")?.to_string(),
            source: form_key(2, "source")?,
        },
        "remove-guest" => CliCommand::RemoveGuest {
            target: form_key(0, "target")?,
            config: arg(1, "config")?.to_string(),
            source: form_key(2, "source")?,
        },
        "show" => CliCommand::Show {
            npc: form_key(0, "formkey")?,
        },
        "set-folders" => {
            let config = arg(0, "config")?.to_string();
            arg(1, "folder")?;
            CliCommand::SetFolders {
                config,
                folders: positional.values[1..].iter().map(|value| PathBuf::from(*value)).collect(),
            }
        }
        "select-all" => CliCommand::SelectAll {
            config: arg(0, "config")?.to_string(),
            only_unselected: flag("--only-unselected"),
        },
        "import-load-order" => CliCommand::ImportLoadOrder {
            only_unselected: flag("--only-unselected"),
        },
        "set-source" => CliCommand::SetSource {
            config: arg(0, "config")?.to_string(),
            plugin: ModKey::new(arg(1, "plugin")?),
            npc: if positional.has(2) {
                Some(form_key(2, "formkey")?)
            } else {
                None
            },
        },
        "inspect" => CliCommand::Inspect {
            config: arg(0, "config")?.to_string(),
        },
        "mugshot" => CliCommand::Mugshot {
            config: arg(0, "config")?.to_string(),
            npc: form_key(1, "formkey")?,
        },
        "export" => CliCommand::Export {
            path: PathBuf::from(arg(0, "file")?),
        },
        "import" => CliCommand::Import {
            path: PathBuf::from(arg(0, "file")?),
            yes: flag("--yes"),
        },
        "clear-all" => CliCommand::ClearAll { yes: flag("--yes") },
        "remove" => CliCommand::Remove {
            config: arg(0, "config")?.to_string(),
            yes: flag("--yes"),
        },
        "restore-backup" => CliCommand::RestoreBackup,
        "run" => CliCommand::Run,
        "paths" => CliCommand::Paths,
        other => bail!("unknown command {other:?}; see `visagesmith help`"),
    };
    Ok((format, command))
}

struct Positional<'a> {
    command: &'a str,
    values: Vec<&'a str>,
}

impl<'a> Positional<'a> {
    fn new(command: &'a str, rest: &'a [String]) -> Self {
        let values = rest
            .iter()
            .filter(|arg| !arg.starts_with("--"))
            .map(|arg| arg.as_str())
            .collect();
        Self { command, values }
    }

    fn has(&self, index: usize) -> bool {
        index < self.values.len()
    }

    fn arg(&self, index: usize, what: &str) -> Result<&'a str> {
        self.values
            .get(index)
            .copied()
            .ok_or_else(|| anyhow!("{} requires <{what}>", self.command))
    }

    fn form_key(&self, index: usize, what: &str) -> Result<FormKey> {
        let raw = self.arg(index, what)?;
        raw.parse::<FormKey>()
            .with_context(|| format!("invalid form key {raw:?}"))
    }
}

fn parse_global_options(args: &[String]) -> (OutputFormat, Vec<String>) {
    let mut format = OutputFormat::Text;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            if let Some(parsed) = OutputFormat::parse(value) {
                format = parsed;
            }
            continue;
        }
        if arg == "--format" {
            if let Some(value) = iter.next() {
                if let Some(parsed) = OutputFormat::parse(value) {
                    format = parsed;
                }
            }
            continue;
        }
        tokens.push(arg.to_string());
    }
    (format, tokens)
}

fn confirm(app: &App, yes: bool, action: &str) -> Result<()> {
    if app.config.confirm_destructive_actions && !yes {
        bail!("{action} is destructive; pass --yes to confirm");
    }
    Ok(())
}

fn print_progress() -> ProgressCallback {
    Arc::new(|progress: Progress| {
        let detail = progress.detail.as_deref().unwrap_or("");
        eprintln!(
            "{} {}/{} {detail}",
            progress.stage.label(),
            progress.current,
            progress.total
        );
    })
}

fn run_command(app: &mut App, command: CliCommand, format: OutputFormat) -> Result<()> {
    match command {
        CliCommand::Scan { force } => {
            let report = app.rescan(force, Some(print_progress()))?;
            println!(
                "Scanned {} configuration(s), {} unchanged, {} failed, {} NPC(s) rejected",
                report.scanned, report.skipped, report.failed, report.rejected
            );
            print_warnings(&report.warnings);
            Ok(())
        }
        CliCommand::List => list_configurations(app, format),
        CliCommand::Chain { config, npc } => {
            let chain = app.template_chain(&config, &npc)?;
            println!("{}", chain.trace());
            Ok(())
        }
        CliCommand::Select { npc, config } => {
            if app.select(&npc, &config)? {
                println!("{npc} now uses {config}");
            } else {
                println!("{npc} already uses {config}");
            }
            Ok(())
        }
        CliCommand::Clear { npc } => {
            if app.clear(&npc)? {
                println!("Cleared {npc}");
            } else {
                println!("{npc} had no selection");
            }
            Ok(())
        }
        CliCommand::Guest {
            target,
            config,
            source,
        } => {
            if app.add_guest(&target, &config, &source)? {
                println!("{target} can now borrow {source} from {config}");
            } else {
                println!("{target} already borrows {source} from {config}");
            }
            Ok(())
        }
        CliCommand::SelectGuest {
            target,
            config,
            source,
        } => {
            if app.select_guest(&target, &config, &source)? {
                println!("{target} now uses {source} from {config}");
            } else {
                println!("{target} already uses {source} from {config}");
            }
            Ok(())
        }
        CliCommand::RemoveGuest {
            target,
            config,
            source,
        } => {
            if app.remove_guest(&target, &config, &source)? {
                println!("Removed guest {source} ({config}) from {target}");
            } else {
                println!("{target} has no guest {source} from {config}");
            }
            Ok(())
        }
        CliCommand::Show { npc } => show_npc(app, &npc, format),
        CliCommand::SetFolders { config, folders } => {
            app.set_folders(&config, folders)?;
            println!("Updated {config}; run `visagesmith scan` to pick up the change");
            Ok(())
        }
        CliCommand::SelectAll {
            config,
            only_unselected,
        } => {
            let report = app.select_all(&config, only_unselected)?;
            println!("Selected {} NPC(s), skipped {}", report.applied, report.skipped);
            print_warnings(&report.warnings);
            Ok(())
        }
        CliCommand::ImportLoadOrder { only_unselected } => {
            let report = app.import_load_order(only_unselected)?;
            println!("Selected {} NPC(s), skipped {}", report.applied, report.skipped);
            print_warnings(&report.warnings);
            Ok(())
        }
        CliCommand::SetSource {
            config,
            plugin,
            npc,
        } => {
            let changed = app.set_source(&config, &plugin, npc.as_ref())?;
            println!(
                "{}",
                if changed {
                    "Source updated"
                } else {
                    "No NPC could take that source"
                }
            );
            Ok(())
        }
        CliCommand::Inspect { config } => {
            let (suitability, injection) = app.inspect_configuration(&config)?;
            println!(
                "Appearance records: {}, other records: {}, merge-in suitable: {}",
                suitability.appearance_records, suitability.other_records, suitability.suitable
            );
            println!(
                "Injected records: {}, missing masters: {}",
                injection.injected.len(),
                injection.missing_masters.len()
            );
            print_warnings(&injection.warnings);
            Ok(())
        }
        CliCommand::Mugshot { config, npc } => {
            match app.mugshot(&config, &npc)? {
                Some(path) => println!("{}", path.display()),
                None => println!("No mugshot for {npc} in {config}"),
            }
            Ok(())
        }
        CliCommand::Export { path } => {
            let count = app.export_selections(&path)?;
            println!("Exported {count} selection(s) to {}", path.display());
            Ok(())
        }
        CliCommand::Import { path, yes } => {
            let preview = app.preview_import(&path)?;
            println!(
                "{} valid, {} malformed, {} unresolved, {} unrecognized",
                preview.valid.len(),
                preview.malformed.len(),
                preview.unresolved.len(),
                preview.unrecognized.len()
            );
            for (key, err) in &preview.malformed {
                println!("  malformed {key}: {err}");
            }
            for (key, reason) in preview.unresolved.iter().chain(&preview.unrecognized) {
                println!("  rejected {key}: {reason}");
            }
            confirm(app, yes, "import")?;
            let applied = app.apply_import(&preview)?;
            println!("Applied {applied} selection(s)");
            Ok(())
        }
        CliCommand::ClearAll { yes } => {
            confirm(app, yes, "clear-all")?;
            let cleared = app.clear_all()?;
            println!("Cleared {cleared} selection(s)");
            Ok(())
        }
        CliCommand::Remove { config, yes } => {
            confirm(app, yes, "remove")?;
            let dropped = app.remove_configuration(&config)?;
            println!("Removed {config}; {dropped} selection(s) dropped");
            Ok(())
        }
        CliCommand::RestoreBackup => {
            let dir = app.restore_last_backup()?;
            println!("Restored library from {}", dir.display());
            Ok(())
        }
        CliCommand::Run => {
            let report = app.run(Some(print_progress()))?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => {
                    println!(
                        "Patched {} NPC(s), skipped {}, wrote {} record(s), copied {} asset(s)",
                        report.patched.len(),
                        report.skipped.len(),
                        report.records_written,
                        report.assets_copied
                    );
                    if let Some(path) = &report.output_plugin {
                        println!("Output plugin: {}", path.display());
                    }
                    for (npc, reason) in &report.skipped {
                        println!("  skipped {npc}: {reason}");
                    }
                    for asset in &report.missing_assets {
                        println!("  missing {asset}");
                    }
                    print_warnings(&report.warnings);
                }
            }
            Ok(())
        }
        CliCommand::Paths => list_paths(app, format),
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

#[derive(Serialize)]
struct ConfigurationListItem {
    name: String,
    plugins: Vec<String>,
    npcs: usize,
    ambiguous: usize,
    mugshots: bool,
    auto_generated: bool,
}

fn list_configurations(app: &App, format: OutputFormat) -> Result<()> {
    let items: Vec<ConfigurationListItem> = app
        .catalog
        .configurations
        .iter()
        .map(|config| ConfigurationListItem {
            name: config.display_name.clone(),
            plugins: config.plugins.iter().map(|key| key.to_string()).collect(),
            npcs: config.npc_count,
            ambiguous: config.ambiguous_npcs.len(),
            mugshots: config.has_mugshots(),
            auto_generated: config.is_auto_generated,
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            for item in items {
                let mugshots = if item.mugshots { "m" } else { " " };
                println!(
                    "{npcs:>5} [{mugshots}] {name} ({plugins})",
                    npcs = item.npcs,
                    name = item.name,
                    plugins = item.plugins.join(", ")
                );
            }
        }
    }
    Ok(())
}

fn show_npc(app: &App, npc: &FormKey, format: OutputFormat) -> Result<()> {
    let overview = app.npc_overview(npc)?;
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&overview)?);
        }
        OutputFormat::Text => {
            println!("{} ({})", overview.display_name, overview.key);
            println!("Offered by:  {}", overview.offered_by.join(", "));
            match &overview.selection {
                Some(selection) if selection.source_npc == overview.key => {
                    println!("Selected:    {}", selection.mod_name)
                }
                Some(selection) => println!(
                    "Selected:    {} (as {})",
                    selection.mod_name, selection.source_npc
                ),
                None => println!("Selected:    (none)"),
            }
            for guest in &overview.guests {
                println!(
                    "Guest:       {} from {} ({})",
                    guest.source_name, guest.mod_name, guest.source_npc
                );
            }
            for borrower in &overview.borrowed_by {
                println!("Borrowed by: {borrower}");
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct PathsReport {
    data_dir: String,
    log_file: String,
    game: String,
    game_data_dir: Option<String>,
    plugins_txt: Option<String>,
    record_dump_dir: Option<String>,
    mods_root: Option<String>,
    mugshots_root: Option<String>,
    output_dir: Option<String>,
    load_order_plugins: usize,
}

fn list_paths(app: &App, format: OutputFormat) -> Result<()> {
    let show = |path: &Option<PathBuf>| path.as_ref().map(|path| path.display().to_string());
    let report = PathsReport {
        data_dir: app.data_dir.display().to_string(),
        log_file: app.log_path().display().to_string(),
        game: app.config.game.display_name().to_string(),
        game_data_dir: show(&app.config.game_data_dir),
        plugins_txt: show(&app.config.plugins_txt),
        record_dump_dir: show(&app.config.record_dump_dir),
        mods_root: show(&app.config.mods_root),
        mugshots_root: show(&app.config.mugshots_root),
        output_dir: show(&app.config.output_dir),
        load_order_plugins: app.load_order.len(),
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            let unset = "(not set)".to_string();
            println!("Data dir:        {}", report.data_dir);
            println!("Log file:        {}", report.log_file);
            println!("Game:            {}", report.game);
            println!("Game data:       {}", report.game_data_dir.unwrap_or_else(|| unset.clone()));
            println!("plugins.txt:     {}", report.plugins_txt.unwrap_or_else(|| unset.clone()));
            println!("Record dumps:    {}", report.record_dump_dir.unwrap_or_else(|| unset.clone()));
            println!("Mods root:       {}", report.mods_root.unwrap_or_else(|| unset.clone()));
            println!("Mugshots root:   {}", report.mugshots_root.unwrap_or_else(|| unset.clone()));
            println!("Output dir:      {}", report.output_dir.unwrap_or(unset));
            println!("Load order:      {} plugin(s)", report.load_order_plugins);
        }
    }
    Ok(())
}

fn print_help() {
    println!("VisageSmith v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  visagesmith scan [--force]                      Rescan changed configurations");
    println!("  visagesmith list                                List appearance configurations");
    println!("  visagesmith chain <config> <formkey>            Show an NPC's template chain");
    println!("  visagesmith select <formkey> <config>           Choose a configuration for an NPC");
    println!("  visagesmith clear <formkey>                     Clear an NPC's selection");
    println!("  visagesmith guest <target> <config> <source>    Offer another NPC's appearance");
    println!("  visagesmith select-guest <target> <config> <source>  Use an offered guest");
    println!("  visagesmith remove-guest <target> <config> <source>  Withdraw a guest");
    println!("  visagesmith show <formkey>                      Offers, selection and guests of an NPC");
    println!("  visagesmith set-folders <config> <folder>...    Replace a configuration's folders");
    println!("  visagesmith select-all <config> [--only-unselected]");
    println!("  visagesmith import-load-order [--only-unselected]");
    println!("  visagesmith set-source <config> <plugin> [<formkey>]");
    println!("  visagesmith inspect <config>                    Merge-in and injected record checks");
    println!("  visagesmith mugshot <config> <formkey>          Locate a mugshot");
    println!("  visagesmith export <file>                       Write selections to a file");
    println!("  visagesmith import <file> [--yes]               Apply selections from a file");
    println!("  visagesmith clear-all [--yes]                   Clear every selection");
    println!("  visagesmith remove <config> [--yes]             Remove a configuration");
    println!("  visagesmith restore-backup                      Restore the last library backup");
    println!("  visagesmith run                                 Build the output plugin and assets");
    println!("  visagesmith paths                               Show configured paths");
    println!();
    println!("Global options:");
    println!("  --format <json|text>                            Output format for list/show/run/paths");
    println!("  -h, --help                                      Show help");
    println!("  -V, --version                                   Show version");
}
