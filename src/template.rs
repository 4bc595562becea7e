use crate::{
    catalog::ModConfiguration,
    environment::{EngineContext, Plugin, Record, RecordData},
    formkey::{FormKey, ModKey},
};
use std::sync::Arc;
use thiserror::Error;

pub const MAX_TEMPLATE_DEPTH: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainSource {
    /// Provided by one of the configuration's own plugins.
    Plugin(ModKey),
    /// Only present in the active load order; merged in rather than copied.
    LoadOrder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub key: FormKey,
    pub display: String,
    pub source: ChainSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateChain {
    pub links: Vec<ChainLink>,
}

impl TemplateChain {
    pub fn keys(&self) -> Vec<FormKey> {
        self.links.iter().map(|link| link.key.clone()).collect()
    }

    pub fn terminal(&self) -> Option<&ChainLink> {
        self.links.last()
    }

    /// True when the starting NPC takes its appearance from a template.
    pub fn inherits(&self) -> bool {
        self.links.len() > 1
    }

    /// Chain members provided by the configuration itself.
    pub fn local_keys(&self) -> Vec<FormKey> {
        self.links
            .iter()
            .filter(|link| matches!(link.source, ChainSource::Plugin(_)))
            .map(|link| link.key.clone())
            .collect()
    }

    pub fn trace(&self) -> String {
        format_trace(&self.links)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateChainError {
    #[error("{npc} is defined by several plugins and none is chosen: {trace}")]
    Ambiguous { npc: FormKey, trace: String },
    #[error("{npc} could not be found: {trace}")]
    Unresolved { npc: FormKey, trace: String },
    #[error("{npc} is a leveled list and cannot end a template chain: {trace}")]
    LeveledList { npc: FormKey, trace: String },
    #[error("{npc} uses template traits but has no template: {trace}")]
    MissingTarget { npc: FormKey, trace: String },
    #[error("template chain exceeded {MAX_TEMPLATE_DEPTH} steps: {trace}")]
    MaxDepthExceeded { trace: String },
}

impl TemplateChainError {
    pub fn trace(&self) -> &str {
        match self {
            Self::Ambiguous { trace, .. }
            | Self::Unresolved { trace, .. }
            | Self::LeveledList { trace, .. }
            | Self::MissingTarget { trace, .. }
            | Self::MaxDepthExceeded { trace } => trace,
        }
    }
}

/// Follows "use traits" template links from `start` until a record that
/// defines its own appearance. Never guesses between plugins.
pub fn resolve_template_chain(
    start: &FormKey,
    config: &ModConfiguration,
    ctx: &EngineContext,
) -> Result<TemplateChain, TemplateChainError> {
    let plugins: Vec<Arc<Plugin>> = config
        .appearance_plugins()
        .iter()
        .filter_map(|key| ctx.plugins.try_get_plugin(key, &config.folder_paths))
        .map(|(plugin, _)| plugin)
        .collect();

    let mut links: Vec<ChainLink> = Vec::new();
    let mut current = start.clone();

    for _ in 0..MAX_TEMPLATE_DEPTH {
        let (record, source) = match locate(&current, config, &plugins) {
            Located::Found(record, plugin) => (record, ChainSource::Plugin(plugin)),
            Located::Ambiguous => {
                return Err(TemplateChainError::Ambiguous {
                    trace: trace_with(&links, &current, ctx),
                    npc: current,
                })
            }
            Located::Missing => {
                if let Some(record) = ctx.link_cache.resolve_npc(&current) {
                    (record.as_ref().clone(), ChainSource::LoadOrder)
                } else if ctx.link_cache.resolve_leveled_npc(&current).is_some() {
                    return Err(TemplateChainError::LeveledList {
                        trace: trace_with(&links, &current, ctx),
                        npc: current,
                    });
                } else {
                    return Err(TemplateChainError::Unresolved {
                        trace: trace_with(&links, &current, ctx),
                        npc: current,
                    });
                }
            }
        };

        let npc = match &record.data {
            RecordData::Npc(npc) => npc,
            RecordData::LeveledNpc(_) => {
                return Err(TemplateChainError::LeveledList {
                    trace: trace_with(&links, &current, ctx),
                    npc: current,
                })
            }
            _ => {
                return Err(TemplateChainError::Unresolved {
                    trace: trace_with(&links, &current, ctx),
                    npc: current,
                })
            }
        };

        links.push(ChainLink {
            key: current.clone(),
            display: record.display_name(ctx.language()),
            source,
        });

        if !npc.use_traits {
            return Ok(TemplateChain { links });
        }
        match &npc.template {
            Some(next) => current = next.clone(),
            None => {
                return Err(TemplateChainError::MissingTarget {
                    npc: current,
                    trace: format_trace(&links),
                })
            }
        }
    }

    Err(TemplateChainError::MaxDepthExceeded {
        trace: trace_with(&links, &current, ctx),
    })
}

enum Located {
    Found(Record, ModKey),
    Ambiguous,
    Missing,
}

fn locate(key: &FormKey, config: &ModConfiguration, plugins: &[Arc<Plugin>]) -> Located {
    let defining: Vec<&Arc<Plugin>> = plugins
        .iter()
        .filter(|plugin| plugin.record(key).is_some())
        .collect();
    let chosen = match defining.len() {
        0 => return Located::Missing,
        1 => defining[0],
        _ => {
            let stored = config.disambiguation.get(key);
            match defining
                .iter()
                .find(|plugin| Some(&plugin.mod_key) == stored)
            {
                Some(plugin) => *plugin,
                None => return Located::Ambiguous,
            }
        }
    };
    match chosen.record(key) {
        Some(record) => Located::Found(record.clone(), chosen.mod_key.clone()),
        None => Located::Missing,
    }
}

fn trace_with(links: &[ChainLink], pending: &FormKey, ctx: &EngineContext) -> String {
    let display = ctx
        .link_cache
        .resolve(pending)
        .map(|record| record.display_name(ctx.language()))
        .unwrap_or_else(|| "?".to_string());
    let mut all = links.to_vec();
    all.push(ChainLink {
        key: pending.clone(),
        display,
        source: ChainSource::LoadOrder,
    });
    format_trace(&all)
}

fn format_trace(links: &[ChainLink]) -> String {
    links
        .iter()
        .map(|link| format!("{} ({})", link.key, link.display))
        .collect::<Vec<_>>()
        .join(" -> ")
}
