use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};
use thiserror::Error;

const PLUGIN_EXTENSIONS: [&str; 3] = ["esp", "esm", "esl"];

/// A plugin file name such as `Skyrim.esm`. Compared case-insensitively.
#[derive(Debug, Clone)]
pub struct ModKey {
    name: String,
    folded: String,
}

impl ModKey {
    pub fn new(name: &str) -> Self {
        let name = name.trim().to_string();
        let folded = name.to_ascii_lowercase();
        Self { name, folded }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lower-cased file name, used for FaceGen folders and path matching.
    pub fn folded(&self) -> &str {
        &self.folded
    }

    pub fn stem(&self) -> &str {
        match self.name.rfind('.') {
            Some(idx) => &self.name[..idx],
            None => &self.name,
        }
    }

    pub fn is_plugin_file(name: &str) -> bool {
        let Some((_, ext)) = name.rsplit_once('.') else {
            return false;
        };
        PLUGIN_EXTENSIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(ext))
    }
}

impl PartialEq for ModKey {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}

impl Eq for ModKey {}

impl Hash for ModKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}

impl PartialOrd for ModKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded.cmp(&other.folded)
    }
}

impl fmt::Display for ModKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Serialize for ModKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for ModKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ModKey::new(&raw))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormKeyError {
    #[error("missing ':' separator in form key {0:?}")]
    MissingSeparator(String),
    #[error("invalid form id {0:?}")]
    InvalidId(String),
    #[error("{0:?} is not a plugin file name")]
    InvalidPlugin(String),
}

/// A record identity: a local id inside the plugin that first defined it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormKey {
    pub mod_key: ModKey,
    pub id: u32,
}

impl FormKey {
    pub fn new(id: u32, mod_key: ModKey) -> Self {
        Self {
            mod_key,
            id: id & 0x00FF_FFFF,
        }
    }
}

impl FromStr for FormKey {
    type Err = FormKeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let (id, plugin) = value
            .split_once(':')
            .ok_or_else(|| FormKeyError::MissingSeparator(value.to_string()))?;
        if id.is_empty() || id.len() > 8 {
            return Err(FormKeyError::InvalidId(id.to_string()));
        }
        let id = u32::from_str_radix(id, 16).map_err(|_| FormKeyError::InvalidId(id.to_string()))?;
        if !ModKey::is_plugin_file(plugin) {
            return Err(FormKeyError::InvalidPlugin(plugin.to_string()));
        }
        Ok(FormKey::new(id, ModKey::new(plugin)))
    }
}

impl fmt::Display for FormKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06X}:{}", self.id, self.mod_key)
    }
}

impl Serialize for FormKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FormKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
