use crate::archive::normalize_path;
use anyhow::{Context, Result};
use std::{fs, path::Path};

const MAX_STRING_LEN: usize = 512;

/// Texture paths baked into a mesh. NIF strings are stored as a little-endian
/// u32 length followed by the bytes; any such string ending in `.dds` counts.
pub fn texture_references(bytes: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        let start = pos + 4;
        if (5..=MAX_STRING_LEN).contains(&len) && start + len <= bytes.len() {
            let candidate = &bytes[start..start + len];
            if let Some(path) = texture_path(candidate) {
                if !out.contains(&path) {
                    out.push(path);
                }
                pos = start + len;
                continue;
            }
        }
        pos += 1;
    }
    out
}

pub fn texture_references_in_file(path: &Path) -> Result<Vec<String>> {
    let bytes = fs::read(path).with_context(|| format!("read mesh {:?}", path))?;
    Ok(texture_references(&bytes))
}

fn texture_path(raw: &[u8]) -> Option<String> {
    if !raw.iter().all(|byte| byte.is_ascii_graphic() || *byte == b' ') {
        return None;
    }
    let text = std::str::from_utf8(raw).ok()?;
    let normalized = normalize_path(text);
    if !normalized.ends_with(".dds") {
        return None;
    }
    let trimmed = normalized
        .strip_prefix("data/")
        .unwrap_or(&normalized)
        .to_string();
    if trimmed.starts_with("textures/") {
        Some(trimmed)
    } else {
        Some(format!("textures/{trimmed}"))
    }
}
