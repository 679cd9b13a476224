// src/paths.rs

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::{DownloadableItem, SourceKind};

/// Longest file name we emit, leaving headroom under the usual 255-byte limit
/// for a collision counter and the temporary-file suffix.
pub const MAX_NAME_BYTES: usize = 180;

/// Anything after the last dot that is longer than this is not treated as
/// an extension.
const MAX_EXTENSION_BYTES: usize = 16;

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

fn is_forbidden(c: char) -> bool {
    matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
}

/// Turns arbitrary remote text into a single valid path component.
pub fn sanitize_component(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if is_forbidden(c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "_".to_string();
    }

    let stem_upper = trimmed
        .split('.')
        .next()
        .unwrap_or_default()
        .trim_end()
        .to_ascii_uppercase();
    let named = if RESERVED_NAMES.contains(&stem_upper.as_str()) {
        format!("_{trimmed}")
    } else {
        trimmed.to_string()
    };

    truncate_preserving_extension(&named, MAX_NAME_BYTES)
}

/// Splits `name` into stem and extension (with its dot). Leading-dot names
/// and implausibly long suffixes have no extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= MAX_EXTENSION_BYTES + 1 => {
            (&name[..dot], &name[dot..])
        }
        _ => (name, ""),
    }
}

fn truncate_preserving_extension(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let (stem, extension) = split_extension(name);
    let mut cut = max.saturating_sub(extension.len()).min(stem.len());
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    let kept = stem[..cut].trim_end();
    if kept.is_empty() {
        format!("_{extension}")
    } else {
        format!("{kept}{extension}")
    }
}

/// `name (n).ext`
pub fn with_counter(name: &str, n: usize) -> String {
    let (stem, extension) = split_extension(name);
    format!("{stem} ({n}){extension}")
}

/// `dest_root/<course>/<kind>/<name>`, sanitized. Pure; collisions are the
/// caller's business.
pub fn resolve(
    dest_root: &Path,
    course_ref: &str,
    kind: SourceKind,
    suggested_name: &str,
) -> PathBuf {
    dest_root
        .join(sanitize_component(course_ref))
        .join(kind.as_str())
        .join(sanitize_component(suggested_name))
}

/// Hands out target paths that are unique within one manifest.
///
/// Files already on disk are not considered here; the overwrite policy
/// deals with those at execution time.
#[derive(Debug, Default)]
pub struct PathResolver {
    taken: HashSet<String>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, dest_root: &Path, item: &DownloadableItem) -> PathBuf {
        let base = resolve(dest_root, &item.course_ref, item.source_kind, &item.suggested_name);
        if self.taken.insert(collision_key(&base)) {
            return base;
        }

        let dir = base.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = sanitize_component(&item.suggested_name);
        let mut n = 1;
        loop {
            let candidate = dir.join(with_counter(&name, n));
            if self.taken.insert(collision_key(&candidate)) {
                return candidate;
            }
            n += 1;
        }
    }
}

// Case-folded so two entries never share a file on case-insensitive filesystems.
fn collision_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}
