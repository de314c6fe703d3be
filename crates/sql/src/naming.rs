//! Physical identifiers for tables and columns.
//!
//! Logical paths are joined with the `__` separator only here, at the naming
//! boundary. Every identifier is canonicalized to `[a-z0-9_]` and truncated to
//! the dialect's limit.

use sha2::{Digest, Sha256};
use tablesink_core::{FieldPath, LeafKind, SEPARATOR};

/// Lower-cases `raw`, replaces anything outside `[a-z0-9_]` with `_`, prefixes
/// a leading digit with `_` and truncates to `max_len`.
pub fn canonicalize_identifier(raw: &str, max_len: usize) -> String {
    let mut out: String = raw
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    truncate(out, max_len)
}

fn truncate(mut name: String, max_len: usize) -> String {
    // Canonical identifiers are ASCII, so byte and char offsets agree.
    if name.len() > max_len {
        name.truncate(max_len.max(1));
    }
    name
}

/// Appends `suffix` to `base`, shortening `base` so the whole fits `max_len`.
fn with_suffix(base: &str, suffix: &str, max_len: usize) -> String {
    let keep = max_len.saturating_sub(suffix.len()).max(1);
    let mut name = canonicalize_identifier(base, keep);
    name.push_str(suffix);
    name
}

/// Table name for `path` below `stream`; pending version tables get a
/// `__v<version>` suffix that survives truncation.
pub fn table_name(
    stream: &str,
    path: &FieldPath,
    pending_version: Option<i64>,
    max_len: usize,
) -> String {
    let base = if path.is_root() {
        stream.to_string()
    } else {
        format!("{stream}{SEPARATOR}{}", path.join(SEPARATOR))
    };
    match pending_version {
        Some(version) => {
            let suffix = canonicalize_identifier(&format!("{SEPARATOR}v{version}"), max_len);
            with_suffix(&base, &suffix, max_len)
        }
        None => canonicalize_identifier(&base, max_len),
    }
}

/// Column name for `path`; family members carry their kind suffix.
pub fn column_name(path: &FieldPath, kind: Option<LeafKind>, max_len: usize) -> String {
    let base = path.join(SEPARATOR);
    match kind {
        Some(kind) => with_suffix(&base, &format!("{SEPARATOR}{}", kind.suffix()), max_len),
        None => canonicalize_identifier(&base, max_len),
    }
}

/// Name of the key index on `table`. When the plain name would be truncated,
/// a digest of the table name keeps indexes of similar tables apart.
pub fn index_name(table: &str, max_len: usize) -> String {
    let suffix = format!("{SEPARATOR}keys_idx");
    let plain = canonicalize_identifier(&format!("{table}{suffix}"), usize::MAX);
    if plain.len() <= max_len {
        return plain;
    }
    let digest = hex::encode(Sha256::digest(table.as_bytes()));
    with_suffix(table, &format!("{SEPARATOR}{}{suffix}", &digest[..8]), max_len)
}

/// First `name__<n>` (n starting at 1) for which `taken` is false.
pub fn disambiguate(name: &str, max_len: usize, taken: impl Fn(&str) -> bool) -> String {
    let mut attempt = 1usize;
    loop {
        let candidate = with_suffix(name, &format!("{SEPARATOR}{attempt}"), max_len);
        if !taken(&candidate) {
            return candidate;
        }
        attempt += 1;
    }
}
