//! Directory store composition.
//!
//! Each layer keeps its own `(parent_ino, name) -> child_ino` table; the
//! functions here compose them into the single logical namespace. A delta
//! entry always wins, a whiteout hides the base binding underneath it, and
//! enumeration yields the union in lexicographic order.

use std::collections::BTreeMap;

use redb::ReadableTable;

use crate::error::Result;

/// Single logical lookup of `name` under `parent`: delta entry, else
/// whiteout check, else base entry.
pub(crate) fn lookup_child(
    delta_dirs: &impl ReadableTable<(u64, &'static str), u64>,
    base_dirs: &impl ReadableTable<(u64, &'static str), u64>,
    whiteouts: &impl ReadableTable<(u64, &'static str), ()>,
    parent: u64,
    name: &str,
) -> Result<Option<u64>> {
    if let Some(child) = delta_dirs.get((parent, name))? {
        return Ok(Some(child.value()));
    }
    if whiteouts.get((parent, name))?.is_some() {
        return Ok(None);
    }
    Ok(base_dirs.get((parent, name))?.map(|c| c.value()))
}

/// Union listing of a logical directory: base entries minus whited-out
/// names, overlaid with delta entries (delta wins on collision). The
/// BTreeMap gives the lexicographic order the enumeration contract
/// requires.
pub(crate) fn list_union(
    delta_dirs: &impl ReadableTable<(u64, &'static str), u64>,
    base_dirs: &impl ReadableTable<(u64, &'static str), u64>,
    whiteouts: &impl ReadableTable<(u64, &'static str), ()>,
    parent: u64,
) -> Result<Vec<(String, u64)>> {
    let mut entries: BTreeMap<String, u64> = BTreeMap::new();

    for entry in base_dirs.range((parent, "")..)? {
        let (key, child) = entry?;
        let (entry_parent, name) = key.value();
        if entry_parent != parent {
            break;
        }
        if whiteouts.get((parent, name))?.is_none() {
            entries.insert(name.to_string(), child.value());
        }
    }

    for entry in delta_dirs.range((parent, "")..)? {
        let (key, child) = entry?;
        let (entry_parent, name) = key.value();
        if entry_parent != parent {
            break;
        }
        entries.insert(name.to_string(), child.value());
    }

    Ok(entries.into_iter().collect())
}

/// Whether the logical directory has at least one visible entry. Cheaper
/// than [`list_union`] for emptiness checks and derived directory nlink.
pub(crate) fn has_live_child(
    delta_dirs: &impl ReadableTable<(u64, &'static str), u64>,
    base_dirs: &impl ReadableTable<(u64, &'static str), u64>,
    whiteouts: &impl ReadableTable<(u64, &'static str), ()>,
    parent: u64,
) -> Result<bool> {
    for entry in delta_dirs.range((parent, "")..)? {
        let (key, _) = entry?;
        let (entry_parent, _) = key.value();
        if entry_parent == parent {
            return Ok(true);
        }
        break;
    }
    for entry in base_dirs.range((parent, "")..)? {
        let (key, _) = entry?;
        let (entry_parent, name) = key.value();
        if entry_parent != parent {
            break;
        }
        if whiteouts.get((parent, name))?.is_none() {
            return Ok(true);
        }
    }
    Ok(false)
}
