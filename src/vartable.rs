// This module regenerates the per-shard index tables after materialization.
// Each shard re-emits its local slice of the function and global indices as
// six symbols (base slot, pointer/offset table, flat-id table, for each of
// the two indices), named with the shard's uniqueness suffix so the loader
// can address any flat id as (shard, local offset) using per-shard tables
// alone. Flat ids are reproduced exactly; only their grouping changes.

//! Per-shard index-table reconstruction.

use crate::error::{ImageError, ImageResult};
use crate::extract::IndexTable;
use crate::partition::Partition;
use crate::unit::{CompilationUnit, Linkage, Symbol, Visibility};

/// Base names of the six per-shard table symbols, completed by the shard
/// suffix. The loader's shard table references exactly these.
pub const FVAR_BASE: &str = "image_fvar_base";
pub const FVAR_OFFSETS: &str = "image_fvar_offsets";
pub const FVAR_IDXS: &str = "image_fvar_idxs";
pub const GVAR_BASE: &str = "image_gvar_base";
pub const GVAR_OFFSETS: &str = "image_gvar_offsets";
pub const GVAR_IDXS: &str = "image_gvar_idxs";

/// All six table names with `suffix` appended, in loader order.
pub fn table_names(suffix: &str) -> [String; 6] {
    [
        format!("{FVAR_BASE}{suffix}"),
        format!("{FVAR_OFFSETS}{suffix}"),
        format!("{FVAR_IDXS}{suffix}"),
        format!("{GVAR_BASE}{suffix}"),
        format!("{GVAR_OFFSETS}{suffix}"),
        format!("{GVAR_IDXS}{suffix}"),
    ]
}

/// Parallel (flat id, symbol name) arrays sorted by flat id.
fn sorted_pairs(
    unit: &CompilationUnit,
    table: &hashbrown::HashMap<String, u32>,
) -> ImageResult<Vec<(u32, String)>> {
    let mut pairs: Vec<(u32, String)> = Vec::with_capacity(table.len());
    for (name, &id) in table {
        let symbol = unit.get(name).ok_or_else(|| ImageError::UnknownSymbol {
            name: name.clone(),
        })?;
        debug_assert!(symbol.is_definition(), "indexed `{name}` lost its body");
        pairs.push((id, name.clone()));
    }
    pairs.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    Ok(pairs)
}

fn emit_tables(
    unit: &mut CompilationUnit,
    pairs: &[(u32, String)],
    base: &str,
    offsets: &str,
    idxs: &str,
) -> ImageResult<()> {
    let suffix = unit.suffix.clone().unwrap_or_default();
    let ptr = usize::from(unit.target.pointer_width);

    // Base slot: one pointer-sized cell the loader fills in at run time.
    let mut base_sym = Symbol::global(format!("{base}{suffix}"), vec![0; ptr]);
    base_sym.visibility = Visibility::Hidden;
    base_sym.dso_local = true;
    unit.define(base_sym)?;

    // Offsets table: one address slot per local entry, in flat-id order.
    // The references carry the entry identity; the payload is relocation
    // fodder for the backend.
    let mut offsets_sym = Symbol::global(format!("{offsets}{suffix}"), vec![0; ptr * pairs.len()])
        .with_refs(pairs.iter().map(|(_, name)| name.clone()).collect());
    offsets_sym.visibility = Visibility::Hidden;
    offsets_sym.dso_local = true;
    unit.define(offsets_sym)?;

    // Flat-id table: the original ids, little-endian u32s.
    let mut id_bytes = Vec::with_capacity(4 * pairs.len());
    for (id, _) in pairs {
        id_bytes.extend_from_slice(&id.to_le_bytes());
    }
    let mut idxs_sym = Symbol::global(format!("{idxs}{suffix}"), id_bytes);
    idxs_sym.visibility = Visibility::Hidden;
    idxs_sym.dso_local = true;
    unit.define(idxs_sym)?;
    Ok(())
}

/// Re-emit the shard's local function/global index tables from the
/// partition's sub-tables.
pub fn construct_var_tables(
    unit: &mut CompilationUnit,
    partition: &Partition,
) -> ImageResult<()> {
    let fvar_pairs = sorted_pairs(unit, &partition.fvars)?;
    let gvar_pairs = sorted_pairs(unit, &partition.gvars)?;
    emit_tables(unit, &fvar_pairs, FVAR_BASE, FVAR_OFFSETS, FVAR_IDXS)?;
    emit_tables(unit, &gvar_pairs, GVAR_BASE, GVAR_OFFSETS, GVAR_IDXS)?;
    Ok(())
}

/// Single-shard variant: derive the tables straight from the unit's
/// resident index tables (flat ids are simply 0..n). Used by the
/// one-worker bypass path, which never builds a partition.
pub fn construct_full_tables(
    unit: &mut CompilationUnit,
    fvars: &IndexTable,
    gvars: &IndexTable,
) -> ImageResult<()> {
    let enumerate = |table: &IndexTable| {
        table
            .entries()
            .iter()
            .enumerate()
            .map(|(id, name)| (id as u32, name.clone()))
            .collect::<Vec<_>>()
    };
    let fvar_pairs = enumerate(fvars);
    let gvar_pairs = enumerate(gvars);
    emit_tables(unit, &fvar_pairs, FVAR_BASE, FVAR_OFFSETS, FVAR_IDXS)?;
    emit_tables(unit, &gvar_pairs, GVAR_BASE, GVAR_OFFSETS, GVAR_IDXS)?;
    Ok(())
}

// Local linkage would defeat the purpose: the metadata unit references
// these tables from a different object file.
#[allow(dead_code)]
fn tables_are_externally_reachable(unit: &CompilationUnit, suffix: &str) -> bool {
    table_names(suffix)
        .iter()
        .all(|n| unit.get(n).is_some_and(|s| s.linkage == Linkage::External))
}
