// This module builds the single-shard metadata unit the runtime loader
// reads to stitch the shards back together: a fixed-order header record,
// one table row per shard referencing that shard's six suffixed index-table
// symbols, a small thread-local-storage support table, and a pointers
// record tying the pieces together. The byte layouts here are a versioned
// contract with the loader; bump META_FORMAT_VERSION when they change.
// The optional whole-program preamble unit embeds an opaque data blob plus
// its size word.

//! Loader metadata and preamble units.

use crate::unit::{CompilationUnit, Linkage, Symbol, TargetSpec, Visibility};
use crate::vartable::table_names;

/// Version of the metadata layout consumed by the loader.
pub const META_FORMAT_VERSION: u32 = 1;

pub const HEADER_SYMBOL: &str = "image_header";
pub const SHARD_TABLE_SYMBOL: &str = "image_shard_tables";
pub const TLS_TABLE_SYMBOL: &str = "image_tls_table";
pub const POINTERS_SYMBOL: &str = "image_pointers";
pub const PREAMBLE_DATA_SYMBOL: &str = "image_preamble_data";
pub const PREAMBLE_SIZE_SYMBOL: &str = "image_preamble_size";

const TLS_SLOTS: [&str; 3] = [
    "image_tls_getter_slot",
    "image_tls_key_slot",
    "image_tls_offset",
];

fn hidden(mut symbol: Symbol) -> Symbol {
    symbol.visibility = Visibility::Hidden;
    symbol.dso_local = true;
    symbol
}

/// Header record: {format version, shard count, function-symbol count,
/// global-symbol count}, little-endian u32s in that order.
pub fn header_bytes(shards: u32, nfvars: u32, ngvars: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    for word in [META_FORMAT_VERSION, shards, nfvars, ngvars] {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

/// Build the metadata unit for an image emitted as `shards` shards.
///
/// The shard table references every per-shard table symbol as an external
/// declaration; the definitions live in the shard objects and the linker
/// joins them up.
pub fn build_metadata_unit(
    target: &TargetSpec,
    shards: usize,
    nfvars: u32,
    ngvars: u32,
) -> CompilationUnit {
    let mut unit = CompilationUnit::new(target.clone());
    unit.suffix = Some("_meta".into());
    unit.debug_id = Some("image#meta".into());
    let ptr = usize::from(target.pointer_width);

    let mut header = Symbol::global(HEADER_SYMBOL, header_bytes(shards as u32, nfvars, ngvars));
    header.linkage = Linkage::Internal;
    unit.define(header).expect("fresh unit");

    // One declaration per referenced per-shard table symbol.
    let mut rows: Vec<String> = Vec::with_capacity(shards * 6);
    for shard in 0..shards {
        for name in table_names(&format!("_{shard}")) {
            unit.define(hidden(Symbol::global_decl(&name)))
                .expect("table names are unique per shard");
            rows.push(name);
        }
    }
    let shard_table = hidden(
        Symbol::global(SHARD_TABLE_SYMBOL, vec![0; ptr * rows.len()]).with_refs(rows),
    );
    unit.define(shard_table).expect("fresh unit");

    // Runtime support slots filled in at load time.
    for slot in TLS_SLOTS {
        unit.define(hidden(Symbol::global(slot, vec![0; ptr])))
            .expect("fresh unit");
    }
    let tls_table = hidden(
        Symbol::global(TLS_TABLE_SYMBOL, vec![0; ptr * TLS_SLOTS.len()])
            .with_refs(TLS_SLOTS.iter().map(|s| s.to_string()).collect()),
    );
    unit.define(tls_table).expect("fresh unit");

    let pointers = hidden(
        Symbol::global(POINTERS_SYMBOL, vec![0; ptr * 3]).with_refs(vec![
            HEADER_SYMBOL.into(),
            SHARD_TABLE_SYMBOL.into(),
            TLS_TABLE_SYMBOL.into(),
        ]),
    );
    unit.define(pointers).expect("fresh unit");
    unit
}

/// Build the optional whole-program preamble unit around an opaque blob.
pub fn build_preamble_unit(target: &TargetSpec, blob: &[u8]) -> CompilationUnit {
    let mut unit = CompilationUnit::new(target.clone());
    unit.suffix = Some("_preamble".into());
    unit.debug_id = Some("image#preamble".into());
    unit.define(Symbol::global(PREAMBLE_DATA_SYMBOL, blob.to_vec()))
        .expect("fresh unit");
    let mut size = vec![0u8; usize::from(target.pointer_width)];
    let len = (blob.len() as u64).to_le_bytes();
    let n = size.len().min(len.len());
    size[..n].copy_from_slice(&len[..n]);
    unit.define(Symbol::global(PREAMBLE_SIZE_SYMBOL, size))
        .expect("fresh unit");
    unit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::SymbolKind;

    fn init_of<'a>(unit: &'a CompilationUnit, name: &str) -> &'a [u8] {
        match &unit.get(name).unwrap().kind {
            SymbolKind::Global { init: Some(b) } => b,
            _ => panic!("`{name}` should be a defined global"),
        }
    }

    #[test]
    fn test_header_layout_is_fixed() {
        let bytes = header_bytes(4, 100, 25);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &META_FORMAT_VERSION.to_le_bytes());
        assert_eq!(&bytes[4..8], &4u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &100u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &25u32.to_le_bytes());
    }

    #[test]
    fn test_shard_table_references_every_shard() {
        let unit = build_metadata_unit(&TargetSpec::elf_x86_64(), 3, 10, 5);
        let table = unit.get(SHARD_TABLE_SYMBOL).unwrap();
        assert_eq!(table.refs.len(), 3 * 6);
        assert!(table.refs.contains(&"image_fvar_offsets_2".to_string()));
        assert_eq!(init_of(&unit, SHARD_TABLE_SYMBOL).len(), 8 * 18);
        // Referenced table symbols are declarations resolved at link time.
        let decl = unit.get("image_gvar_idxs_1").unwrap();
        assert!(!decl.is_definition());
        assert_eq!(decl.visibility, Visibility::Hidden);
    }

    #[test]
    fn test_tls_table_has_three_slots() {
        let unit = build_metadata_unit(&TargetSpec::elf_x86_64(), 1, 0, 0);
        let tls = unit.get(TLS_TABLE_SYMBOL).unwrap();
        assert_eq!(tls.refs.len(), 3);
        for slot in TLS_SLOTS {
            assert_eq!(init_of(&unit, slot).len(), 8);
        }
    }

    #[test]
    fn test_preamble_embeds_blob_and_size() {
        let blob = vec![0xabu8; 300];
        let unit = build_preamble_unit(&TargetSpec::elf_x86_64(), &blob);
        assert_eq!(init_of(&unit, PREAMBLE_DATA_SYMBOL), blob.as_slice());
        assert_eq!(
            init_of(&unit, PREAMBLE_SIZE_SYMBOL),
            &300u64.to_le_bytes()[..]
        );
    }
}
