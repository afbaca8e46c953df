// This module pulls the two reserved index-table symbols out of a
// compilation unit before partitioning. The tables map a flat integer id to
// a symbol; the runtime loader uses them to locate compiled code and data
// by id regardless of which shard a symbol landed in. Removing the table
// symbols also removes their reference edges, which would otherwise glue
// the whole unit into one connected component.

//! Index-table extraction.

use hashbrown::HashMap;

use crate::error::{ImageError, ImageResult};
use crate::unit::{CompilationUnit, SymbolKind, FUNCTION_INDEX_SYMBOL, GLOBAL_INDEX_SYMBOL};

/// Ordered mapping of flat id to symbol name, with reverse lookup.
#[derive(Debug, Clone, Default)]
pub struct IndexTable {
    entries: Vec<String>,
    by_name: HashMap<String, u32>,
}

impl IndexTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flat id of `name`, if it appears in this table.
    pub fn flat_id(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Entries in flat-id order.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// Locate and remove both index-table symbols, returning the decoded
/// function and global tables.
///
/// Any problem here is an internal-consistency error in the input unit,
/// not a user-facing condition: the front end always emits both tables.
pub fn extract_index_tables(
    unit: &mut CompilationUnit,
) -> ImageResult<(IndexTable, IndexTable)> {
    let fvars = extract_table(unit, FUNCTION_INDEX_SYMBOL)?;
    let gvars = extract_table(unit, GLOBAL_INDEX_SYMBOL)?;
    Ok((fvars, gvars))
}

fn extract_table(unit: &mut CompilationUnit, table: &'static str) -> ImageResult<IndexTable> {
    let symbol = unit
        .remove(table)
        .ok_or(ImageError::MissingIndexTable { table })?;
    match &symbol.kind {
        SymbolKind::Global { init: Some(_) } => {}
        SymbolKind::Global { init: None } => {
            return Err(ImageError::MalformedIndexTable {
                table,
                reason: "table symbol is a declaration".into(),
            })
        }
        _ => {
            return Err(ImageError::MalformedIndexTable {
                table,
                reason: "table symbol is not a global variable".into(),
            })
        }
    }

    let mut out = IndexTable::default();
    for (id, name) in symbol.refs.iter().enumerate() {
        if name.is_empty() {
            return Err(ImageError::MalformedIndexTable {
                table,
                reason: format!("entry {id} is unnamed"),
            });
        }
        let entry = unit
            .get(name)
            .ok_or_else(|| ImageError::MalformedIndexTable {
                table,
                reason: format!("entry {id} names unknown symbol `{name}`"),
            })?;
        if !entry.is_definition() {
            return Err(ImageError::MalformedIndexTable {
                table,
                reason: format!("entry {id} (`{name}`) is a declaration"),
            });
        }
        if out.by_name.insert(name.clone(), id as u32).is_some() {
            return Err(ImageError::MalformedIndexTable {
                table,
                reason: format!("duplicate entry `{name}`"),
            });
        }
        out.entries.push(name.clone());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{FunctionBody, Symbol, TargetSpec};

    fn unit_with_tables() -> CompilationUnit {
        let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
        unit.define(Symbol::function("f0", FunctionBody::default()))
            .unwrap();
        unit.define(Symbol::function("f1", FunctionBody::default()))
            .unwrap();
        unit.define(Symbol::global("g0", vec![1, 2])).unwrap();
        unit.define(
            Symbol::global(FUNCTION_INDEX_SYMBOL, vec![])
                .with_refs(vec!["f0".into(), "f1".into()]),
        )
        .unwrap();
        unit.define(Symbol::global(GLOBAL_INDEX_SYMBOL, vec![]).with_refs(vec!["g0".into()]))
            .unwrap();
        unit
    }

    #[test]
    fn test_extract_removes_tables_and_maps_ids() {
        let mut unit = unit_with_tables();
        let (fvars, gvars) = extract_index_tables(&mut unit).unwrap();
        assert_eq!(fvars.len(), 2);
        assert_eq!(fvars.flat_id("f1"), Some(1));
        assert_eq!(gvars.flat_id("g0"), Some(0));
        assert!(!unit.contains(FUNCTION_INDEX_SYMBOL));
        assert!(!unit.contains(GLOBAL_INDEX_SYMBOL));
    }

    #[test]
    fn test_missing_table_is_fatal() {
        let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
        let err = extract_index_tables(&mut unit).unwrap_err();
        assert!(matches!(err, ImageError::MissingIndexTable { .. }));
    }

    #[test]
    fn test_unknown_entry_is_fatal() {
        let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
        unit.define(Symbol::global(FUNCTION_INDEX_SYMBOL, vec![]).with_refs(vec!["nope".into()]))
            .unwrap();
        unit.define(Symbol::global(GLOBAL_INDEX_SYMBOL, vec![]))
            .unwrap();
        let err = extract_index_tables(&mut unit).unwrap_err();
        assert!(matches!(err, ImageError::MalformedIndexTable { .. }));
    }

    #[test]
    fn test_duplicate_entry_is_fatal() {
        let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
        unit.define(Symbol::function("f0", FunctionBody::default()))
            .unwrap();
        unit.define(
            Symbol::global(FUNCTION_INDEX_SYMBOL, vec![])
                .with_refs(vec!["f0".into(), "f0".into()]),
        )
        .unwrap();
        unit.define(Symbol::global(GLOBAL_INDEX_SYMBOL, vec![]))
            .unwrap();
        let err = extract_index_tables(&mut unit).unwrap_err();
        assert!(matches!(err, ImageError::MalformedIndexTable { .. }));
    }
}
