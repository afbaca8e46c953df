// This module defines the symbol-level data model consumed by the sharded
// emission pipeline. A CompilationUnit is an insertion-ordered container of
// Symbols plus a target descriptor; each Symbol is a closed tagged variant
// over functions, global variables, and aliases, carrying the linkage and
// visibility attributes the partitioner and materializer manipulate. The
// front end builds a unit, this crate consumes and empties it.

//! Compilation-unit and symbol model.
//!
//! Symbols are keyed by name. Reference edges between symbols are stored as
//! name lists, so cross-shard linkage falls out of ordinary symbol
//! resolution once shards are compiled separately.

use hashbrown::HashMap;

use crate::error::{ImageError, ImageResult};

/// Reserved name of the function index table symbol.
pub const FUNCTION_INDEX_SYMBOL: &str = "image_fvars";
/// Reserved name of the global index table symbol.
pub const GLOBAL_INDEX_SYMBOL: &str = "image_gvars";
/// Reserved prefix for synthetic names assigned to unnamed definitions.
pub const ANON_NAME_PREFIX: &str = "image_anon_";

/// Object container format of the emission target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Elf,
    MachO,
    Coff,
}

/// Instruction-set architecture of the emission target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    Aarch64,
}

/// Target platform descriptor carried by every unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub format: BinaryFormat,
    pub arch: Architecture,
    /// Pointer width in bytes.
    pub pointer_width: u8,
}

impl TargetSpec {
    pub fn elf_x86_64() -> Self {
        TargetSpec {
            format: BinaryFormat::Elf,
            arch: Architecture::X86_64,
            pointer_width: 8,
        }
    }

    /// Ceiling on external symbols imposed by the object format, if any.
    ///
    /// COFF caps external symbols (even hidden ones) at 65536; a few are
    /// reserved for symbols inserted during emission.
    pub fn external_symbol_limit(&self) -> Option<usize> {
        match self.format {
            BinaryFormat::Coff => Some(64_000),
            _ => None,
        }
    }
}

/// Linkage of a symbol. Internal symbols never participate in cross-shard
/// resolution; every shard keeps its own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    External,
    Internal,
}

/// ELF-style visibility. Hidden symbols resolve within the final image but
/// are not exported from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Hidden,
}

/// Body of a defined function: emitted code bytes plus the size hints the
/// partitioner turns into a compile-cost estimate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionBody {
    pub code: Vec<u8>,
    pub instructions: u32,
    pub basic_blocks: u32,
}

/// Closed set of symbol kinds. Every stage matches exhaustively on this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolKind {
    /// `body` is `None` for declarations.
    Function { body: Option<FunctionBody> },
    /// `init` is `None` for declarations.
    Global { init: Option<Vec<u8>> },
    /// Aliases are always definitions; `target` names another unit symbol.
    Alias { target: String },
}

/// A named function, global variable, or alias within a compilation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Empty until synthetic naming runs; partitioning requires a name.
    pub name: String,
    pub kind: SymbolKind,
    pub linkage: Linkage,
    pub visibility: Visibility,
    /// Platform-local binding: the symbol resolves within the emitted image.
    pub dso_local: bool,
    /// Excluded from partitioning (e.g. forced-inline helpers); such symbols
    /// stay locally internal and are never referenced across shards.
    pub no_partition: bool,
    /// Hex-encoded variant bitmask; each set bit is one extra clone the
    /// backend will emit, multiplying compile cost.
    pub clone_mask: Option<String>,
    /// Names of symbols this symbol uses.
    pub refs: Vec<String>,
}

impl Symbol {
    pub fn function(name: impl Into<String>, body: FunctionBody) -> Self {
        Symbol::with_kind(name, SymbolKind::Function { body: Some(body) })
    }

    pub fn function_decl(name: impl Into<String>) -> Self {
        Symbol::with_kind(name, SymbolKind::Function { body: None })
    }

    pub fn global(name: impl Into<String>, init: Vec<u8>) -> Self {
        Symbol::with_kind(name, SymbolKind::Global { init: Some(init) })
    }

    pub fn global_decl(name: impl Into<String>) -> Self {
        Symbol::with_kind(name, SymbolKind::Global { init: None })
    }

    pub fn alias(name: impl Into<String>, target: impl Into<String>) -> Self {
        Symbol::with_kind(
            name,
            SymbolKind::Alias {
                target: target.into(),
            },
        )
    }

    fn with_kind(name: impl Into<String>, kind: SymbolKind) -> Self {
        Symbol {
            name: name.into(),
            kind,
            linkage: Linkage::External,
            visibility: Visibility::Default,
            dso_local: false,
            no_partition: false,
            clone_mask: None,
            refs: Vec::new(),
        }
    }

    pub fn with_refs(mut self, refs: Vec<String>) -> Self {
        self.refs = refs;
        self
    }

    pub fn is_definition(&self) -> bool {
        match &self.kind {
            SymbolKind::Function { body } => body.is_some(),
            SymbolKind::Global { init } => init.is_some(),
            SymbolKind::Alias { .. } => true,
        }
    }

    pub fn is_local(&self) -> bool {
        self.linkage == Linkage::Internal
    }

    /// All outgoing reference edges, including an alias's target.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        let target = match &self.kind {
            SymbolKind::Alias { target } => Some(target.as_str()),
            _ => None,
        };
        self.refs.iter().map(String::as_str).chain(target)
    }

    /// Rewrite every reference to `old` (including an alias target) to `new`.
    pub fn retarget(&mut self, old: &str, new: &str) {
        for r in &mut self.refs {
            if r == old {
                *r = new.to_string();
            }
        }
        if let SymbolKind::Alias { target } = &mut self.kind {
            if target == old {
                *target = new.to_string();
            }
        }
    }

    /// Demote this symbol to an externally visible declaration that the
    /// linker resolves against some other shard's definition.
    pub fn strip_to_declaration(&mut self) {
        match &mut self.kind {
            SymbolKind::Function { body } => *body = None,
            SymbolKind::Global { init } => *init = None,
            // Aliases cannot be declarations; the materializer swaps them
            // out before stripping.
            SymbolKind::Alias { .. } => unreachable!("cannot strip an alias"),
        }
        self.linkage = Linkage::External;
        self.visibility = Visibility::Hidden;
        self.dso_local = true;
    }
}

/// Mutable container of symbols produced by the front end and consumed by
/// the emission pipeline.
///
/// Iteration order is insertion order, which keeps every downstream stage
/// deterministic for identical inputs.
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    pub target: TargetSpec,
    /// Per-shard uniqueness suffix, stamped during materialization.
    pub suffix: Option<String>,
    /// Identity record for whole-unit debug metadata; must be unique per
    /// shard so a later link does not collapse the records.
    pub debug_id: Option<String>,
    symbols: Vec<Symbol>,
    by_name: HashMap<String, usize>,
}

impl CompilationUnit {
    pub fn new(target: TargetSpec) -> Self {
        CompilationUnit {
            target,
            suffix: None,
            debug_id: None,
            symbols: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Add a symbol. Non-empty names must be unique within the unit;
    /// unnamed symbols are allowed until synthetic naming runs.
    pub fn define(&mut self, symbol: Symbol) -> ImageResult<()> {
        if !symbol.name.is_empty() {
            if self.by_name.contains_key(&symbol.name) {
                return Err(ImageError::DuplicateSymbol {
                    name: symbol.name.clone(),
                });
            }
            self.by_name.insert(symbol.name.clone(), self.symbols.len());
        }
        self.symbols.push(symbol);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|&i| &self.symbols[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        let idx = *self.by_name.get(name)?;
        Some(&mut self.symbols[idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Remove a symbol by name. Only used for the rare structural edits
    /// (index-table extraction, alias deletion), so the O(n) reindex is
    /// irrelevant.
    pub fn remove(&mut self, name: &str) -> Option<Symbol> {
        let idx = self.by_name.remove(name)?;
        let symbol = self.symbols.remove(idx);
        for slot in self.by_name.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        Some(symbol)
    }

    /// Rename a symbol, keeping the name index consistent. The new name
    /// must not already be taken.
    pub fn rename(&mut self, old: &str, new: &str) -> ImageResult<()> {
        if self.by_name.contains_key(new) {
            return Err(ImageError::DuplicateSymbol {
                name: new.to_string(),
            });
        }
        let idx = self
            .by_name
            .remove(old)
            .ok_or_else(|| ImageError::UnknownSymbol {
                name: old.to_string(),
            })?;
        self.symbols[idx].name = new.to_string();
        self.by_name.insert(new.to_string(), idx);
        Ok(())
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn symbols_mut(&mut self) -> impl Iterator<Item = &mut Symbol> {
        self.symbols.iter_mut()
    }

    /// Give every unnamed definition a reserved synthetic name. Returns the
    /// number of names assigned. Partitioning is name-keyed, so this must
    /// run before it.
    pub fn assign_anonymous_names(&mut self) -> usize {
        let mut counter = 0usize;
        let mut assigned = 0usize;
        for idx in 0..self.symbols.len() {
            if self.symbols[idx].name.is_empty() && self.symbols[idx].is_definition() {
                let name = loop {
                    let candidate = format!("{ANON_NAME_PREFIX}{counter}");
                    counter += 1;
                    if !self.by_name.contains_key(&candidate) {
                        break candidate;
                    }
                };
                self.symbols[idx].name = name.clone();
                self.by_name.insert(name, idx);
                assigned += 1;
            }
        }
        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_names_rejected() {
        let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
        unit.define(Symbol::global("a", vec![0])).unwrap();
        let err = unit.define(Symbol::global("a", vec![1])).unwrap_err();
        assert!(matches!(err, ImageError::DuplicateSymbol { .. }));
    }

    #[test]
    fn test_remove_keeps_index_consistent() {
        let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
        unit.define(Symbol::global("a", vec![])).unwrap();
        unit.define(Symbol::global("b", vec![])).unwrap();
        unit.define(Symbol::global("c", vec![])).unwrap();
        assert!(unit.remove("b").is_some());
        assert_eq!(unit.get("c").unwrap().name, "c");
        assert_eq!(unit.len(), 2);
        assert!(unit.get("b").is_none());
    }

    #[test]
    fn test_anonymous_naming_skips_taken_names() {
        let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
        unit.define(Symbol::global(format!("{ANON_NAME_PREFIX}0"), vec![]))
            .unwrap();
        unit.define(Symbol::global("", vec![1])).unwrap();
        unit.assign_anonymous_names();
        assert!(unit.contains(&format!("{ANON_NAME_PREFIX}1")));
    }

    #[test]
    fn test_alias_references_include_target() {
        let mut alias = Symbol::alias("a", "f").with_refs(vec!["g".into()]);
        let refs: Vec<_> = alias.references().collect();
        assert_eq!(refs, vec!["g", "f"]);
        alias.retarget("f", "h");
        assert!(alias.references().any(|r| r == "h"));
    }

    #[test]
    fn test_strip_to_declaration() {
        let mut f = Symbol::function("f", FunctionBody::default());
        f.strip_to_declaration();
        assert!(!f.is_definition());
        assert_eq!(f.visibility, Visibility::Hidden);
        assert!(f.dso_local);
    }
}
