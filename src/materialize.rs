// This module rebuilds, per shard, only the slice of the serialized unit
// that shard compiles. Symbols preserved by the partition (and every
// internal symbol) materialize in full; all other definitions lose their
// bodies and become hidden external declarations resolved at link time
// against the shard that owns them. Aliases cannot legally point at a bare
// declaration, so a doomed alias is first redirected to a freshly created
// placeholder definition of the right shape; once the unit is fully
// materialized and reference edges are complete, the alias's users are
// repointed at the placeholder, the alias is deleted, the placeholder
// takes over its name, and its body is stripped back to a declaration.

//! Per-shard materialization of preserved symbols.

use crate::error::{ImageError, ImageResult};
use crate::partition::Partition;
use crate::serialize::{LazyDecl, LazyUnit};
use crate::unit::{
    CompilationUnit, FunctionBody, Linkage, Symbol, SymbolKind, Visibility,
};

/// Shape of the placeholder a doomed alias is redirected to.
enum PlaceholderShape {
    Function,
    Global,
}

/// Follow an alias's target chain to its final non-alias symbol. A chain
/// that leaves the unit or loops back on itself is an internal error in
/// the input, not something to paper over.
fn resolve_alias_shape(lazy: &LazyUnit<'_>, alias: &LazyDecl<'_>) -> ImageResult<PlaceholderShape> {
    let mut current = alias.alias_target().expect("caller checked kind");
    let mut hops = 0usize;
    loop {
        let decl = lazy.decl(current).ok_or_else(|| ImageError::Alias {
            alias: alias.name().to_string(),
            reason: format!("targets unknown symbol `{current}`"),
        })?;
        match decl.alias_target() {
            None if decl.is_definition() => {
                return Ok(if decl.is_function() {
                    PlaceholderShape::Function
                } else {
                    PlaceholderShape::Global
                })
            }
            None => {
                return Err(ImageError::Alias {
                    alias: alias.name().to_string(),
                    reason: format!("resolves to declaration `{current}`"),
                })
            }
            Some(next) => {
                hops += 1;
                if hops > lazy.decls().len() {
                    return Err(ImageError::Alias {
                        alias: alias.name().to_string(),
                        reason: "alias chain forms a cycle".into(),
                    });
                }
                current = next;
            }
        }
    }
}

/// Rebuild the shard's unit from the shared buffer.
///
/// Bodies are fetched on demand: a stripped symbol's payload is never
/// copied out of the buffer. The shard is stamped with a unique suffix so
/// whole-unit metadata (debug-info identity in particular) stays distinct
/// when the shards meet again in the linker.
pub fn materialize_preserved(
    lazy: &LazyUnit<'_>,
    partition: &Partition,
    shard: usize,
) -> ImageResult<CompilationUnit> {
    let mut unit = CompilationUnit::new(lazy.target().clone());
    unit.suffix = Some(format!("_{shard}"));
    unit.debug_id = Some(format!("image#{shard}"));

    // Phase one: resolve every declaration, deciding each symbol's fate.
    // Doomed aliases get a placeholder definition now, while the alias
    // itself still points at something with a body.
    let mut swaps: Vec<(String, String)> = Vec::new();
    for decl in lazy.decls() {
        if !decl.is_definition() {
            unit.define(lazy.to_declaration(decl))?;
            continue;
        }
        if decl.is_local() || partition.symbols.contains(decl.name()) {
            unit.define(lazy.to_definition(decl)?)?;
            continue;
        }
        if !decl.is_alias() {
            let mut stripped = lazy.to_declaration(decl);
            stripped.strip_to_declaration();
            unit.define(stripped)?;
            continue;
        }
        let stub_name = format!("image_alias_stub_{}", swaps.len());
        let placeholder = match resolve_alias_shape(lazy, decl)? {
            // The placeholder body is never emitted; it exists so the alias
            // does not point at an extern declaration mid-flight.
            PlaceholderShape::Function => Symbol::function(
                &stub_name,
                FunctionBody {
                    code: Vec::new(),
                    instructions: 1,
                    basic_blocks: 1,
                },
            ),
            PlaceholderShape::Global => Symbol::global(&stub_name, Vec::new()),
        };
        unit.define(placeholder)?;
        let mut alias = lazy.to_definition(decl)?;
        alias.retarget(decl.alias_target().expect("checked above"), &stub_name);
        unit.define(alias)?;
        swaps.push((decl.name().to_string(), stub_name));
    }

    // Phase two: the unit is fully materialized, so reference edges are
    // complete and the swap can commit.
    for (alias_name, stub_name) in swaps {
        for symbol in unit.symbols_mut() {
            symbol.retarget(&alias_name, &stub_name);
        }
        unit.remove(&alias_name)
            .ok_or_else(|| ImageError::UnknownSymbol {
                name: alias_name.clone(),
            })?;
        unit.rename(&stub_name, &alias_name)?;
        for symbol in unit.symbols_mut() {
            symbol.retarget(&stub_name, &alias_name);
        }
        let placeholder = unit
            .get_mut(&alias_name)
            .ok_or_else(|| ImageError::UnknownSymbol {
                name: alias_name.clone(),
            })?;
        placeholder.strip_to_declaration();
    }

    debug_assert!(aliases_are_legal(&unit), "alias points at a declaration");
    Ok(unit)
}

/// Carried-over legality invariant: every remaining alias targets a
/// materialized definition in this unit.
pub(crate) fn aliases_are_legal(unit: &CompilationUnit) -> bool {
    unit.symbols().all(|s| match &s.kind {
        SymbolKind::Alias { target } => unit.get(target).is_some_and(Symbol::is_definition),
        _ => true,
    })
}

/// Convenience for tests and the round-trip property: names of all
/// definitions the unit still carries, exported or internal.
pub fn defined_symbols(unit: &CompilationUnit) -> Vec<String> {
    unit.symbols()
        .filter(|s| s.is_definition())
        .map(|s| s.name.clone())
        .collect()
}

// Keep the stripped-symbol attributes consistent with what the linker
// expects for cross-shard resolution.
#[allow(dead_code)]
fn stripped_attributes_hold(symbol: &Symbol) -> bool {
    symbol.linkage == Linkage::External
        && symbol.visibility == Visibility::Hidden
        && symbol.dso_local
}
