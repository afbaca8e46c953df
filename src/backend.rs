// This module is the seam between the sharding pipeline and the
// instruction-level code generator. The pipeline only needs the
// BackendCompiler trait: optimize one materialized unit and emit up to four
// output buffers for it. A reference implementation, ObjectBackend, is
// bundled so the pipeline is usable and testable end to end: it packages
// defined symbols into relocatable object files via the object crate and
// emits the unit's serialized form for the two intermediate-code kinds.

//! Backend seam and the bundled object-emitting backend.

use hashbrown::{HashMap, HashSet};
use thiserror::Error;

use crate::serialize::serialize_unit;
use crate::timing::ShardTimers;
use crate::unit::{
    Architecture, BinaryFormat, CompilationUnit, Linkage, SymbolKind, Visibility,
};

/// Which output kinds the caller wants for each shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputRequest {
    pub unopt: bool,
    pub opt: bool,
    pub obj: bool,
    pub asm: bool,
}

impl OutputRequest {
    pub fn all() -> Self {
        OutputRequest {
            unopt: true,
            opt: true,
            obj: true,
            asm: true,
        }
    }

    pub fn object_only() -> Self {
        OutputRequest {
            obj: true,
            ..OutputRequest::default()
        }
    }

    pub fn any(&self) -> bool {
        self.unopt || self.opt || self.obj || self.asm
    }
}

/// The four output kinds a backend can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    UnoptIr,
    OptIr,
    Object,
    Assembly,
}

impl OutputKind {
    pub const ALL: [OutputKind; 4] = [
        OutputKind::UnoptIr,
        OutputKind::OptIr,
        OutputKind::Object,
        OutputKind::Assembly,
    ];

    /// Infix used in archive member names for this kind.
    pub fn member_prefix(&self) -> &'static str {
        match self {
            OutputKind::UnoptIr => "_unopt",
            OutputKind::OptIr => "_opt",
            OutputKind::Object | OutputKind::Assembly => "",
        }
    }

    /// File extension used in archive member names for this kind.
    pub fn member_extension(&self) -> &'static str {
        match self {
            OutputKind::UnoptIr | OutputKind::OptIr => ".ir",
            OutputKind::Object => ".o",
            OutputKind::Assembly => ".s",
        }
    }

    pub fn requested(&self, request: OutputRequest) -> bool {
        match self {
            OutputKind::UnoptIr => request.unopt,
            OutputKind::OptIr => request.opt,
            OutputKind::Object => request.obj,
            OutputKind::Assembly => request.asm,
        }
    }
}

/// Output buffers for one shard. A `None` slot means the kind was either
/// not requested or not producible for the target (a reported, degraded
/// condition rather than an error).
#[derive(Debug, Default, Clone)]
pub struct ShardOutputs {
    pub unopt: Option<Vec<u8>>,
    pub opt: Option<Vec<u8>>,
    pub obj: Option<Vec<u8>>,
    pub asm: Option<Vec<u8>>,
}

impl ShardOutputs {
    pub fn get(&self, kind: OutputKind) -> Option<&[u8]> {
        match kind {
            OutputKind::UnoptIr => self.unopt.as_deref(),
            OutputKind::OptIr => self.opt.as_deref(),
            OutputKind::Object => self.obj.as_deref(),
            OutputKind::Assembly => self.asm.as_deref(),
        }
    }
}

/// Hard backend failures. Inability to produce one output kind is not an
/// error; backends report it and leave the slot empty.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("object emission failed: {reason}")]
    Emit { reason: String },

    #[error("unit cannot be emitted: {reason}")]
    InvalidUnit { reason: String },
}

/// Optimize and emit one shard's unit.
///
/// Implementations run in parallel, one per worker thread, each on its own
/// unit; they must not share mutable state. Timers let the backend break
/// its work into the standard phases for the per-shard timing report.
pub trait BackendCompiler: Sync {
    fn compile(
        &self,
        unit: &mut CompilationUnit,
        request: OutputRequest,
        timers: &mut ShardTimers,
    ) -> Result<ShardOutputs, BackendError>;
}

/// Reference backend: packages unit symbols into a relocatable object.
///
/// Function bodies land in `.text`, global initializers in `.data`;
/// declarations become undefined symbols and aliases become extra symbols
/// at their target's address. Assembly output is not supported and is
/// reported as a degraded kind.
#[derive(Debug, Default)]
pub struct ObjectBackend;

impl ObjectBackend {
    /// Drop declarations nothing references anymore. Stripping bodies
    /// leaves prototypes behind; dead ones only bloat the symbol table.
    fn strip_dead_declarations(unit: &mut CompilationUnit) -> usize {
        let used: HashSet<String> = unit
            .symbols()
            .flat_map(|s| s.references().map(str::to_string))
            .collect();
        let dead: Vec<String> = unit
            .symbols()
            .filter(|s| !s.is_definition() && !used.contains(&s.name))
            .map(|s| s.name.clone())
            .collect();
        for name in &dead {
            unit.remove(name);
        }
        dead.len()
    }

    fn emit_object(unit: &CompilationUnit) -> Result<Vec<u8>, BackendError> {
        let format = match unit.target.format {
            BinaryFormat::Elf => object::BinaryFormat::Elf,
            BinaryFormat::MachO => object::BinaryFormat::MachO,
            BinaryFormat::Coff => object::BinaryFormat::Coff,
        };
        let arch = match unit.target.arch {
            Architecture::X86_64 => object::Architecture::X86_64,
            Architecture::Aarch64 => object::Architecture::Aarch64,
        };
        let mut obj = object::write::Object::new(format, arch, object::Endianness::Little);
        let text = obj.section_id(object::write::StandardSection::Text);
        let data = obj.section_id(object::write::StandardSection::Data);

        // Per-shard identity record; linkers treat duplicate unit identities
        // as one, so this must stay unique across shards.
        if let Some(id) = &unit.debug_id {
            let comment =
                obj.add_section(Vec::new(), b".comment".to_vec(), object::SectionKind::Other);
            obj.append_section_data(comment, id.as_bytes(), 1);
        }

        let scope = |linkage: Linkage, visibility: Visibility| match (linkage, visibility) {
            (Linkage::Internal, _) => object::SymbolScope::Compilation,
            (_, Visibility::Hidden) => object::SymbolScope::Linkage,
            (_, Visibility::Default) => object::SymbolScope::Dynamic,
        };

        // Definitions first so aliases can resolve their target's address.
        let mut placed: HashMap<&str, (object::write::SectionId, u64, u64, object::SymbolKind)> =
            HashMap::new();
        for symbol in unit.symbols() {
            match &symbol.kind {
                SymbolKind::Function { body: Some(body) } => {
                    let offset = obj.append_section_data(text, &body.code, 16);
                    placed.insert(
                        &symbol.name,
                        (text, offset, body.code.len() as u64, object::SymbolKind::Text),
                    );
                }
                SymbolKind::Global { init: Some(init) } => {
                    let offset = obj.append_section_data(data, init, 8);
                    placed.insert(
                        &symbol.name,
                        (data, offset, init.len() as u64, object::SymbolKind::Data),
                    );
                }
                _ => {}
            }
        }

        for symbol in unit.symbols() {
            let (section, value, size, kind) = match &symbol.kind {
                SymbolKind::Function { body: None } | SymbolKind::Global { init: None } => {
                    obj.add_symbol(object::write::Symbol {
                        name: symbol.name.clone().into_bytes(),
                        value: 0,
                        size: 0,
                        kind: match symbol.kind {
                            SymbolKind::Function { .. } => object::SymbolKind::Text,
                            _ => object::SymbolKind::Data,
                        },
                        scope: scope(symbol.linkage, symbol.visibility),
                        weak: false,
                        section: object::write::SymbolSection::Undefined,
                        flags: object::SymbolFlags::None,
                    });
                    continue;
                }
                SymbolKind::Alias { target } => {
                    // Follow alias chains to a placed definition; the hop
                    // bound guards against a cyclic input.
                    let mut current = target.as_str();
                    let mut hops = 0usize;
                    loop {
                        if let Some(&entry) = placed.get(current) {
                            break entry;
                        }
                        hops += 1;
                        match unit.get(current).map(|s| &s.kind) {
                            Some(SymbolKind::Alias { target }) if hops <= unit.len() => {
                                current = target.as_str();
                            }
                            _ => {
                                return Err(BackendError::InvalidUnit {
                                    reason: format!(
                                        "alias `{}` targets undefined `{current}`",
                                        symbol.name
                                    ),
                                });
                            }
                        }
                    }
                }
                _ => {
                    let &(section, value, size, kind) = placed
                        .get(symbol.name.as_str())
                        .expect("placed in the first pass");
                    (section, value, size, kind)
                }
            };
            obj.add_symbol(object::write::Symbol {
                name: symbol.name.clone().into_bytes(),
                value,
                size,
                kind,
                scope: scope(symbol.linkage, symbol.visibility),
                weak: false,
                section: object::write::SymbolSection::Section(section),
                flags: object::SymbolFlags::None,
            });
        }

        obj.write().map_err(|e| BackendError::Emit {
            reason: e.to_string(),
        })
    }
}

impl BackendCompiler for ObjectBackend {
    fn compile(
        &self,
        unit: &mut CompilationUnit,
        request: OutputRequest,
        timers: &mut ShardTimers,
    ) -> Result<ShardOutputs, BackendError> {
        let mut out = ShardOutputs::default();
        if request.unopt {
            out.unopt = Some(timers.unopt.time(|| serialize_unit(unit)));
        }
        if !(request.opt || request.obj || request.asm) {
            return Ok(out);
        }

        let stripped = timers.optimize.time(|| Self::strip_dead_declarations(unit));
        if stripped > 0 {
            log::debug!("stripped {stripped} dead prototypes");
        }

        if request.opt {
            out.opt = Some(timers.opt.time(|| serialize_unit(unit)));
        }
        if request.obj {
            out.obj = Some(timers.obj.time(|| Self::emit_object(unit))?);
        }
        if request.asm {
            // Degraded, not fatal: continue with the other kinds.
            log::warn!("target does not support generation of assembly files");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{FunctionBody, Symbol, TargetSpec};
    use object::{Object, ObjectSymbol};

    fn sample_unit() -> CompilationUnit {
        let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
        unit.define(Symbol::function(
            "run",
            FunctionBody {
                code: vec![0xc3],
                instructions: 1,
                basic_blocks: 1,
            },
        ))
        .unwrap();
        unit.define(Symbol::global("table", vec![1, 2, 3, 4]))
            .unwrap();
        unit.define(Symbol::function_decl("extern_fn").with_refs(vec![]))
            .unwrap();
        unit.get_mut("run").unwrap().refs = vec!["extern_fn".into()];
        unit.define(Symbol::alias("run_alias", "run")).unwrap();
        unit
    }

    #[test]
    fn test_emitted_object_parses_back() {
        let unit = sample_unit();
        let bytes = ObjectBackend::emit_object(&unit).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert!(file.section_by_name(".text").is_some());
        let names: Vec<String> = file
            .symbols()
            .filter_map(|s| s.name().ok().map(str::to_string))
            .collect();
        for expected in ["run", "table", "extern_fn", "run_alias"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_alias_lands_on_target_address() {
        let unit = sample_unit();
        let bytes = ObjectBackend::emit_object(&unit).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let addr = |name: &str| file.symbol_by_name(name).unwrap().address();
        assert_eq!(addr("run"), addr("run_alias"));
    }

    #[test]
    fn test_alias_to_undefined_target_is_an_error() {
        let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
        unit.define(Symbol::function_decl("gone")).unwrap();
        unit.define(Symbol::alias("bad", "gone")).unwrap();
        let err = ObjectBackend::emit_object(&unit).unwrap_err();
        assert!(matches!(err, BackendError::InvalidUnit { .. }));
    }

    #[test]
    fn test_dead_prototypes_are_stripped() {
        let mut unit = sample_unit();
        unit.define(Symbol::function_decl("unused_proto")).unwrap();
        let stripped = ObjectBackend::strip_dead_declarations(&mut unit);
        assert_eq!(stripped, 1);
        assert!(!unit.contains("unused_proto"));
        assert!(unit.contains("extern_fn")); // still referenced by `run`
    }

    #[test]
    fn test_assembly_is_degraded_not_fatal() {
        let mut unit = sample_unit();
        let mut timers = ShardTimers::new(0);
        let out = ObjectBackend
            .compile(
                &mut unit,
                OutputRequest {
                    asm: true,
                    obj: true,
                    ..OutputRequest::default()
                },
                &mut timers,
            )
            .unwrap();
        assert!(out.asm.is_none());
        assert!(out.obj.is_some());
    }
}
