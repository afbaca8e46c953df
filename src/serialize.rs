// This module encodes an entire compilation unit into one immutable byte
// buffer and decodes it back lazily. The layout is a little-endian
// declaration region followed by a single body blob: parsing the
// declaration region touches none of the body bytes, and each body is
// addressed by (offset, length) into the blob, so any number of workers
// can decode the same buffer concurrently with no shared mutable state and
// fetch only the bodies their shard preserves.

//! One-shot unit serialization and lazy decode.

use crate::error::{ImageError, ImageResult};
use crate::unit::{
    Architecture, BinaryFormat, CompilationUnit, FunctionBody, Linkage, Symbol, SymbolKind,
    TargetSpec, Visibility,
};

const MAGIC: [u8; 4] = *b"AOTS";
const FORMAT_VERSION: u32 = 1;

const TAG_FUNCTION: u8 = 0;
const TAG_GLOBAL: u8 = 1;
const TAG_ALIAS: u8 = 2;

const FLAG_DEFINITION: u8 = 1 << 0;
const FLAG_NO_PARTITION: u8 = 1 << 1;
const FLAG_DSO_LOCAL: u8 = 1 << 2;
const FLAG_CLONE_MASK: u8 = 1 << 3;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }
}

/// Encode the complete unit, symbol table included.
pub fn serialize_unit(unit: &CompilationUnit) -> Vec<u8> {
    let mut w = Writer { buf: Vec::new() };
    let mut blob: Vec<u8> = Vec::new();

    w.buf.extend_from_slice(&MAGIC);
    w.u32(FORMAT_VERSION);
    w.u8(match unit.target.format {
        BinaryFormat::Elf => 0,
        BinaryFormat::MachO => 1,
        BinaryFormat::Coff => 2,
    });
    w.u8(match unit.target.arch {
        Architecture::X86_64 => 0,
        Architecture::Aarch64 => 1,
    });
    w.u8(unit.target.pointer_width);
    w.u8(0);
    w.u32(unit.len() as u32);

    for symbol in unit.symbols() {
        w.str(&symbol.name);
        let mut flags = 0u8;
        if symbol.is_definition() {
            flags |= FLAG_DEFINITION;
        }
        if symbol.no_partition {
            flags |= FLAG_NO_PARTITION;
        }
        if symbol.dso_local {
            flags |= FLAG_DSO_LOCAL;
        }
        if symbol.clone_mask.is_some() {
            flags |= FLAG_CLONE_MASK;
        }
        let tag = match &symbol.kind {
            SymbolKind::Function { .. } => TAG_FUNCTION,
            SymbolKind::Global { .. } => TAG_GLOBAL,
            SymbolKind::Alias { .. } => TAG_ALIAS,
        };
        w.u8(tag);
        w.u8(flags);
        w.u8(match symbol.linkage {
            Linkage::External => 0,
            Linkage::Internal => 1,
        });
        w.u8(match symbol.visibility {
            Visibility::Default => 0,
            Visibility::Hidden => 1,
        });
        if let Some(mask) = &symbol.clone_mask {
            w.str(mask);
        }
        w.u32(symbol.refs.len() as u32);
        for r in &symbol.refs {
            w.str(r);
        }
        match &symbol.kind {
            SymbolKind::Function { body } => {
                if let Some(body) = body {
                    w.u32(body.instructions);
                    w.u32(body.basic_blocks);
                    w.u64(blob.len() as u64);
                    w.u64(body.code.len() as u64);
                    blob.extend_from_slice(&body.code);
                }
            }
            SymbolKind::Global { init } => {
                if let Some(init) = init {
                    w.u64(blob.len() as u64);
                    w.u64(init.len() as u64);
                    blob.extend_from_slice(init);
                }
            }
            SymbolKind::Alias { target } => {
                w.str(target);
            }
        }
    }

    w.buf.extend_from_slice(&blob);
    w.buf
}

struct Reader<'buf> {
    buf: &'buf [u8],
    pos: usize,
}

impl<'buf> Reader<'buf> {
    fn corrupt(reason: impl Into<String>) -> ImageError {
        ImageError::Decode {
            reason: reason.into(),
        }
    }

    fn bytes(&mut self, n: usize) -> ImageResult<&'buf [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Self::corrupt("record extends past end of buffer"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> ImageResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> ImageResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> ImageResult<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn str(&mut self) -> ImageResult<&'buf str> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| Self::corrupt("name is not valid UTF-8"))
    }
}

#[derive(Debug)]
enum LazyKind<'buf> {
    Function { instructions: u32, basic_blocks: u32 },
    Global,
    Alias { target: &'buf str },
}

/// One decoded declaration; the body stays in the buffer until fetched.
#[derive(Debug)]
pub struct LazyDecl<'buf> {
    name: &'buf str,
    kind: LazyKind<'buf>,
    definition: bool,
    linkage: Linkage,
    visibility: Visibility,
    dso_local: bool,
    no_partition: bool,
    clone_mask: Option<&'buf str>,
    refs: Vec<&'buf str>,
    /// (offset, length) into the body blob for definitions with payloads.
    body: Option<(u64, u64)>,
}

impl<'buf> LazyDecl<'buf> {
    pub fn name(&self) -> &'buf str {
        self.name
    }

    pub fn is_definition(&self) -> bool {
        self.definition
    }

    pub fn is_local(&self) -> bool {
        self.linkage == Linkage::Internal
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.kind, LazyKind::Alias { .. })
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, LazyKind::Function { .. })
    }

    pub fn alias_target(&self) -> Option<&'buf str> {
        match self.kind {
            LazyKind::Alias { target } => Some(target),
            _ => None,
        }
    }

    fn common(&self, kind: SymbolKind) -> Symbol {
        Symbol {
            name: self.name.to_string(),
            kind,
            linkage: self.linkage,
            visibility: self.visibility,
            dso_local: self.dso_local,
            no_partition: self.no_partition,
            clone_mask: self.clone_mask.map(str::to_string),
            refs: self.refs.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// Lazily decoded unit over a shared immutable buffer.
///
/// Declarations are fully parsed up front; bodies are copied out only when
/// a shard actually preserves the symbol. The decoder holds no mutable
/// state, so one buffer serves any number of concurrent readers.
#[derive(Debug)]
pub struct LazyUnit<'buf> {
    target: TargetSpec,
    decls: Vec<LazyDecl<'buf>>,
    blob: &'buf [u8],
}

impl<'buf> LazyUnit<'buf> {
    pub fn parse(buf: &'buf [u8]) -> ImageResult<LazyUnit<'buf>> {
        let mut r = Reader { buf, pos: 0 };
        if r.bytes(4)? != MAGIC {
            return Err(Reader::corrupt("bad magic"));
        }
        let version = r.u32()?;
        if version != FORMAT_VERSION {
            return Err(Reader::corrupt(format!(
                "unsupported format version {version}"
            )));
        }
        let format = match r.u8()? {
            0 => BinaryFormat::Elf,
            1 => BinaryFormat::MachO,
            2 => BinaryFormat::Coff,
            other => return Err(Reader::corrupt(format!("unknown object format {other}"))),
        };
        let arch = match r.u8()? {
            0 => Architecture::X86_64,
            1 => Architecture::Aarch64,
            other => return Err(Reader::corrupt(format!("unknown architecture {other}"))),
        };
        let pointer_width = r.u8()?;
        r.u8()?;
        let count = r.u32()? as usize;

        let mut decls = Vec::with_capacity(count);
        for _ in 0..count {
            let name = r.str()?;
            let tag = r.u8()?;
            let flags = r.u8()?;
            let linkage = match r.u8()? {
                0 => Linkage::External,
                1 => Linkage::Internal,
                other => return Err(Reader::corrupt(format!("unknown linkage {other}"))),
            };
            let visibility = match r.u8()? {
                0 => Visibility::Default,
                1 => Visibility::Hidden,
                other => return Err(Reader::corrupt(format!("unknown visibility {other}"))),
            };
            let clone_mask = if flags & FLAG_CLONE_MASK != 0 {
                Some(r.str()?)
            } else {
                None
            };
            let nrefs = r.u32()? as usize;
            let mut refs = Vec::with_capacity(nrefs);
            for _ in 0..nrefs {
                refs.push(r.str()?);
            }
            let definition = flags & FLAG_DEFINITION != 0;
            let (kind, body) = match tag {
                TAG_FUNCTION => {
                    if definition {
                        let instructions = r.u32()?;
                        let basic_blocks = r.u32()?;
                        let off = r.u64()?;
                        let len = r.u64()?;
                        (
                            LazyKind::Function {
                                instructions,
                                basic_blocks,
                            },
                            Some((off, len)),
                        )
                    } else {
                        (
                            LazyKind::Function {
                                instructions: 0,
                                basic_blocks: 0,
                            },
                            None,
                        )
                    }
                }
                TAG_GLOBAL => {
                    if definition {
                        let off = r.u64()?;
                        let len = r.u64()?;
                        (LazyKind::Global, Some((off, len)))
                    } else {
                        (LazyKind::Global, None)
                    }
                }
                TAG_ALIAS => (LazyKind::Alias { target: r.str()? }, None),
                other => return Err(Reader::corrupt(format!("unknown symbol tag {other}"))),
            };
            decls.push(LazyDecl {
                name,
                kind,
                definition,
                linkage,
                visibility,
                dso_local: flags & FLAG_DSO_LOCAL != 0,
                no_partition: flags & FLAG_NO_PARTITION != 0,
                clone_mask,
                refs,
                body,
            });
        }
        Ok(LazyUnit {
            target: TargetSpec {
                format,
                arch,
                pointer_width,
            },
            decls,
            blob: &buf[r.pos..],
        })
    }

    pub fn target(&self) -> &TargetSpec {
        &self.target
    }

    pub fn decls(&self) -> &[LazyDecl<'buf>] {
        &self.decls
    }

    pub fn decl(&self, name: &str) -> Option<&LazyDecl<'buf>> {
        // Linear scan; only the alias edge cases look symbols up by name.
        self.decls.iter().find(|d| d.name == name)
    }

    fn body_bytes(&self, decl: &LazyDecl<'buf>) -> ImageResult<&'buf [u8]> {
        let (off, len) = decl
            .body
            .ok_or_else(|| Reader::corrupt(format!("`{}` has no body", decl.name)))?;
        let start = off as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= self.blob.len())
            .ok_or_else(|| Reader::corrupt(format!("body of `{}` is out of range", decl.name)))?;
        Ok(&self.blob[start..end])
    }

    /// Reconstruct the declaration-only form of a symbol.
    pub fn to_declaration(&self, decl: &LazyDecl<'buf>) -> Symbol {
        let kind = match decl.kind {
            LazyKind::Function { .. } => SymbolKind::Function { body: None },
            LazyKind::Global => SymbolKind::Global { init: None },
            LazyKind::Alias { target } => SymbolKind::Alias {
                target: target.to_string(),
            },
        };
        decl.common(kind)
    }

    /// Materialize a symbol in full, fetching its body from the blob.
    pub fn to_definition(&self, decl: &LazyDecl<'buf>) -> ImageResult<Symbol> {
        let kind = match decl.kind {
            LazyKind::Function {
                instructions,
                basic_blocks,
            } => SymbolKind::Function {
                body: Some(FunctionBody {
                    code: self.body_bytes(decl)?.to_vec(),
                    instructions,
                    basic_blocks,
                }),
            },
            LazyKind::Global => SymbolKind::Global {
                init: Some(self.body_bytes(decl)?.to_vec()),
            },
            LazyKind::Alias { target } => SymbolKind::Alias {
                target: target.to_string(),
            },
        };
        Ok(decl.common(kind))
    }
}
