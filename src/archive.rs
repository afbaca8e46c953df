// This module bundles the per-shard output buffers into archives, one per
// requested output kind. Member names embed the shard index so a stable
// ordering survives the container; the metadata and optional preamble
// members ride along in the same archive. Mach-O targets get the BSD
// archive flavor, everything else GNU. Write failures are reported and
// skipped; by this point the compile work is done and one failed archive
// should not take down the rest.

//! Archive emission.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::backend::OutputKind;
use crate::pipeline::EmittedImage;
use crate::unit::{BinaryFormat, TargetSpec};

/// Destination path per output kind; `None` kinds are not written.
#[derive(Debug, Clone, Default)]
pub struct ArchivePaths {
    pub unopt: Option<PathBuf>,
    pub opt: Option<PathBuf>,
    pub obj: Option<PathBuf>,
    pub asm: Option<PathBuf>,
}

impl ArchivePaths {
    fn path_for(&self, kind: OutputKind) -> Option<&Path> {
        match kind {
            OutputKind::UnoptIr => self.unopt.as_deref(),
            OutputKind::OptIr => self.opt.as_deref(),
            OutputKind::Object => self.obj.as_deref(),
            OutputKind::Assembly => self.asm.as_deref(),
        }
    }
}

/// Stable member name for one buffer of the image.
pub fn member_name(kind: OutputKind, base: &str, shard: Option<usize>) -> String {
    match shard {
        Some(i) => format!(
            "{base}{}#{i}{}",
            kind.member_prefix(),
            kind.member_extension()
        ),
        None => format!("{base}{}{}", kind.member_prefix(), kind.member_extension()),
    }
}

fn collect_members<'a>(image: &'a EmittedImage, kind: OutputKind) -> Vec<(String, &'a [u8])> {
    let mut members = Vec::new();
    for (shard, outputs) in image.shards.iter().enumerate() {
        match outputs.get(kind) {
            Some(bytes) => members.push((member_name(kind, "text", Some(shard)), bytes)),
            None => log::warn!("shard {shard} produced no {kind:?} output, skipping member"),
        }
    }
    if let Some(bytes) = image.metadata.get(kind) {
        members.push((member_name(kind, "metadata", None), bytes));
    }
    if let Some(outputs) = &image.preamble {
        if let Some(bytes) = outputs.get(kind) {
            members.push((member_name(kind, "preamble", None), bytes));
        }
    }
    members
}

fn write_archive(
    path: &Path,
    format: BinaryFormat,
    members: &[(String, &[u8])],
) -> io::Result<()> {
    let file = File::create(path)?;
    // Mach-O linkers expect the BSD flavor; GNU everywhere else.
    match format {
        BinaryFormat::MachO => {
            let mut builder = ar::Builder::new(file);
            for (name, bytes) in members {
                let header = ar::Header::new(name.clone().into_bytes(), bytes.len() as u64);
                builder.append(&header, *bytes)?;
            }
            builder.into_inner()?;
        }
        _ => {
            let identifiers = members
                .iter()
                .map(|(name, _)| name.clone().into_bytes())
                .collect();
            let mut builder = ar::GnuBuilder::new(file, identifiers);
            for (name, bytes) in members {
                let header = ar::Header::new(name.clone().into_bytes(), bytes.len() as u64);
                builder.append(&header, *bytes)?;
            }
            builder.into_inner()?;
        }
    }
    Ok(())
}

/// Write one archive per requested kind. Returns how many archives were
/// actually written; failures and empty kinds are logged and skipped.
pub fn write_image_archives(
    image: &EmittedImage,
    target: &TargetSpec,
    paths: &ArchivePaths,
) -> usize {
    let mut written = 0;
    for kind in OutputKind::ALL {
        let Some(path) = paths.path_for(kind) else {
            continue;
        };
        let members = collect_members(image, kind);
        if members.is_empty() {
            log::warn!("no {kind:?} buffers to archive, skipping {}", path.display());
            continue;
        }
        match write_archive(path, target.format, &members) {
            Ok(()) => written += 1,
            Err(e) => log::error!("failed to emit output file {}: {e}", path.display()),
        }
    }
    written
}
