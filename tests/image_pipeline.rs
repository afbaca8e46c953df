//! End-to-end pipeline tests: build a synthetic compilation unit, emit it
//! across several shards with the reference backend, and parse the emitted
//! objects and archives back to check linkage-level properties.

use aotshard::{
    emit_image, member_name, write_image_archives, ArchivePaths, CompilationUnit, FunctionBody,
    Linkage, ObjectBackend, OutputKind, OutputRequest, PipelineConfig, Symbol, TargetSpec,
    FUNCTION_INDEX_SYMBOL, GLOBAL_INDEX_SYMBOL,
};
use object::{Object, ObjectSection, ObjectSymbol};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn job(name: &str, instructions: u32, code: Vec<u8>) -> Symbol {
    Symbol::function(
        name,
        FunctionBody {
            code,
            instructions,
            basic_blocks: 3,
        },
    )
}

/// A unit heavy enough to clear the parallelization floor, with reference
/// chains, an alias, an internal helper, a forced-inline symbol, and an
/// unnamed definition.
fn sample_unit() -> CompilationUnit {
    let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
    let mut fvar_entries: Vec<String> = Vec::new();
    for i in 0..10 {
        let name = format!("job{i}");
        let mut symbol = job(&name, 100, vec![i as u8; 16]);
        if i == 0 {
            symbol.refs.push("job1".into());
        }
        if i == 2 {
            symbol.refs.push("lookup_table".into());
        }
        if i == 5 {
            symbol.refs.push("tiny_inline".into());
        }
        unit.define(symbol).unwrap();
        fvar_entries.push(name);
    }
    unit.define(Symbol::global("lookup_table", vec![0xee; 32]))
        .unwrap();
    unit.define(Symbol::alias("job0_alias", "job0")).unwrap();
    unit.define(job("dispatch", 20, vec![0xd0; 8]).with_refs(vec!["job0_alias".into()]))
        .unwrap();
    fvar_entries.push("dispatch".into());

    let mut scratch = job("scratch_helper", 8, vec![0x55; 4]);
    scratch.linkage = Linkage::Internal;
    unit.define(scratch).unwrap();

    let mut inline = job("tiny_inline", 4, vec![0x44; 2]);
    inline.no_partition = true;
    unit.define(inline).unwrap();

    // Unnamed definition; the pipeline assigns it a synthetic name.
    unit.define(Symbol::global("", vec![0x11; 8])).unwrap();

    unit.define(Symbol::global(FUNCTION_INDEX_SYMBOL, vec![]).with_refs(fvar_entries))
        .unwrap();
    unit.define(
        Symbol::global(GLOBAL_INDEX_SYMBOL, vec![]).with_refs(vec!["lookup_table".into()]),
    )
    .unwrap();
    unit
}

fn config(shards: &str) -> PipelineConfig {
    PipelineConfig {
        shard_override: Some(shards.into()),
        hardware_threads: Some(8),
        ..PipelineConfig::default()
    }
}

fn parsed_shards(image: &aotshard::EmittedImage) -> Vec<object::File<'_>> {
    image
        .shards
        .iter()
        .map(|s| object::File::parse(s.obj.as_deref().unwrap()).unwrap())
        .collect()
}

fn defined_in(file: &object::File<'_>, name: &str) -> bool {
    file.symbol_by_name(name)
        .map(|s| !s.is_undefined())
        .unwrap_or(false)
}

#[test]
fn multi_shard_image_end_to_end() {
    init_logs();
    let image = emit_image(
        sample_unit(),
        &ObjectBackend,
        OutputRequest::all(),
        &config("3"),
        None,
    )
    .unwrap();
    assert_eq!(image.shard_count, 3);
    assert_eq!(image.shards.len(), 3);

    let files = parsed_shards(&image);
    // Every indexed function is defined in exactly one shard.
    for i in 0..10 {
        let name = format!("job{i}");
        let count = files.iter().filter(|f| defined_in(f, &name)).count();
        assert_eq!(count, 1, "`{name}` defined in {count} shards");
    }
    // Internal helpers keep a private copy in every shard.
    for file in &files {
        assert!(defined_in(file, "scratch_helper"));
    }
    // Each shard carries its own suffixed index tables.
    for (i, file) in files.iter().enumerate() {
        assert!(defined_in(file, &format!("image_fvar_offsets_{i}")));
        assert!(defined_in(file, &format!("image_gvar_idxs_{i}")));
    }
    // Assembly is a degraded kind for this backend, never an error.
    for outputs in &image.shards {
        assert!(outputs.asm.is_none());
        assert!(outputs.unopt.is_some());
        assert!(outputs.opt.is_some());
    }
    // Every shard carries a distinct identity record.
    let mut identities = Vec::new();
    for file in &files {
        let section = file.section_by_name(".comment").unwrap();
        identities.push(section.data().unwrap().to_vec());
    }
    identities.sort();
    identities.dedup();
    assert_eq!(identities.len(), files.len());
    // The metadata object exposes the loader entry points.
    let metadata = object::File::parse(image.metadata.obj.as_deref().unwrap()).unwrap();
    assert!(defined_in(&metadata, "image_pointers"));
    assert!(defined_in(&metadata, "image_shard_tables"));
    assert!(defined_in(&metadata, "image_tls_table"));
}

#[test]
fn alias_resolves_in_owner_and_declares_elsewhere() {
    init_logs();
    let image = emit_image(
        sample_unit(),
        &ObjectBackend,
        OutputRequest::object_only(),
        &config("3"),
        None,
    )
    .unwrap();
    let files = parsed_shards(&image);
    let mut owners = 0;
    for file in &files {
        if defined_in(file, "job0_alias") {
            owners += 1;
            // The alias and its target are co-located and share an address.
            let alias = file.symbol_by_name("job0_alias").unwrap().address();
            let target = file.symbol_by_name("job0").unwrap().address();
            assert_eq!(alias, target);
        } else if let Some(symbol) = file.symbol_by_name("job0_alias") {
            assert!(symbol.is_undefined());
        }
    }
    assert_eq!(owners, 1);
}

#[test]
fn single_shard_bypass_produces_equivalent_linkage() {
    init_logs();
    let image = emit_image(
        sample_unit(),
        &ObjectBackend,
        OutputRequest::object_only(),
        &config("1"),
        None,
    )
    .unwrap();
    assert_eq!(image.shard_count, 1);
    let files = parsed_shards(&image);
    let file = &files[0];
    // Everything resolves locally: one shard defines all indexed symbols
    // and the shard-0 tables the metadata references.
    for i in 0..10 {
        assert!(defined_in(file, &format!("job{i}")));
    }
    assert!(defined_in(file, "job0_alias"));
    assert!(defined_in(file, "image_fvar_offsets_0"));
    assert!(defined_in(file, "image_fvar_idxs_0"));
}

#[test]
fn forced_single_shard_ignores_override_below_weight_floor() {
    init_logs();
    let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
    unit.define(job("only", 10, vec![0x90])).unwrap();
    unit.define(Symbol::global(FUNCTION_INDEX_SYMBOL, vec![]).with_refs(vec!["only".into()]))
        .unwrap();
    unit.define(Symbol::global(GLOBAL_INDEX_SYMBOL, vec![]))
        .unwrap();
    let image = emit_image(
        unit,
        &ObjectBackend,
        OutputRequest::object_only(),
        &config("4"),
        None,
    )
    .unwrap();
    assert_eq!(image.shard_count, 1);
}

#[test]
fn emission_is_deterministic_across_runs() {
    init_logs();
    let run = || {
        emit_image(
            sample_unit(),
            &ObjectBackend,
            OutputRequest::all(),
            &config("3"),
            None,
        )
        .unwrap()
    };
    let a = run();
    let b = run();
    for (sa, sb) in a.shards.iter().zip(&b.shards) {
        assert_eq!(sa.obj, sb.obj);
        assert_eq!(sa.unopt, sb.unopt);
        assert_eq!(sa.opt, sb.opt);
    }
    assert_eq!(a.metadata.obj, b.metadata.obj);
}

#[test]
fn archives_bundle_shards_metadata_and_preamble() {
    init_logs();
    let blob = vec![0xfe; 128];
    let image = emit_image(
        sample_unit(),
        &ObjectBackend,
        OutputRequest::all(),
        &config("2"),
        Some(&blob),
    )
    .unwrap();
    assert!(image.preamble.is_some());

    let dir = std::env::temp_dir().join(format!("aotshard-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let paths = ArchivePaths {
        obj: Some(dir.join("image.a")),
        opt: Some(dir.join("image-opt.a")),
        ..ArchivePaths::default()
    };
    let written = write_image_archives(&image, &TargetSpec::elf_x86_64(), &paths);
    assert_eq!(written, 2);

    let data = std::fs::read(dir.join("image.a")).unwrap();
    let archive = object::read::archive::ArchiveFile::parse(&*data).unwrap();
    let names: Vec<String> = archive
        .members()
        .map(|m| String::from_utf8(m.unwrap().name().to_vec()).unwrap())
        .collect();
    assert_eq!(
        names,
        vec![
            member_name(OutputKind::Object, "text", Some(0)),
            member_name(OutputKind::Object, "text", Some(1)),
            member_name(OutputKind::Object, "metadata", None),
            member_name(OutputKind::Object, "preamble", None),
        ]
    );
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn missing_index_table_is_fatal() {
    init_logs();
    let mut unit = CompilationUnit::new(TargetSpec::elf_x86_64());
    unit.define(job("f", 10, vec![0x90])).unwrap();
    let err = emit_image(
        unit,
        &ObjectBackend,
        OutputRequest::object_only(),
        &PipelineConfig::default(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, aotshard::ImageError::MissingIndexTable { .. }));
}
