// This module coordinates the whole emission: decide the shard count from
// unit statistics and configuration, run the single-worker bypass or the
// extract/partition/serialize/fan-out flow, and collect the per-shard,
// metadata, and preamble outputs into one EmittedImage. Workers share
// exactly one immutable serialized buffer and each writes its own
// pre-sized output slot; the only synchronization is the join at the end
// of the thread scope. Any worker failure is fatal to the pipeline, since
// a partial shard set cannot be linked into a consistent image.

//! Pipeline coordination and the thread-count heuristics.

use std::num::NonZeroUsize;

use crate::backend::{BackendCompiler, OutputRequest, ShardOutputs};
use crate::error::{ImageError, ImageResult};
use crate::extract::extract_index_tables;
use crate::mangle::sanitize_names;
use crate::materialize::materialize_preserved;
use crate::metadata::{build_metadata_unit, build_preamble_unit};
use crate::partition::{compute_unit_info, partition_unit, Partition, UnitInfo};
use crate::serialize::{serialize_unit, LazyUnit};
use crate::timing::{PhaseTimer, PhaseTracker, ShardTimers, WorkerPhase};
use crate::unit::{CompilationUnit, FUNCTION_INDEX_SYMBOL, GLOBAL_INDEX_SYMBOL};
use crate::vartable::{construct_full_tables, construct_var_tables};

/// Units lighter than this compile fastest on a single worker; the
/// fan-out bookkeeping would cost more than it saves.
const MIN_PARALLEL_WEIGHT: u64 = 1000;
/// Never partition below this many symbols per shard.
const MIN_SYMBOLS_PER_SHARD: usize = 100;

/// Externally supplied knobs. String-valued overrides arrive unparsed;
/// malformed values are warned about and ignored, never fatal.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Explicit shard-count override.
    pub shard_override: Option<String>,
    /// Secondary cap applied when no explicit override is set.
    pub fallback_limit: Option<String>,
    /// Emit per-shard phase timings through the `log` facade.
    pub report_timings: bool,
    /// Hardware parallelism; queried from the OS when absent.
    pub hardware_threads: Option<usize>,
}

/// Decide how many shards to emit. Pure given a fixed
/// `config.hardware_threads`, so every rule here is unit-testable.
pub fn compute_thread_count(info: &UnitInfo, config: &PipelineConfig) -> usize {
    // Object formats with an external-symbol ceiling cannot absorb the
    // extra cross-shard symbols a large partitioned image produces.
    if let Some(limit) = info.symbol_limit {
        if info.symbols > limit {
            log::debug!("symbol ceiling restricts this image to a single shard");
            return 1;
        }
    }
    // Not overridable: tiny units do appear and exit early on one worker.
    if info.weight < MIN_PARALLEL_WEIGHT {
        log::debug!("small unit, using a single shard");
        return 1;
    }

    let hardware = config.hardware_threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    });
    let mut shards = (hardware / 2).max(1);

    let cap = info.symbols / MIN_SYMBOLS_PER_SHARD;
    if cap < shards {
        log::debug!(
            "low symbol count limiting shards to {cap} ({} symbols)",
            info.symbols
        );
        shards = cap;
    }

    let mut overridden = false;
    if let Some(raw) = &config.shard_override {
        match raw.parse::<usize>() {
            Ok(n) if n > 0 => {
                log::debug!("overriding shard count to {n}");
                shards = n;
                overridden = true;
            }
            _ => log::warn!("invalid value '{raw}' for shard-count override"),
        }
    }
    if !overridden && shards > 1 {
        if let Some(raw) = &config.fallback_limit {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => {
                    if n < shards {
                        log::debug!("fallback limit lowering shard count to {n}");
                        shards = n;
                    }
                }
                _ => log::warn!("invalid value '{raw}' for fallback shard limit"),
            }
        }
    }

    shards.max(1)
}

/// Everything the archive writer needs for one emitted image.
#[derive(Debug)]
pub struct EmittedImage {
    pub shard_count: usize,
    pub shards: Vec<ShardOutputs>,
    pub metadata: ShardOutputs,
    pub preamble: Option<ShardOutputs>,
}

/// Compile one unit as `shards` independent shards.
///
/// With one shard this is a pure bypass: no partitioning, no
/// serialization, one synchronous backend call. With more, the unit is
/// partitioned and serialized once, the original is released to bound
/// peak memory, and exactly `shards` workers materialize and compile
/// their slice concurrently.
pub fn emit_unit<B: BackendCompiler>(
    mut unit: CompilationUnit,
    shards: usize,
    backend: &B,
    request: OutputRequest,
    report_timings: bool,
) -> ImageResult<Vec<ShardOutputs>> {
    debug_assert!(shards >= 1);
    if shards == 1 {
        if unit.suffix.is_none() {
            unit.suffix = Some("_0".into());
            unit.debug_id = Some("image#0".into());
        }
        if unit.contains(FUNCTION_INDEX_SYMBOL) || unit.contains(GLOBAL_INDEX_SYMBOL) {
            let (fvars, gvars) = extract_index_tables(&mut unit)?;
            construct_full_tables(&mut unit, &fvars, &gvars)?;
        }
        let mut timers = ShardTimers::new(0);
        let out = backend.compile(&mut unit, request, &mut timers)?;
        if report_timings {
            timers.report();
        }
        return Ok(vec![out]);
    }

    // Partitioning is name-keyed, so unnamed definitions get reserved
    // synthetic names first.
    unit.assign_anonymous_names();

    let mut partition_timer = PhaseTimer::default();
    let mut serialize_timer = PhaseTimer::default();

    let (fvars, gvars) = extract_index_tables(&mut unit)?;
    let partitions =
        partition_timer.time(|| partition_unit(&mut unit, &fvars, &gvars, shards));
    let serialized = serialize_timer.time(|| serialize_unit(&unit));
    // Workers only read from the serialized buffer from here on; dropping
    // the unit now bounds peak memory across the fan-out.
    drop(unit);

    let mut slots: Vec<Option<ImageResult<ShardOutputs>>> = Vec::new();
    slots.resize_with(shards, || None);
    std::thread::scope(|scope| {
        for (shard, (slot, partition)) in slots.iter_mut().zip(&partitions).enumerate() {
            let serialized = &serialized;
            scope.spawn(move || {
                *slot = Some(run_shard(
                    serialized,
                    partition,
                    shard,
                    backend,
                    request,
                    report_timings,
                ));
            });
        }
    });

    if report_timings {
        log::info!(
            "partition {:.3}s, serialize {:.3}s, weights [{}]",
            partition_timer.elapsed.as_secs_f64(),
            serialize_timer.elapsed.as_secs_f64(),
            partitions
                .iter()
                .map(|p| p.weight.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let mut outputs = Vec::with_capacity(shards);
    for slot in slots {
        outputs.push(slot.expect("every worker writes its slot")?);
    }
    Ok(outputs)
}

fn run_shard<B: BackendCompiler>(
    serialized: &[u8],
    partition: &Partition,
    shard: usize,
    backend: &B,
    request: OutputRequest,
    report_timings: bool,
) -> ImageResult<ShardOutputs> {
    let mut phase = PhaseTracker::new();
    let mut timers = ShardTimers::new(shard);

    phase.advance(WorkerPhase::Deserializing);
    let lazy = timers
        .deserialize
        .time(|| LazyUnit::parse(serialized))
        .map_err(|e| e.in_shard(shard, phase.current()))?;

    phase.advance(WorkerPhase::Materializing);
    let mut unit = timers
        .materialize
        .time(|| materialize_preserved(&lazy, partition, shard))
        .map_err(|e| e.in_shard(shard, phase.current()))?;

    phase.advance(WorkerPhase::ConstructingTables);
    timers
        .construct
        .time(|| construct_var_tables(&mut unit, partition))
        .map_err(|e| e.in_shard(shard, phase.current()))?;

    // The backend owns the optimizing and emitting phases and splits its
    // own time across the remaining timers.
    phase.advance(WorkerPhase::Optimizing);
    let outputs = backend
        .compile(&mut unit, request, &mut timers)
        .map_err(|e| ImageError::from(e).in_shard(shard, phase.current()))?;
    phase.advance(WorkerPhase::Emitting);

    if report_timings {
        timers.report();
    }
    phase.advance(WorkerPhase::Done);
    Ok(outputs)
}

/// Emit a complete image: optional preamble, the primary unit across the
/// computed shard count, and the loader metadata, in that order.
pub fn emit_image<B: BackendCompiler>(
    mut unit: CompilationUnit,
    backend: &B,
    request: OutputRequest,
    config: &PipelineConfig,
    preamble: Option<&[u8]>,
) -> ImageResult<EmittedImage> {
    if !request.any() {
        return Err(ImageError::NoOutputRequested);
    }
    let target = unit.target.clone();
    sanitize_names(&mut unit);

    // The loader header needs the global index sizes; grab them before
    // the unit moves into the shard flow.
    let nfvars = unit
        .get(FUNCTION_INDEX_SYMBOL)
        .ok_or(ImageError::MissingIndexTable {
            table: FUNCTION_INDEX_SYMBOL,
        })?
        .refs
        .len() as u32;
    let ngvars = unit
        .get(GLOBAL_INDEX_SYMBOL)
        .ok_or(ImageError::MissingIndexTable {
            table: GLOBAL_INDEX_SYMBOL,
        })?
        .refs
        .len() as u32;

    let preamble = match preamble {
        Some(blob) => {
            let preamble_unit = build_preamble_unit(&target, blob);
            Some(
                emit_unit(preamble_unit, 1, backend, request, config.report_timings)?
                    .remove(0),
            )
        }
        None => None,
    };

    let info = compute_unit_info(&unit);
    log::debug!(
        "emitting unit: {} symbols, {} functions, {} instructions, weight {}",
        info.symbols,
        info.functions,
        info.instructions,
        info.weight
    );
    let shard_count = compute_thread_count(&info, config);
    log::debug!("using {shard_count} shard(s)");

    let shards = emit_unit(unit, shard_count, backend, request, config.report_timings)?;
    let metadata_unit = build_metadata_unit(&target, shard_count, nfvars, ngvars);
    let metadata =
        emit_unit(metadata_unit, 1, backend, request, config.report_timings)?.remove(0);

    Ok(EmittedImage {
        shard_count,
        shards,
        metadata,
        preamble,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(symbols: usize, weight: u64, symbol_limit: Option<usize>) -> UnitInfo {
        UnitInfo {
            symbols,
            weight,
            symbol_limit,
            ..UnitInfo::default()
        }
    }

    fn config(hardware: usize) -> PipelineConfig {
        PipelineConfig {
            hardware_threads: Some(hardware),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_light_units_stay_single_shard() {
        assert_eq!(compute_thread_count(&info(5000, 999, None), &config(16)), 1);
    }

    #[test]
    fn test_half_of_hardware_parallelism() {
        assert_eq!(
            compute_thread_count(&info(10_000, 50_000, None), &config(16)),
            8
        );
        assert_eq!(compute_thread_count(&info(10_000, 50_000, None), &config(1)), 1);
    }

    #[test]
    fn test_symbol_count_caps_shards() {
        // 250 symbols allow at most 2 shards regardless of hardware.
        assert_eq!(
            compute_thread_count(&info(250, 50_000, None), &config(64)),
            2
        );
    }

    #[test]
    fn test_symbol_ceiling_forces_single_shard() {
        let over = info(70_000, 1_000_000, Some(64_000));
        assert_eq!(compute_thread_count(&over, &config(16)), 1);
        // The ceiling even beats an explicit override.
        let mut cfg = config(16);
        cfg.shard_override = Some("8".into());
        assert_eq!(compute_thread_count(&over, &cfg), 1);
    }

    #[test]
    fn test_thread_count_monotonic_in_symbol_ceiling() {
        let cfg = config(16);
        let mut previous = 0;
        for limit in [Some(60_000), Some(64_000), Some(70_000), Some(100_000), None] {
            let t = compute_thread_count(&info(70_000, 1_000_000, limit), &cfg);
            assert!(t >= previous, "raising the ceiling lowered T");
            previous = t;
        }
    }

    #[test]
    fn test_explicit_override_wins() {
        let mut cfg = config(4);
        cfg.shard_override = Some("7".into());
        assert_eq!(
            compute_thread_count(&info(10_000, 50_000, None), &cfg),
            7
        );
    }

    #[test]
    fn test_malformed_override_falls_back() {
        for bad in ["zero?", "-3", "0", ""] {
            let mut cfg = config(16);
            cfg.shard_override = Some(bad.into());
            assert_eq!(
                compute_thread_count(&info(10_000, 50_000, None), &cfg),
                8,
                "override '{bad}' should be ignored"
            );
        }
    }

    #[test]
    fn test_fallback_limit_only_lowers() {
        let mut cfg = config(16);
        cfg.fallback_limit = Some("2".into());
        assert_eq!(compute_thread_count(&info(10_000, 50_000, None), &cfg), 2);
        cfg.fallback_limit = Some("32".into());
        assert_eq!(compute_thread_count(&info(10_000, 50_000, None), &cfg), 8);
        // Ignored entirely when an explicit override is present.
        cfg.shard_override = Some("6".into());
        cfg.fallback_limit = Some("2".into());
        assert_eq!(compute_thread_count(&info(10_000, 50_000, None), &cfg), 6);
    }
}
