// This module chops a compilation unit up as equally as possible by weight
// into a fixed number of shards. Symbols that reference each other must
// land in the same shard, so connectivity is computed first with a
// union-find over the reference graph; connected components are then
// assigned whole, heaviest first, to the currently lightest shard. That is
// longest-processing-time-first scheduling, which stays within 4/3 of the
// optimal makespan for identical workers. The weight of a function is an
// estimate of how expensive it will be to compile.

//! Weight-balanced unit partitioning.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use hashbrown::{HashMap, HashSet};

use crate::extract::IndexTable;
use crate::unit::{CompilationUnit, FunctionBody, Linkage, SymbolKind, Visibility};

/// Compile-cost estimate for one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionWeight {
    pub weight: u64,
    pub instructions: u64,
    pub basic_blocks: u64,
    pub clones: u64,
}

/// Number of variants the backend will emit for a hex-encoded clone
/// bitmask: one per set bit, plus the original. Non-hex characters
/// contribute no bits; weights are heuristics, so a malformed mask
/// degrades to multiplicity 1 rather than aborting.
pub fn clone_multiplicity(mask: Option<&str>) -> u64 {
    let bits: u64 = mask
        .unwrap_or("")
        .chars()
        .filter_map(|c| c.to_digit(16))
        .map(|d| u64::from(d.count_ones()))
        .sum();
    bits + 1
}

/// Weight of a defined function: base cost of one plus the instruction
/// count, plus the block count (more blocks means more work than the sum
/// of the instructions alone), all multiplied by the clone count.
pub fn function_weight(body: &FunctionBody, clone_mask: Option<&str>) -> FunctionWeight {
    let instructions = u64::from(body.instructions);
    let basic_blocks = u64::from(body.basic_blocks);
    let clones = clone_multiplicity(clone_mask);
    FunctionWeight {
        weight: (1 + instructions + basic_blocks) * clones,
        instructions,
        basic_blocks,
        clones,
    }
}

/// Whole-unit statistics feeding the thread-count heuristics.
#[derive(Debug, Clone, Default)]
pub struct UnitInfo {
    /// Defined symbols of any kind.
    pub symbols: usize,
    pub functions: usize,
    pub basic_blocks: u64,
    pub instructions: u64,
    pub clones: u64,
    pub weight: u64,
    /// External-symbol ceiling of the target's object format, if any.
    pub symbol_limit: Option<usize>,
}

/// Collect per-unit stats over all definitions.
pub fn compute_unit_info(unit: &CompilationUnit) -> UnitInfo {
    let mut info = UnitInfo {
        symbol_limit: unit.target.external_symbol_limit(),
        ..UnitInfo::default()
    };
    for symbol in unit.symbols() {
        if !symbol.is_definition() {
            continue;
        }
        info.symbols += 1;
        if let SymbolKind::Function { body: Some(body) } = &symbol.kind {
            let w = function_weight(body, symbol.clone_mask.as_deref());
            info.functions += 1;
            info.basic_blocks += w.basic_blocks;
            info.instructions += w.instructions;
            info.clones += w.clones;
            info.weight += w.weight;
        } else {
            info.weight += 1;
        }
    }
    info
}

/// One shard's slice of the unit: the assigned symbol names, the flat-id
/// sub-tables drawn from the global indices, and the accumulated weight.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub symbols: HashSet<String>,
    pub fvars: HashMap<String, u32>,
    pub gvars: HashMap<String, u32>,
    pub weight: u64,
}

struct Node {
    name: String,
    parent: usize,
    size: usize,
    weight: u64,
}

/// Union-find over partitionable definitions. Only def-to-use connectivity
/// matters here, so cycles in the reference graph need no special casing.
#[derive(Default)]
struct Connectivity {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl Connectivity {
    fn make(&mut self, name: String, weight: u64) -> usize {
        let idx = self.nodes.len();
        self.index.insert(name.clone(), idx);
        self.nodes.push(Node {
            name,
            parent: idx,
            size: 1,
            weight,
        });
        idx
    }

    fn find(&mut self, mut idx: usize) -> usize {
        while self.nodes[idx].parent != idx {
            let grandparent = self.nodes[self.nodes[idx].parent].parent;
            self.nodes[idx].parent = grandparent;
            idx = grandparent;
        }
        idx
    }

    fn merge(&mut self, a: usize, b: usize) -> usize {
        let mut x = self.find(a);
        let mut y = self.find(b);
        if x == y {
            return x;
        }
        if self.nodes[x].size < self.nodes[y].size {
            std::mem::swap(&mut x, &mut y);
        }
        self.nodes[y].parent = x;
        self.nodes[x].size += self.nodes[y].size;
        self.nodes[x].weight += self.nodes[y].weight;
        x
    }
}

/// Assign every partitionable definition to one of `shards` partitions.
///
/// Side effects on the unit: partitionable definitions become externally
/// linked with hidden visibility (cross-shard references resolve at link
/// time without being exported from the image), and `no_partition`
/// definitions are internalized so each shard keeps its own private copy.
pub fn partition_unit(
    unit: &mut CompilationUnit,
    fvars: &IndexTable,
    gvars: &IndexTable,
    shards: usize,
) -> Vec<Partition> {
    debug_assert!(shards >= 1);
    let mut conn = Connectivity::default();
    for symbol in unit.symbols_mut() {
        if !symbol.is_definition() {
            continue;
        }
        debug_assert!(!symbol.name.is_empty(), "definitions must be named");
        if symbol.no_partition {
            symbol.linkage = Linkage::Internal;
            symbol.visibility = Visibility::Default;
            continue;
        }
        symbol.linkage = Linkage::External;
        symbol.visibility = Visibility::Hidden;
        let weight = match &symbol.kind {
            SymbolKind::Function { body: Some(body) } => {
                function_weight(body, symbol.clone_mask.as_deref()).weight
            }
            _ => 1,
        };
        conn.make(symbol.name.clone(), weight);
    }

    // Everything a symbol uses goes into the same component. References to
    // declarations or internalized symbols stay out of the node map and
    // impose no constraint.
    for i in 0..conn.nodes.len() {
        let symbol = unit
            .get(&conn.nodes[i].name)
            .expect("node names come from the unit");
        let targets: Vec<usize> = symbol
            .references()
            .filter_map(|r| conn.index.get(r).copied())
            .collect();
        for j in targets {
            conn.merge(i, j);
        }
    }

    // Group members per component root, preserving insertion order so the
    // assignment below is deterministic for identical inputs.
    let n = conn.nodes.len();
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        let root = conn.find(i);
        members[root].push(i);
    }
    let mut roots: Vec<usize> = (0..n).filter(|&i| !members[i].is_empty()).collect();
    // Heaviest component first; ties broken by first-created node.
    roots.sort_by_key(|&r| (Reverse(conn.nodes[r].weight), r));

    let mut partitions: Vec<Partition> = (0..shards).map(|_| Partition::default()).collect();
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::with_capacity(shards);
    for i in 0..shards {
        heap.push(Reverse((0, i)));
    }

    for root in roots {
        let Reverse((weight, shard)) = heap.pop().expect("heap holds one entry per shard");
        let partition = &mut partitions[shard];
        for &member in &members[root] {
            let name = &conn.nodes[member].name;
            partition.symbols.insert(name.clone());
            if let Some(id) = fvars.flat_id(name) {
                partition.fvars.insert(name.clone(), id);
            }
            if let Some(id) = gvars.flat_id(name) {
                partition.gvars.insert(name.clone(), id);
            }
        }
        let component_weight = conn.nodes[root].weight;
        partition.weight += component_weight;
        heap.push(Reverse((weight + component_weight, shard)));
    }

    debug_assert!(
        verify_partitioning(unit, &partitions, fvars, gvars),
        "partitioning failed to cover the unit correctly"
    );
    partitions
}

/// Full coverage check: exactly-once assignment, co-location of every
/// reference, and a bijection between partition sub-tables and the global
/// flat-id ranges. Only wired up behind `debug_assert!` in the pipeline;
/// the input unit is trusted in release builds.
pub(crate) fn verify_partitioning(
    unit: &CompilationUnit,
    partitions: &[Partition],
    fvars: &IndexTable,
    gvars: &IndexTable,
) -> bool {
    let mut bad = false;
    let mut owner: HashMap<&str, usize> = HashMap::new();
    for (i, partition) in partitions.iter().enumerate() {
        for name in &partition.symbols {
            if let Some(prev) = owner.insert(name.as_str(), i) {
                bad = true;
                log::error!("symbol `{name}` assigned to partitions {prev} and {i}");
            }
        }
    }
    for symbol in unit.symbols() {
        let name = symbol.name.as_str();
        if !symbol.is_definition() || symbol.no_partition {
            if owner.contains_key(name) {
                bad = true;
                log::error!("`{name}` should not have been partitioned");
            }
            continue;
        }
        let Some(&home) = owner.get(name) else {
            bad = true;
            log::error!("definition `{name}` not in any partition");
            continue;
        };
        for target in symbol.references() {
            let partitionable = unit
                .get(target)
                .is_some_and(|t| t.is_definition() && !t.no_partition);
            if !partitionable {
                continue;
            }
            match owner.get(target) {
                Some(&t) if t == home => {}
                Some(&t) => {
                    bad = true;
                    log::error!(
                        "`{target}` used by `{name}` in partition {home} but lives in {t}"
                    );
                }
                None => {
                    bad = true;
                    log::error!("`{target}` used by `{name}` is not in any partition");
                }
            }
        }
    }
    fn check_ids(label: &str, len: usize, ids: impl Iterator<Item = u32>) -> bool {
        let mut bad = false;
        let mut seen = vec![0usize; len];
        for id in ids {
            match seen.get_mut(id as usize) {
                Some(slot) => *slot += 1,
                None => {
                    bad = true;
                    log::error!("{label} id {id} out of range");
                }
            }
        }
        for (id, count) in seen.iter().enumerate() {
            if *count != 1 {
                bad = true;
                log::error!("{label} id {id} appears in {count} partitions");
            }
        }
        bad
    }
    bad |= check_ids(
        "fvar",
        fvars.len(),
        partitions.iter().flat_map(|p| p.fvars.values().copied()),
    );
    bad |= check_ids(
        "gvar",
        gvars.len(),
        partitions.iter().flat_map(|p| p.gvars.values().copied()),
    );
    !bad
}
