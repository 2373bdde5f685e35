//! DAG traversal over stored blocks.
//!
//! Used on both sides of a pull: the responder walks back from the wanted
//! blocks, and the requester orders a fetched batch so that parents are
//! processed before their children.

use crate::block::Block;
use crate::blockstore::BlockStore;
use crate::datastore::StoreError;
use crate::hash::Cid;
use std::collections::{HashMap, HashSet, VecDeque};
use tessera_core::COMPOSITE_FIELD;

/// Get all ancestors of a block (transitive closure over heads and links).
pub fn ancestors<S: BlockStore>(store: &S, cid: &Cid) -> Result<HashSet<Cid>, StoreError> {
    let mut result = HashSet::new();
    let mut queue = VecDeque::new();

    if let Some(block) = store.get_block(cid)? {
        queue.extend(block.parents());
    }

    while let Some(current) = queue.pop_front() {
        if result.insert(current) {
            if let Some(block) = store.get_block(&current)? {
                queue.extend(block.parents());
            }
        }
    }

    Ok(result)
}

/// Blocks reachable from `want` that the requester lacks.
///
/// The walk stops at anything in `have` and returns at most `limit` blocks,
/// wanted blocks first. The second element lists wanted CIDs that did not fit.
pub fn collect_missing<S: BlockStore>(
    store: &S,
    want: &[Cid],
    have: &[Cid],
    limit: usize,
) -> Result<(Vec<Block>, Vec<Cid>), StoreError> {
    let have: HashSet<Cid> = have.iter().copied().collect();
    let mut seen = HashSet::new();
    let mut queue: VecDeque<Cid> = want.iter().copied().collect();
    let mut blocks = Vec::new();
    let mut more = Vec::new();

    while let Some(cid) = queue.pop_front() {
        if have.contains(&cid) || !seen.insert(cid) {
            continue;
        }
        let Some(block) = store.get_block(&cid)? else {
            continue;
        };
        if blocks.len() >= limit {
            if want.contains(&cid) {
                more.push(cid);
            }
            continue;
        }
        queue.extend(block.parents());
        blocks.push(block);
    }

    Ok((blocks, more))
}

/// Order a batch so that every block comes after its parents within the batch.
///
/// Kahn's algorithm; parents outside the batch are ignored. Ties are broken by
/// CID so the order is deterministic.
pub fn topological_order(blocks: Vec<Block>) -> Vec<Block> {
    let in_batch: HashSet<Cid> = blocks.iter().map(|b| b.cid()).collect();
    let mut in_degree: HashMap<Cid, usize> = HashMap::new();
    let mut children: HashMap<Cid, Vec<Cid>> = HashMap::new();
    let mut by_cid: HashMap<Cid, Block> = HashMap::new();

    for block in blocks {
        let mut parents: Vec<Cid> = block.parents().filter(|p| in_batch.contains(p)).collect();
        parents.sort();
        parents.dedup();
        in_degree.insert(block.cid(), parents.len());
        for parent in parents {
            children.entry(parent).or_default().push(block.cid());
        }
        by_cid.insert(block.cid(), block);
    }

    let mut ready: Vec<Cid> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(c, _)| *c)
        .collect();
    ready.sort();
    let mut queue: VecDeque<Cid> = ready.into();
    let mut result = Vec::with_capacity(by_cid.len());

    while let Some(cid) = queue.pop_front() {
        if let Some(block) = by_cid.remove(&cid) {
            result.push(block);
        }
        if let Some(kids) = children.get(&cid) {
            let mut unlocked = Vec::new();
            for child in kids {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        unlocked.push(*child);
                    }
                }
            }
            unlocked.sort();
            queue.extend(unlocked);
        }
    }

    result
}

/// Split a batch into update units: each composite block together with the
/// field blocks it links, in causal order.
///
/// Units come out parents-first. Field blocks no composite in the batch links
/// are returned separately.
pub fn composite_units(blocks: Vec<Block>) -> (Vec<Vec<Block>>, Vec<Block>) {
    let mut fields: HashMap<Cid, Block> = HashMap::new();
    let mut composites = Vec::new();
    for block in blocks {
        if block.field() == COMPOSITE_FIELD {
            composites.push(block);
        } else {
            fields.insert(block.cid(), block);
        }
    }

    let mut units = Vec::with_capacity(composites.len());
    for composite in topological_order(composites) {
        let mut unit: Vec<Block> = composite
            .links()
            .iter()
            .filter_map(|link| fields.remove(&link.cid))
            .collect();
        unit.push(composite);
        units.push(topological_order(unit));
    }

    let mut unlinked: Vec<Block> = fields.into_values().collect();
    unlinked.sort_by_key(|b| b.cid());
    (units, unlinked)
}
