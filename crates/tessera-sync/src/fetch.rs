//! Pull path: fetch the blocks behind advertised heads and merge them.
//!
//! A pull asks one holder at a time for everything reachable from the wanted
//! heads that is not reachable from our own heads. Every block is verified
//! against its claimed identifier before it is merged; a holder that serves a
//! bad block or cannot answer is abandoned for the next one. Updates merged
//! before a failure stay merged; an update whose blocks did not all arrive
//! is not merged at all.

use crate::engine::Inner;
use crate::error::{NetworkError, Result, SyncError};
use crate::network::{Message, PeerId, WireBlock};
use std::collections::BTreeSet;
use tessera_core::DocId;
use tessera_merkle::{walker, Block, Cid};
use tracing::{debug, warn};

/// Fetch and merge the history behind `heads`, trying `holders` in order.
/// Returns the number of blocks merged.
pub(crate) async fn pull(
    inner: &Inner,
    collection: &str,
    doc_id: &DocId,
    heads: &[Cid],
    holders: &[PeerId],
) -> Result<usize> {
    let mut want = absent(inner, heads)?;
    if want.is_empty() {
        return Ok(0);
    }

    let mut merged = 0;
    let mut last_error = None;
    for holder in holders {
        match pull_from(inner, holder, collection, doc_id, want.clone()).await {
            Ok(count) => return Ok(merged + count),
            Err(PullFailure { merged: count, error }) => {
                merged += count;
                warn!(peer = %holder, doc_id = %doc_id, error = %error, "pull failed, trying next holder");
                last_error = Some(error);
                want = absent(inner, &want)?;
                if want.is_empty() {
                    return Ok(merged);
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| SyncError::Incomplete(doc_id.clone())))
}

struct PullFailure {
    merged: usize,
    error: SyncError,
}

async fn pull_from(
    inner: &Inner,
    peer: &PeerId,
    collection: &str,
    doc_id: &DocId,
    mut want: Vec<Cid>,
) -> std::result::Result<usize, PullFailure> {
    let mut merged = 0;
    let mut parked: Vec<Block> = Vec::new();
    let fail = |merged: usize, error: SyncError| PullFailure { merged, error };

    for _ in 0..inner.config().max_fetch_depth {
        if want.is_empty() {
            break;
        }
        let have = inner.db().heads(doc_id).map_err(|e| fail(merged, e.into()))?;
        let response = inner
            .request(peer, |request_id| Message::FetchRequest {
                request_id,
                collection: collection.to_string(),
                doc_id: doc_id.clone(),
                want: want.clone(),
                have,
            })
            .await
            .map_err(|e| fail(merged, e.into()))?;

        let (wire, more) = match response {
            Message::FetchResponse { blocks, more, .. } => (blocks, more),
            Message::Error { reason, retryable, .. } => {
                return Err(fail(merged, NetworkError::Remote { reason, retryable }.into()))
            }
            other => {
                let error = NetworkError::UnexpectedResponse(other.kind().to_string());
                return Err(fail(merged, error.into()));
            }
        };
        if wire.is_empty() {
            return Err(fail(merged, SyncError::Incomplete(doc_id.clone())));
        }

        parked.extend(verify_batch(peer, doc_id, wire).map_err(|e| fail(merged, e))?);
        let (count, blocked, missing) =
            merge_ready(inner, peer, collection, std::mem::take(&mut parked)).map_err(|e| fail(merged, e))?;
        merged += count;
        parked = blocked;

        let mut next: BTreeSet<Cid> = missing.into_iter().collect();
        next.extend(more);
        want = absent(inner, &next.into_iter().collect::<Vec<_>>()).map_err(|e| fail(merged, e))?;
    }

    if !want.is_empty() || !parked.is_empty() {
        return Err(fail(merged, SyncError::Incomplete(doc_id.clone())));
    }
    debug!(peer = %peer, doc_id = %doc_id, merged, "pull complete");
    Ok(merged)
}

/// Verify every block of a response. One bad block discards the batch.
fn verify_batch(peer: &PeerId, doc_id: &DocId, wire: Vec<WireBlock>) -> Result<Vec<Block>> {
    wire.into_iter()
        .map(|WireBlock { cid, bytes }| {
            let block = Block::verify(&cid, &bytes).map_err(|e| SyncError::Integrity {
                peer: peer.clone(),
                reason: e.to_string(),
            })?;
            if block.doc_id() != doc_id {
                return Err(SyncError::Integrity {
                    peer: peer.clone(),
                    reason: format!("block {} belongs to {}", cid.short(), block.doc_id()),
                });
            }
            Ok(block)
        })
        .collect()
}

/// Merge blocks one update at a time: a composite block together with the
/// field blocks it links commits as a unit. Returns how many blocks were
/// stored, the blocks still waiting and the parents they wait for.
fn merge_ready(
    inner: &Inner,
    peer: &PeerId,
    collection: &str,
    blocks: Vec<Block>,
) -> Result<(usize, Vec<Block>, Vec<Cid>)> {
    let (mut queue, mut unlinked) = walker::composite_units(blocks);
    let mut merged = 0;

    loop {
        let mut progressed = false;
        let mut blocked = Vec::new();
        let mut missing = BTreeSet::new();

        for unit in queue {
            let outcome = inner
                .db()
                .process_remote_batch(collection, &unit)
                .map_err(|e| match e {
                    e if e.is_integrity() => SyncError::Integrity {
                        peer: peer.clone(),
                        reason: e.to_string(),
                    },
                    e => e.into(),
                })?;
            if outcome.is_blocked() {
                missing.extend(outcome.missing);
                blocked.push(unit);
            } else {
                progressed = true;
                merged += outcome.merged();
            }
        }

        if blocked.is_empty() || !progressed {
            let mut waiting: Vec<Block> = blocked.into_iter().flatten().collect();
            waiting.append(&mut unlinked);
            for block in &waiting {
                missing.remove(&block.cid());
            }
            return Ok((merged, waiting, missing.into_iter().collect()));
        }
        queue = blocked;
    }
}

fn absent(inner: &Inner, cids: &[Cid]) -> Result<Vec<Cid>> {
    let mut out = Vec::new();
    for cid in cids {
        if !inner.db().has_block(cid)? {
            out.push(*cid);
        }
    }
    Ok(out)
}
