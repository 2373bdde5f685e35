//! Replication between document stores without a network.
//!
//! Blocks are shipped by hand between replicas: the sender walks back from its
//! composite heads, the receiver merges what arrives, re-queueing anything
//! whose parents have not arrived yet.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;
use tessera_core::{DocId, FieldValue, Fields};
use tessera_db::{CollectionDescription, DbConfig, DbError, DocumentStore, Event, FieldKind};
use tessera_merkle::{walker, Block, BlockBuilder, Cid, MemoryDatastore};

fn users() -> CollectionDescription {
    CollectionDescription::new("Users")
        .with_field("name", FieldKind::Register)
        .with_field("age", FieldKind::Register)
        .with_field("visits", FieldKind::Counter)
}

fn replica() -> DocumentStore {
    let db = DocumentStore::in_memory();
    db.create_collection(users()).unwrap();
    db
}

fn fields(pairs: &[(&str, FieldValue)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Blocks `from` holds for `doc_id` that `to` lacks.
fn missing_blocks(from: &DocumentStore, to: &DocumentStore, doc_id: &DocId) -> Vec<Block> {
    let want = from.heads(doc_id).unwrap();
    let have = to.heads(doc_id).unwrap();
    let (blocks, more) = from.blocks_for(&want, &have, usize::MAX).unwrap();
    assert!(more.is_empty());
    blocks
}

/// Merge `blocks` in the given order, re-queueing blocked ones.
fn deliver(to: &DocumentStore, blocks: Vec<Block>) {
    let mut queue: VecDeque<Block> = blocks.into();
    let mut stalls = 0;
    while let Some(block) = queue.pop_front() {
        let outcome = to.process_remote_block("Users", &block).unwrap();
        if outcome.is_blocked() {
            assert!(!to.has_block(&block.cid()).unwrap());
            queue.push_back(block);
            stalls += 1;
            assert!(stalls < 10_000, "delivery never completed");
        }
    }
}

fn ship(from: &DocumentStore, to: &DocumentStore, doc_id: &DocId) {
    deliver(to, walker::topological_order(missing_blocks(from, to, doc_id)));
}

fn ship_shuffled(from: &DocumentStore, to: &DocumentStore, doc_id: &DocId, rng: &mut StdRng) {
    let mut blocks = missing_blocks(from, to, doc_id);
    blocks.shuffle(rng);
    deliver(to, blocks);
}

#[test]
fn concurrent_equal_priority_writes_resolve_to_greater_cid() {
    let r1 = replica();
    let r2 = replica();
    let id = r1.create("Users", Fields::new()).unwrap();
    assert_eq!(r2.create("Users", Fields::new()).unwrap(), id);
    // Identical genesis content yields the identical block
    assert_eq!(r1.heads(&id).unwrap(), r2.heads(&id).unwrap());

    r1.set("Users", &id, "name", "Bob".into()).unwrap();
    r2.set("Users", &id, "name", "Alice".into()).unwrap();
    let bob = r1.field_heads(&id, "name").unwrap()[0];
    let alice = r2.field_heads(&id, "name").unwrap()[0];
    assert_eq!(r1.get_block(&bob).unwrap().unwrap().height(), 1);
    assert_eq!(r2.get_block(&alice).unwrap().unwrap().height(), 1);

    ship(&r1, &r2, &id);
    ship(&r2, &r1, &id);

    let expected = if bob > alice { "Bob" } else { "Alice" };
    let d1 = r1.get("Users", &id).unwrap();
    let d2 = r2.get("Users", &id).unwrap();
    assert_eq!(d1, d2);
    assert_eq!(d1.get("name"), Some(&FieldValue::from(expected)));
    assert_eq!(d1.heads.len(), 2);
    assert_eq!(d1.field_heads["name"].len(), 2);
}

#[test]
fn history_up_to_an_earlier_head_resolves_to_that_value() {
    let r1 = replica();
    let id = r1.create("Users", fields(&[("name", "X".into())])).unwrap();
    let first = r1.heads(&id).unwrap();
    r1.set("Users", &id, "name", "Y".into()).unwrap();
    assert_eq!(r1.get("Users", &id).unwrap().get("name"), Some(&FieldValue::from("Y")));

    let rolled_back = replica();
    let (blocks, _) = r1.blocks_for(&first, &[], usize::MAX).unwrap();
    deliver(&rolled_back, walker::topological_order(blocks));

    let doc = rolled_back.get("Users", &id).unwrap();
    assert_eq!(doc.get("name"), Some(&FieldValue::from("X")));
    assert_eq!(doc.heads, first);
}

#[test]
fn missing_parent_is_reported_then_merged() {
    let r1 = replica();
    let r2 = replica();
    let id = r1.create("Users", fields(&[("name", "X".into())])).unwrap();
    let genesis = r1.field_heads(&id, "name").unwrap()[0];
    r1.set("Users", &id, "name", "Y".into()).unwrap();
    let child = r1.field_heads(&id, "name").unwrap()[0];

    let child_block = r1.get_block(&child).unwrap().unwrap();
    let outcome = r2.process_remote_block("Users", &child_block).unwrap();
    assert_eq!(outcome.missing, vec![genesis]);
    assert!(!r2.has_block(&child).unwrap());
    assert!(r2.collection_of(&id).unwrap().is_none());

    let genesis_block = r1.get_block(&genesis).unwrap().unwrap();
    assert!(r2.process_remote_block("Users", &genesis_block).unwrap().stored);
    let outcome = r2.process_remote_block("Users", &child_block).unwrap();
    assert!(outcome.stored && outcome.applied);
    assert_eq!(r2.field_heads(&id, "name").unwrap(), vec![child]);

    // Reprocessing is a no-op
    let again = r2.process_remote_block("Users", &child_block).unwrap();
    assert!(!again.stored && !again.is_blocked());
}

#[test]
fn replicas_converge_under_random_delivery() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let replicas: Vec<DocumentStore> = (0..3).map(|_| replica()).collect();
        let id = replicas[0].create("Users", Fields::new()).unwrap();
        let mut increments = 0i64;

        for round in 0..30 {
            let r = rng.gen_range(0..replicas.len());
            let db = &replicas[r];
            if db.collection_of(&id).unwrap().is_some() {
                match rng.gen_range(0..4) {
                    0 => {
                        let n = rng.gen_range(-5..10);
                        db.increment("Users", &id, "visits", n).unwrap();
                        increments += n;
                    }
                    1 => {
                        db.delete_field("Users", &id, "age").unwrap();
                    }
                    _ => {
                        db.set("Users", &id, "name", format!("r{}-{}", r, round).into())
                            .unwrap();
                    }
                }
            }

            let from = rng.gen_range(0..replicas.len());
            let to = rng.gen_range(0..replicas.len());
            if from != to {
                ship_shuffled(&replicas[from], &replicas[to], &id, &mut rng);
            }
        }

        for _ in 0..2 {
            for from in 0..replicas.len() {
                for to in 0..replicas.len() {
                    if from != to {
                        ship_shuffled(&replicas[from], &replicas[to], &id, &mut rng);
                    }
                }
            }
        }

        let docs: Vec<_> = replicas.iter().map(|db| db.get("Users", &id).unwrap()).collect();
        for doc in &docs[1..] {
            assert_eq!(doc, &docs[0], "seed {}", seed);
        }
        let visits = docs[0].get("visits").and_then(FieldValue::as_int).unwrap_or(0);
        assert_eq!(visits, increments, "seed {}", seed);
    }
}

#[test]
fn failed_merge_commit_leaves_prior_state() {
    let r1 = replica();
    let mem = Arc::new(MemoryDatastore::new());
    let r2 = DocumentStore::open(mem.clone(), DbConfig::default()).unwrap();
    r2.create_collection(users()).unwrap();

    let id = r1.create("Users", fields(&[("name", "X".into())])).unwrap();
    let blocks = walker::topological_order(missing_blocks(&r1, &r2, &id));
    let (first, rest) = blocks.split_first().unwrap();

    mem.fail_next_commits(1);
    let err = r2.process_remote_block("Users", first).unwrap_err();
    assert!(err.is_retryable());
    assert!(!r2.has_block(&first.cid()).unwrap());
    assert!(r2.field_heads(&id, "name").unwrap().is_empty());

    assert!(r2.process_remote_block("Users", first).unwrap().stored);
    for block in rest {
        r2.process_remote_block("Users", block).unwrap();
    }
    assert_eq!(r2.get("Users", &id).unwrap(), r1.get("Users", &id).unwrap());
}

#[test]
fn unknown_delta_version_is_parked_without_blocking_other_fields() {
    let r1 = replica();
    let id = r1.create("Users", fields(&[("name", "X".into()), ("age", 1i64.into())])).unwrap();
    let mut sub = r1.subscribe();

    let heads = r1.field_heads(&id, "name").unwrap();
    let future = BlockBuilder::new(id.clone(), "name")
        .with_height(2)
        .with_heads(heads)
        .with_delta(vec![9, b'{', b'}'])
        .build()
        .unwrap();

    let outcome = r1.process_remote_block("Users", &future).unwrap();
    assert!(outcome.stored && outcome.pending && !outcome.applied);
    assert_eq!(r1.field_heads(&id, "name").unwrap(), vec![future.cid()]);
    assert_eq!(
        sub.try_recv(),
        Some(Event::BlockPending {
            doc_id: id.clone(),
            cid: future.cid(),
        })
    );

    // Other fields keep merging
    r1.set("Users", &id, "age", 2i64.into()).unwrap();
    let doc = r1.get("Users", &id).unwrap();
    assert_eq!(doc.get("name"), Some(&FieldValue::from("X")));
    assert_eq!(doc.get("age"), Some(&FieldValue::Int(2)));

    assert_eq!(r1.reprocess_pending().unwrap(), 0);
}

#[test]
fn malformed_delta_is_rejected_and_not_stored() {
    let r1 = replica();
    let id = r1.create("Users", fields(&[("name", "X".into())])).unwrap();
    let heads = r1.field_heads(&id, "name").unwrap();
    let garbage = BlockBuilder::new(id.clone(), "name")
        .with_height(2)
        .with_heads(heads.clone())
        .with_delta(vec![2, 0xff, 0x00])
        .build()
        .unwrap();

    let err = r1.process_remote_block("Users", &garbage).unwrap_err();
    assert!(err.is_integrity());
    assert!(!err.is_retryable());
    assert!(!r1.has_block(&garbage.cid()).unwrap());
    assert_eq!(r1.field_heads(&id, "name").unwrap(), heads);
}

#[test]
fn fields_outside_the_local_schema_are_kept_but_hidden() {
    let r1 = DocumentStore::in_memory();
    r1.create_collection(users().with_field("email", FieldKind::Register))
        .unwrap();
    let r2 = replica();

    let id = r1
        .create("Users", fields(&[("name", "X".into()), ("email", "x@example.com".into())]))
        .unwrap();
    ship(&r1, &r2, &id);

    let email_head = r1.field_heads(&id, "email").unwrap();
    assert!(r2.has_block(&email_head[0]).unwrap());
    assert_eq!(r2.field_heads(&id, "email").unwrap(), email_head);

    let doc = r2.get("Users", &id).unwrap();
    assert_eq!(doc.get("email"), None);
    assert_eq!(doc.get("name"), Some(&FieldValue::from("X")));
    assert_eq!(doc.heads, r1.heads(&id).unwrap());
}

#[test]
fn blocks_for_another_collection_are_rejected() {
    let r1 = replica();
    let r2 = replica();
    r2.create_collection(CollectionDescription::new("Products").with_field("name", FieldKind::Register))
        .unwrap();
    let id = r1.create("Users", fields(&[("name", "X".into())])).unwrap();
    ship(&r1, &r2, &id);

    r1.set("Users", &id, "name", "Y".into()).unwrap();
    let head: Cid = r1.field_heads(&id, "name").unwrap()[0];
    let block = r1.get_block(&head).unwrap().unwrap();
    assert!(matches!(
        r2.process_remote_block("Products", &block),
        Err(DbError::WrongCollection { .. })
    ));
    assert!(matches!(
        r2.process_remote_block("Orders", &block),
        Err(DbError::CollectionNotFound(_))
    ));
}

#[test]
fn remote_merges_publish_events() {
    let r1 = replica();
    let r2 = replica();
    let mut sub = r2.subscribe();
    let id = r1.create("Users", fields(&[("name", "X".into())])).unwrap();
    ship(&r1, &r2, &id);

    let mut merged = Vec::new();
    while let Some(event) = sub.try_recv() {
        match event {
            Event::Merged { collection, doc_id, cid } => {
                assert_eq!(collection, "Users");
                assert_eq!(doc_id, id);
                merged.push(cid);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    // One field block and one composite block
    assert_eq!(merged.len(), 2);
    assert_eq!(merged.last(), r1.heads(&id).unwrap().first());
}

#[test]
fn reads_never_observe_a_partial_update() {
    let db = Arc::new(replica());
    let id = db
        .create("Users", fields(&[("name", "0".into()), ("age", 0i64.into())]))
        .unwrap();

    let writer = {
        let db = db.clone();
        let id = id.clone();
        std::thread::spawn(move || {
            for i in 1..200i64 {
                db.update("Users", &id, fields(&[("name", i.to_string().into()), ("age", i.into())]))
                    .unwrap();
            }
        })
    };

    for _ in 0..500 {
        let doc = db.get("Users", &id).unwrap();
        let age = doc.get("age").and_then(FieldValue::as_int).unwrap();
        assert_eq!(doc.get("name"), Some(&FieldValue::from(age.to_string())));
    }
    writer.join().unwrap();
}

#[test]
fn remote_update_with_a_missing_field_block_is_not_applied() {
    let r1 = replica();
    let r2 = replica();
    let id = r1
        .create("Users", fields(&[("name", "0".into()), ("age", 0i64.into())]))
        .unwrap();
    ship(&r1, &r2, &id);
    r1.update("Users", &id, fields(&[("name", "1".into()), ("age", 1i64.into())]))
        .unwrap();

    let (mut units, unlinked) = walker::composite_units(missing_blocks(&r1, &r2, &id));
    assert!(unlinked.is_empty());
    assert_eq!(units.len(), 1);
    let unit = units.remove(0);
    assert_eq!(unit.len(), 3);

    let age_head = r1.field_heads(&id, "age").unwrap()[0];
    let partial: Vec<Block> = unit.iter().filter(|b| b.cid() != age_head).cloned().collect();
    let outcome = r2.process_remote_batch("Users", &partial).unwrap();
    assert!(outcome.is_blocked());
    assert_eq!(outcome.missing, vec![age_head]);
    assert!(outcome.stored.is_empty());
    for block in &partial {
        assert!(!r2.has_block(&block.cid()).unwrap());
    }
    let doc = r2.get("Users", &id).unwrap();
    assert_eq!(doc.get("name"), Some(&FieldValue::from("0")));
    assert_eq!(doc.get("age"), Some(&FieldValue::from(0i64)));

    let outcome = r2.process_remote_batch("Users", &unit).unwrap();
    assert!(!outcome.is_blocked());
    assert_eq!(outcome.merged(), 3);
    let doc = r2.get("Users", &id).unwrap();
    assert_eq!(doc.get("name"), Some(&FieldValue::from("1")));
    assert_eq!(doc.get("age"), Some(&FieldValue::from(1i64)));
    assert_eq!(doc.heads, r1.heads(&id).unwrap());
}

#[test]
fn reads_never_observe_a_partial_remote_update() {
    let r1 = replica();
    let r2 = Arc::new(replica());
    let id = r1
        .create("Users", fields(&[("name", "0".into()), ("age", 0i64.into())]))
        .unwrap();
    ship(&r1, &r2, &id);
    for i in 1..100i64 {
        r1.update("Users", &id, fields(&[("name", i.to_string().into()), ("age", i.into())]))
            .unwrap();
    }
    let (units, unlinked) = walker::composite_units(missing_blocks(&r1, &r2, &id));
    assert!(unlinked.is_empty());
    assert_eq!(units.len(), 99);

    let merger = {
        let r2 = r2.clone();
        std::thread::spawn(move || {
            for unit in units {
                let outcome = r2.process_remote_batch("Users", &unit).unwrap();
                assert!(!outcome.is_blocked());
            }
        })
    };

    for _ in 0..500 {
        let doc = r2.get("Users", &id).unwrap();
        let age = doc.get("age").and_then(FieldValue::as_int).unwrap();
        assert_eq!(doc.get("name"), Some(&FieldValue::from(age.to_string())));
    }
    merger.join().unwrap();
    assert_eq!(r2.get("Users", &id).unwrap().get("age"), Some(&FieldValue::from(99i64)));
}

#[test]
fn batches_spanning_documents_are_rejected() {
    let r1 = replica();
    let r2 = replica();
    let a = r1.create("Users", fields(&[("name", "A".into())])).unwrap();
    let b = r1.create("Users", fields(&[("name", "B".into())])).unwrap();

    let mut batch = missing_blocks(&r1, &r2, &a);
    batch.extend(missing_blocks(&r1, &r2, &b));
    let err = r2.process_remote_batch("Users", &batch).unwrap_err();
    assert!(matches!(err, DbError::MixedBatch { .. }));
    assert!(err.is_integrity());
    assert!(r2.collection_of(&a).unwrap().is_none());
}
