//! Integration tests: text, literal table, registry and resolver together.
//!
//! These tests exercise the public pipeline the way an embedding runtime
//! would: build texts under transactions, register subtrees, bulk-load
//! literals, then read the content back through a RuntimeResolver.

use std::time::Instant;

use sapling_core::{Config, Env, ErrorKind, SapError};
use sapling_text::{LiteralTable, RuntimeResolver, Seq, Text, TextHandle, TreeRegistry};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_env() -> Env {
    Env::new(Config::budget()).unwrap()
}

fn text_from(env: &Env, s: &str) -> Text {
    let mut txn = env.begin();
    let mut text = Text::new(env);
    text.from_utf8(&mut txn, s.as_bytes()).unwrap();
    txn.commit().unwrap();
    text
}

fn text_of(env: &Env, handles: &[TextHandle]) -> Text {
    let mut txn = env.begin();
    let mut text = Text::new(env);
    for &h in handles {
        text.push_back_handle(&mut txn, h).unwrap();
    }
    txn.commit().unwrap();
    text
}

fn to_string(text: &Text) -> String {
    String::from_utf8(text.to_utf8_full(None).unwrap()).unwrap()
}

// ---------------------------------------------------------------------------
// Basic Text Operations
// ---------------------------------------------------------------------------

#[test]
fn test_abc_round_trip() {
    let env = test_env();
    let mut txn = env.begin();
    let mut text = Text::new(&env);
    for c in ['A', 'B', 'C'] {
        text.push_back(&mut txn, c).unwrap();
    }
    assert_eq!(text.len(), 3);
    assert_eq!(text.get(1).unwrap(), 'B');

    let mut buf = [0u8; 3];
    assert_eq!(text.to_utf8(&mut buf).unwrap(), 3);
    assert_eq!(&buf, b"ABC");

    let (left, right) = text.split_at(&mut txn, 1).unwrap();
    txn.commit().unwrap();
    assert_eq!(to_string(&left), "A");
    assert_eq!(to_string(&right), "BC");
}

#[test]
fn test_multilingual_edit() {
    let env = test_env();
    let mut text = text_from(&env, "Grüße, 世界 🙂");
    assert_eq!(text.len(), 11);

    let mut txn = env.begin();
    assert_eq!(text.delete(&mut txn, 10).unwrap(), '🙂');
    text.insert(&mut txn, 10, '🌍').unwrap();
    text.set(&mut txn, 0, 'g').unwrap();
    txn.commit().unwrap();
    assert_eq!(to_string(&text), "grüße, 世界 🌍");
}

#[test]
fn test_concat_and_split_large() {
    let env = test_env();
    let mut txn = env.begin();
    let mut a = Text::new(&env);
    let mut b = Text::new(&env);
    for i in 0..5000u32 {
        let c = char::from_u32('a' as u32 + i % 26).unwrap();
        a.push_back(&mut txn, c).unwrap();
        b.push_front(&mut txn, c).unwrap();
    }
    a.concat(&mut txn, &mut b).unwrap();
    assert_eq!(a.len(), 10_000);
    assert!(b.is_empty());

    let (left, right) = a.split_at(&mut txn, 5000).unwrap();
    txn.commit().unwrap();
    let left = to_string(&left);
    let right = to_string(&right);
    assert_eq!(left.chars().rev().collect::<String>(), right);
}

// ---------------------------------------------------------------------------
// UTF-8 Strictness
// ---------------------------------------------------------------------------

#[test]
fn test_malformed_utf8_leaves_destination() {
    let env = test_env();
    let mut text = text_from(&env, "intact");
    let mut txn = env.begin();
    for bad in [&[0xC0u8, 0xAF][..], &[0xE2, 0x82], &[0xED, 0xA0, 0x80]] {
        let err = text.from_utf8(&mut txn, bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert_eq!(to_string(&text), "intact");
    }
    txn.commit().unwrap();
}

#[test]
fn test_buffer_too_small_reports_required() {
    let env = test_env();
    let text = text_from(&env, "€€");
    let mut buf = [0u8; 5];
    match text.to_utf8(&mut buf) {
        Err(err @ SapError::BufferTooSmall { required: 6, capacity: 5 }) => {
            assert_eq!(err.kind(), ErrorKind::Range);
        }
        other => panic!("unexpected {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Copy-on-Write
// ---------------------------------------------------------------------------

#[test]
fn test_clone_isolation_both_directions() {
    let env = test_env();
    let mut original = text_from(&env, "base");
    let mut copy = original.clone();
    assert!(original.is_shared());

    let mut txn = env.begin();
    copy.push_back(&mut txn, '1').unwrap();
    original.push_back(&mut txn, '2').unwrap();
    txn.commit().unwrap();

    assert_eq!(to_string(&original), "base2");
    assert_eq!(to_string(&copy), "base1");
    assert!(!original.is_shared());
}

#[test]
fn test_registered_clone_survives_edits() {
    let env = test_env();
    let mut registry = TreeRegistry::new();
    let mut text = text_from(&env, "v1");
    let id = registry.register(&text).unwrap();

    let mut txn = env.begin();
    text.set(&mut txn, 1, '2').unwrap();
    txn.commit().unwrap();

    assert_eq!(to_string(&text), "v2");
    assert_eq!(to_string(&registry.get(id).unwrap()), "v1");
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[test]
fn test_literal_and_tree_resolution() {
    let env = test_env();
    let mut literals = LiteralTable::new(&env);
    let mut registry = TreeRegistry::new();

    let greeting = literals.add("Hello".as_bytes()).unwrap();
    let inner = text_of(&env, &[TextHandle::Literal(greeting), ','.into(), ' '.into()]);
    let inner_id = registry.register(&inner).unwrap();

    let mut txn = env.begin();
    let mut name = Text::new(&env);
    name.from_utf8_bulk(&mut txn, "wörld".as_bytes(), &mut literals).unwrap();
    txn.commit().unwrap();
    literals.seal();

    let doc = text_of(&env, &[TextHandle::Tree(inner_id), name.get_handle(0).unwrap(), '!'.into()]);

    let resolver = RuntimeResolver::new(env.config())
        .with_literals(&literals)
        .with_trees(&registry);

    assert_eq!(doc.len(), 3);
    assert_eq!(doc.codepoint_len_resolved(Some(&resolver)).unwrap(), 13);
    assert_eq!(doc.get_codepoint_resolved(8, Some(&resolver)).unwrap(), 'ö');
    assert_eq!(doc.utf8_len_resolved(Some(&resolver)).unwrap(), 14);
    assert_eq!(doc.to_utf8_full(Some(&resolver)).unwrap(), "Hello, wörld!".as_bytes());

    let mut buf = vec![0u8; 14];
    assert_eq!(doc.to_utf8_resolved(&mut buf, Some(&resolver)).unwrap(), 14);
    assert_eq!(buf, "Hello, wörld!".as_bytes());
}

#[test]
fn test_self_referencing_tree_rejected() {
    let env = test_env();
    let mut registry = TreeRegistry::new();
    // id 0 will contain TREE(0)
    let looped = text_of(&env, &['x'.into(), TextHandle::Tree(0)]);
    assert_eq!(registry.register(&looped).unwrap(), 0);

    let resolver = RuntimeResolver::new(env.config()).with_trees(&registry);
    let err = looped.to_utf8_full(Some(&resolver)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[test]
fn test_released_tree_is_unresolvable() {
    let env = test_env();
    let mut registry = TreeRegistry::new();
    let id = registry.register(&text_from(&env, "gone")).unwrap();
    registry.release(id).unwrap();

    let doc = text_of(&env, &[TextHandle::Tree(id)]);
    let resolver = RuntimeResolver::new(env.config()).with_trees(&registry);
    assert_eq!(doc.codepoint_len_resolved(Some(&resolver)).unwrap_err().kind(), ErrorKind::Invalid);
}

#[test]
fn test_literal_fingerprint_agreement() {
    let env_a = test_env();
    let env_b = Env::new(Config::phone()).unwrap();
    let mut a = LiteralTable::new(&env_a);
    let mut b = LiteralTable::new(&env_b);
    for word in ["alpha", "beta", "alpha", "gamma"] {
        a.add(word.as_bytes()).unwrap();
        b.add(word.as_bytes()).unwrap();
    }
    a.seal();
    b.seal();
    assert_eq!(a.len(), 3);
    assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
}

// ---------------------------------------------------------------------------
// Transactions and Poisoning
// ---------------------------------------------------------------------------

#[test]
fn test_abort_restores_committed_text() {
    let env = test_env();
    let mut text = text_from(&env, "stable");
    let blocks = env.stats().live_blocks;

    let mut txn = env.begin();
    for c in " and then some".chars() {
        text.push_back(&mut txn, c).unwrap();
    }
    text.set(&mut txn, 0, 'S').unwrap();
    txn.abort();

    assert!(text.is_valid());
    assert_eq!(to_string(&text), "stable");
    assert_eq!(env.stats().live_blocks, blocks);
}

#[test]
fn test_abort_after_oom_restores_both_operands() {
    let env = test_env();
    let mut hello = text_from(&env, "hello");
    let mut world = text_from(&env, " world");

    let mut txn = env.begin();
    hello.push_back(&mut txn, ',').unwrap();
    env.arena().fail_after(0);
    assert!(hello.concat(&mut txn, &mut world).unwrap_err().is_oom());
    assert_eq!(hello.utf8_len(), Err(SapError::Poisoned));
    txn.abort();

    assert_eq!(to_string(&hello), "hello");
    assert_eq!(to_string(&world), " world");

    let mut txn = env.begin();
    hello.concat(&mut txn, &mut world).unwrap();
    txn.commit().unwrap();
    assert_eq!(to_string(&hello), "hello world");
}

#[test]
fn test_churn_keeps_ledger_bounded() {
    let env = test_env();
    let mut txn = env.begin();
    let mut seq = Seq::new(&env);
    for round in 0..100_000u32 {
        seq.push_back(&mut txn, round).unwrap();
        seq.push_back(&mut txn, round).unwrap();
        seq.pop_back(&mut txn).unwrap();
        seq.pop_back(&mut txn).unwrap();
    }
    assert!(seq.is_empty());
    assert!(txn.allocated_blocks().is_empty());
    txn.commit().unwrap();
    assert_eq!(env.stats().live_blocks, 0);
}

#[test]
fn test_oom_poisons_sequence() {
    let env = test_env();
    let mut txn = env.begin();
    let mut seq = Seq::new(&env);
    seq.extend(&mut txn, 0..64).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin();
    let (mut left, mut right) = seq.split_at(&mut txn, 32).unwrap();
    env.arena().fail_after(0);
    assert!(left.concat(&mut txn, &mut right).unwrap_err().is_oom());
    assert!(!left.is_valid());
    assert!(!right.is_valid());

    left.reset();
    left.push_back(&mut txn, 7).unwrap();
    assert_eq!(left.to_vec().unwrap(), vec![7]);
    txn.commit().unwrap();
}

#[test]
fn test_mismatched_environments_rejected() {
    let env_a = test_env();
    let env_b = test_env();
    let mut a = text_from(&env_a, "a");
    let mut b = text_from(&env_b, "b");
    let mut txn = env_a.begin();
    let err = a.concat(&mut txn, &mut b).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert!(a.is_valid());
    assert!(b.is_valid());
}

#[test]
fn test_memory_returned_after_drop() {
    let env = test_env();
    {
        let text = text_from(&env, &"x".repeat(2000));
        let _clone = text.clone();
        assert!(env.stats().live_blocks > 0);
    }
    assert_eq!(env.stats().live_blocks, 0);
    assert_eq!(env.stats().live_bytes, 0);
}

// ---------------------------------------------------------------------------
// Throughput
// ---------------------------------------------------------------------------

#[test]
fn test_bulk_push_and_index() {
    let env = Env::default();
    let count = 100_000u32;

    let start = Instant::now();
    let mut txn = env.begin();
    let mut seq = Seq::new(&env);
    seq.extend(&mut txn, 0..count).unwrap();
    txn.commit().unwrap();
    let write_time = start.elapsed();

    let start = Instant::now();
    for i in (0..count as usize).step_by(97) {
        assert_eq!(seq.get(i).unwrap(), i as u32);
    }
    let read_time = start.elapsed();

    println!("\n=== Bulk Seq ({} items) ===", count);
    println!("  Push:  {:?} ({:.2} µs/op)", write_time, write_time.as_micros() as f64 / count as f64);
    println!("  Index: {:?}", read_time);
    println!("  Arena: {:?}", env.stats());
}
