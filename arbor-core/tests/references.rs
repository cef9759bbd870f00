//! Reference and symlink behavior: key-prefix references, stored
//! symlinks, chains, and indexing through dereferenced paths.

use arbor_core::{Db, QueryFlags, ServerDb};

fn fresh() -> ServerDb {
    ServerDb::from_db(Db::empty("/nonexistent/references-db.json"))
}

fn run(db: &mut ServerDb, args: &[&str]) -> Vec<String> {
    let reply = db.query_args(QueryFlags::default(), args);
    assert!(
        !reply.starts_with("error: "),
        "unexpected error from {args:?}: {reply}"
    );
    reply
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn run_err(db: &mut ServerDb, args: &[&str]) -> String {
    let reply = db.query_args(QueryFlags::default(), args);
    assert!(
        reply.starts_with("error: "),
        "expected an error from {args:?}, got {reply}"
    );
    reply
}

#[test]
fn reference_continues_indexing_below_the_target() {
    let mut db = fresh();
    run(&mut db, &["pointer", "=", "target"]);
    run(&mut db, &["target", "sub", "=", "deep"]);
    // !pointer sub -> target sub
    assert_eq!(run(&mut db, &["!pointer", "sub"]), vec!["deep"]);
}

#[test]
fn sequence_reference_indexes_every_target() {
    let mut db = fresh();
    run(&mut db, &["all", "=", "first", "second"]);
    run(&mut db, &["first", "kind", "=", "one"]);
    run(&mut db, &["second", "kind", "=", "two"]);
    assert_eq!(run(&mut db, &["!all", "kind"]), vec!["one", "two"]);
}

#[test]
fn symlink_chains_resolve_transitively() {
    let mut db = fresh();
    run(&mut db, &["a", "=", "!b"]);
    run(&mut db, &["b", "=", "!c"]);
    run(&mut db, &["c", "=", "bottom"]);
    assert_eq!(run(&mut db, &["a"]), vec!["bottom"]);
}

#[test]
fn writes_travel_through_references() {
    let mut db = fresh();
    run(&mut db, &["pointer", "=", "slot"]);
    run(&mut db, &["!pointer", "nested", "=", "value"]);
    assert_eq!(run(&mut db, &["slot", "nested"]), vec!["value"]);

    run(&mut db, &["!pointer", "nested", "--del"]);
    assert_eq!(run(&mut db, &["slot", "nested"]), Vec::<String>::new());
}

#[test]
fn operators_apply_at_the_dereferenced_path() {
    let mut db = fresh();
    run(&mut db, &["pointer", "=", "list"]);
    run(&mut db, &["list", "=", "a", "b"]);
    run(&mut db, &["!pointer", "+", "c"]);
    assert_eq!(run(&mut db, &["list"]), vec!["a", "b", "c"]);

    assert_eq!(run(&mut db, &["!pointer", "--pop"]), vec!["c"]);
    assert_eq!(run(&mut db, &["list"]), vec!["a", "b"]);
}

#[test]
fn keys_through_a_reference() {
    let mut db = fresh();
    run(&mut db, &["pointer", "=", "dict"]);
    run(&mut db, &["dict", "x", "=", "1"]);
    run(&mut db, &["dict", "y", "=", "2"]);
    assert_eq!(run(&mut db, &["!pointer", "--keys"]), vec!["x", "y"]);
}

#[test]
fn stored_symlink_inside_a_mapping_renders_through() {
    let mut db = fresh();
    run(&mut db, &["target", "=", "gold"]);
    run(&mut db, &["box", "lid", "=", "!target"]);
    assert_eq!(run(&mut db, &["box", "lid"]), vec!["gold"]);
}

#[test]
fn mixed_sequences_render_literals_and_follow_links() {
    let mut db = fresh();
    run(&mut db, &["linked", "=", "hidden"]);
    run(&mut db, &["xs", "=", "plain", "!linked", "tail"]);
    assert_eq!(run(&mut db, &["xs"]), vec!["plain", "hidden", "tail"]);
}

#[test]
fn dereference_of_a_mapping_value_walks_its_keys() {
    let mut db = fresh();
    run(&mut db, &["group", "alpha", "=", "x"]);
    run(&mut db, &["group", "beta", "=", "y"]);
    run(&mut db, &["alpha", "=", "1"]);
    run(&mut db, &["beta", "=", "2"]);
    // dereferencing `group` means dereferencing each of its keys
    assert_eq!(run(&mut db, &["!group"]), vec!["1", "2"]);
}

#[test]
fn self_referential_chain_is_an_error_not_a_hang() {
    let mut db = fresh();
    run(&mut db, &["ouroboros", "=", "!ouroboros"]);
    let reply = run_err(&mut db, &["ouroboros"]);
    assert!(reply.contains("depth"), "{reply}");
}

#[test]
fn mutual_reference_cycle_is_an_error_not_a_hang() {
    let mut db = fresh();
    run(&mut db, &["ping", "=", "!pong"]);
    run(&mut db, &["pong", "=", "!ping"]);
    run_err(&mut db, &["ping"]);
    // the failure mutated nothing and the tree still answers
    assert_eq!(run(&mut db, &["--keys"]), vec!["ping", "pong"]);
}

#[test]
fn multi_segment_reference_with_further_indexing() {
    let mut db = fresh();
    run(&mut db, &["pointer", "=", "outer inner"]);
    run(&mut db, &["outer", "inner", "leaf", "=", "found"]);
    assert_eq!(run(&mut db, &["!pointer", "leaf"]), vec!["found"]);
}

#[test]
fn strict_mode_still_errors_through_references() {
    let mut db = fresh();
    run(&mut db, &["pointer", "=", "missing"]);
    let strict = QueryFlags {
        add_context: false,
        strict: true,
    };
    let reply = db.query_args(strict, &["!pointer"]);
    assert_eq!(reply, "error: missing not found\n");
}

#[test]
fn dereference_results_are_never_cached() {
    let mut db = fresh();
    run(&mut db, &["pointer", "=", "value"]);
    run(&mut db, &["value", "=", "one"]);
    assert_eq!(run(&mut db, &["!pointer"]), vec!["one"]);
    assert_eq!(db.cache_len(), 0);

    // retargeting the pointer is visible immediately
    run(&mut db, &["value", "=", "two"]);
    assert_eq!(run(&mut db, &["!pointer"]), vec!["two"]);
}
