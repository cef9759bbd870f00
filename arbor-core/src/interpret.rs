//! Query Interpreter
//!
//! Walks an argument vector left to right, descending the tree by each
//! non-operator token and dispatching on the first operator found. Keys
//! prefixed with `!` and stored string values beginning with `!` are
//! references: the walk rebases itself on the dereferenced path, always
//! starting over from the root.
//!
//! All per-query state lives in [`QueryCtx`]; resetting the engine after
//! a query is simply dropping the context.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;

use crate::error::DbError;
use crate::value::Value;

/// Every recognized operator token.
pub static OPERATORS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "=", "+", "-", "@", "-k", "--keys", "-e", "--edit", "-s", "--set", "-d", "--del", "-p",
        "--pop",
    ]
    .into_iter()
    .collect()
});

/// Operators that never mutate the tree.
pub static READ_OPS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["-e", "--edit", "-k", "--keys"].into_iter().collect());

/// Everything else. Queries containing one of these are never cached and
/// are the ones a node forwards to its peers.
pub static WRITE_OPS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    OPERATORS
        .iter()
        .filter(|op| !READ_OPS.contains(*op))
        .copied()
        .collect()
});

/// Does this argument vector contain any write operator?
pub fn contains_write_op(args: &[String]) -> bool {
    args.iter().any(|arg| WRITE_OPS.contains(arg.as_str()))
}

/// Symlink chains longer than this fail closed instead of recursing
/// forever through a reference cycle.
pub const MAX_REFERENCE_DEPTH: u32 = 32;

/// Transient per-query interpreter state.
#[derive(Debug, Default)]
pub struct QueryCtx {
    /// Prefix output lines with the joined path (`-c` / `--context`).
    pub add_context: bool,
    /// Indexing a missing key is an error instead of an implicit create
    /// (`-s` / `--strict` as a leading flag).
    pub strict: bool,
    /// A reference was followed while producing the output.
    pub dereferenced: bool,
    /// The tree changed and the snapshot on disk is stale.
    pub write_needed: bool,
    /// Rendered output lines.
    pub output: Vec<String>,
    depth: u32,
}

impl QueryCtx {
    pub fn new(add_context: bool, strict: bool) -> QueryCtx {
        QueryCtx {
            add_context,
            strict,
            ..QueryCtx::default()
        }
    }
}

/// Execute one argument vector against the tree rooted at `root`.
pub fn run(root: &mut Value, ctx: &mut QueryCtx, args: &[String]) -> Result<(), DbError> {
    walk(root, ctx, args)
}

static EMPTY: Value = Value::Empty;

fn joined(path: &[String]) -> String {
    path.join(" = ")
}

fn walk(root: &mut Value, ctx: &mut QueryCtx, args: &[String]) -> Result<(), DbError> {
    let mut cursor: Vec<String> = Vec::new();

    for (i, token) in args.iter().enumerate() {
        if OPERATORS.contains(token.as_str()) {
            return dispatch(root, ctx, &cursor, args, i);
        }

        // a stored reference reached mid-walk rebases the remaining
        // arguments onto the dereferenced path
        if let Value::String(stored) = resolve(root, &cursor) {
            if let Some(target) = stored.strip_prefix('!') {
                let target = Value::String(target.to_string());
                return dereference(root, ctx, &target, &args[i..]);
            }
        }

        let (key, key_is_reference) = match token.strip_prefix('!') {
            Some(stripped) => (stripped, true),
            None => (token.as_str(), false),
        };

        descend(root, ctx, &mut cursor, key)?;

        if key_is_reference {
            let target = resolve(root, &cursor).clone();
            return dereference(root, ctx, &target, &args[i + 1..]);
        }
    }

    let value = resolve(root, &cursor).clone();
    let context = joined(&cursor);
    display(root, ctx, &value, Some(&context))
}

/// Follow `target` (an already-stripped reference value) through the
/// root. A whole string matching a top-level key is one path segment;
/// anything else splits on spaces into a multi-segment path. Sequences
/// and mapping keys dereference element by element.
fn dereference(
    root: &mut Value,
    ctx: &mut QueryCtx,
    target: &Value,
    rest: &[String],
) -> Result<(), DbError> {
    ctx.dereferenced = true;
    if ctx.depth >= MAX_REFERENCE_DEPTH {
        return Err(DbError::usage("reference depth exceeded, is there a cycle?"));
    }
    ctx.depth += 1;
    let result = dereference_inner(root, ctx, target, rest);
    ctx.depth -= 1;
    result
}

fn dereference_inner(
    root: &mut Value,
    ctx: &mut QueryCtx,
    target: &Value,
    rest: &[String],
) -> Result<(), DbError> {
    match target {
        Value::String(name) => rebase(root, ctx, name, rest),
        Value::Seq(items) => {
            for item in items {
                match item {
                    Value::String(name) => rebase(root, ctx, name, rest)?,
                    _ => {
                        return Err(DbError::usage(
                            "cannot dereference a non-string sequence element",
                        ))
                    }
                }
            }
            Ok(())
        }
        Value::Map(map) => {
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                rebase(root, ctx, &key, rest)?;
            }
            Ok(())
        }
        Value::Empty => Ok(()),
    }
}

fn rebase(root: &mut Value, ctx: &mut QueryCtx, name: &str, rest: &[String]) -> Result<(), DbError> {
    let top_level = root.as_map().map_or(false, |map| map.contains_key(name));
    let mut args: Vec<String> = if top_level {
        vec![name.to_string()]
    } else {
        name.split(' ').map(str::to_string).collect()
    };
    args.extend(rest.iter().cloned());
    walk(root, ctx, &args)
}

/// Value lookup along a cursor path. Missing or mistyped segments read
/// as `Empty`.
fn resolve<'a>(root: &'a Value, path: &[String]) -> &'a Value {
    let mut node = root;
    for segment in path {
        node = match node {
            Value::Map(map) => map.get(segment).unwrap_or(&EMPTY),
            _ => &EMPTY,
        };
    }
    node
}

/// Mutable lookup along a cursor path, vivifying empties on the way.
/// Cursor prefixes always name mapping nodes: `descend` is the only
/// producer of cursor segments and it only pushes keys it inserted into
/// a mapping.
fn resolve_mut<'a>(root: &'a mut Value, path: &[String]) -> &'a mut Value {
    let mut node = root;
    for segment in path {
        if matches!(node, Value::Empty) {
            *node = Value::root();
        }
        node = match node {
            Value::Map(map) => map.entry(segment.clone()).or_insert(Value::Empty),
            _ => unreachable!("walk cursor prefixes always resolve to mappings"),
        };
    }
    node
}

/// The mapping an operator's left operand lives in.
fn map_at<'a>(root: &'a mut Value, path: &[String]) -> &'a mut BTreeMap<String, Value> {
    let node = resolve_mut(root, path);
    if matches!(node, Value::Empty) {
        *node = Value::root();
    }
    match node {
        Value::Map(map) => map,
        _ => unreachable!("operator parents always resolve to mappings"),
    }
}

/// One indexing step: move the cursor down through `key`, creating the
/// key when it is missing (or erroring in strict mode).
fn descend(
    root: &mut Value,
    ctx: &mut QueryCtx,
    cursor: &mut Vec<String>,
    key: &str,
) -> Result<(), DbError> {
    let through = cursor.last().cloned().unwrap_or_else(|| "root".to_string());
    let parent = resolve_mut(root, cursor);
    match parent {
        Value::Map(map) => {
            if !map.contains_key(key) {
                if ctx.strict {
                    return Err(DbError::StrictMiss(key.to_string()));
                }
                map.insert(key.to_string(), Value::Empty);
            }
            cursor.push(key.to_string());
            Ok(())
        }
        Value::Empty => {
            if ctx.strict {
                return Err(DbError::StrictMiss(key.to_string()));
            }
            let mut map = BTreeMap::new();
            map.insert(key.to_string(), Value::Empty);
            *parent = Value::Map(map);
            cursor.push(key.to_string());
            Ok(())
        }
        other => Err(DbError::usage(format!(
            "cannot index through non-mapping. {through} -> {key} -> ?, {through} :: {}",
            other.type_name()
        ))),
    }
}

fn dispatch(
    root: &mut Value,
    ctx: &mut QueryCtx,
    cursor: &[String],
    args: &[String],
    i: usize,
) -> Result<(), DbError> {
    let op = args[i].as_str();
    let right = &args[i + 1..];
    match op {
        "=" => assign(root, ctx, cursor, right),
        "+" => append(root, ctx, cursor, right),
        "-" => subtract(root, ctx, cursor, right),
        "@" => search(root, ctx, cursor, right),
        "-k" | "--keys" => keys_of(root, ctx, cursor),
        "-e" | "--edit" => {
            ctx.output.push(resolve(root, cursor).pretty());
            Ok(())
        }
        "-s" | "--set" => set_json(root, ctx, cursor, right),
        "-d" | "--del" => delete(root, ctx, cursor),
        "-p" | "--pop" => pop(root, ctx, cursor),
        _ => Err(DbError::usage(format!("unrecognized operator {op}"))),
    }
}

/// The parent path and final key an operator applies to.
fn split_target<'a>(cursor: &'a [String], op: &str) -> Result<(&'a [String], &'a String), DbError> {
    match cursor.split_last() {
        Some((left, parent)) => Ok((parent, left)),
        None => Err(DbError::usage(format!("{op} requires a key to operate on"))),
    }
}

/// A right-hand side of one token stores a string, several store a
/// sequence, none store nothing at all.
fn value_from_tokens(tokens: &[String]) -> Value {
    match tokens {
        [] => Value::Empty,
        [only] => Value::String(only.clone()),
        many => Value::Seq(many.iter().cloned().map(Value::String).collect()),
    }
}

fn assign(
    root: &mut Value,
    ctx: &mut QueryCtx,
    cursor: &[String],
    right: &[String],
) -> Result<(), DbError> {
    let (parent_path, left) = split_target(cursor, "=")?;
    let new = value_from_tokens(right);
    let parent = map_at(root, parent_path);
    // assigning an equal value is a no-op and does not dirty the tree
    if parent.get(left) != Some(&new) {
        parent.insert(left.clone(), new);
        ctx.write_needed = true;
    }
    Ok(())
}

fn append(
    root: &mut Value,
    ctx: &mut QueryCtx,
    cursor: &[String],
    right: &[String],
) -> Result<(), DbError> {
    let (parent_path, left) = split_target(cursor, "+")?;
    if right.is_empty() {
        return Err(DbError::usage("append requires at least one value"));
    }
    let parent = map_at(root, parent_path);
    let slot = parent.entry(left.clone()).or_insert(Value::Empty);
    if slot.is_empty() {
        *slot = value_from_tokens(right);
    } else if let Value::String(existing) = slot {
        let mut items = vec![Value::String(existing.clone())];
        items.extend(right.iter().cloned().map(Value::String));
        *slot = Value::Seq(items);
    } else if let Value::Seq(items) = slot {
        items.extend(right.iter().cloned().map(Value::String));
    } else {
        return Err(DbError::usage("cannot append to a mapping"));
    }
    ctx.write_needed = true;
    Ok(())
}

fn subtract(
    root: &mut Value,
    ctx: &mut QueryCtx,
    cursor: &[String],
    right: &[String],
) -> Result<(), DbError> {
    let (parent_path, left) = split_target(cursor, "-")?;
    if right.is_empty() {
        return Err(DbError::usage("remove requires at least one value"));
    }

    enum Outcome {
        Replace(Value),
        DeleteKey,
    }

    let parent = map_at(root, parent_path);
    let outcome = match parent.get(left).unwrap_or(&EMPTY) {
        Value::Seq(items) => {
            // all removals are validated before any of them apply
            let mut remaining = items.clone();
            for needle in right {
                let position = remaining
                    .iter()
                    .position(|item| matches!(item, Value::String(s) if s == needle));
                match position {
                    Some(p) => {
                        remaining.remove(p);
                    }
                    None => return Err(DbError::usage(format!("{needle} not in {left}"))),
                }
            }
            if remaining.len() == 1 {
                Outcome::Replace(remaining.pop().unwrap_or(Value::Empty))
            } else {
                Outcome::Replace(Value::Seq(remaining))
            }
        }
        Value::Map(map) => {
            let mut remaining = map.clone();
            for needle in right {
                if remaining.remove(needle.as_str()).is_none() {
                    return Err(DbError::usage(format!("{needle} not in {left}")));
                }
            }
            Outcome::Replace(Value::Map(remaining))
        }
        Value::String(s) => {
            if right.len() == 1 && right[0] == *s {
                Outcome::DeleteKey
            } else {
                return Err(DbError::usage(format!(
                    "cannot subtract {} from {left}",
                    right.join(" ")
                )));
            }
        }
        Value::Empty => return Err(DbError::usage(format!("{} not in {left}", right[0]))),
    };

    match outcome {
        Outcome::Replace(value) => {
            parent.insert(left.clone(), value);
        }
        Outcome::DeleteKey => {
            parent.remove(left);
        }
    }
    ctx.write_needed = true;
    Ok(())
}

fn search(
    root: &mut Value,
    ctx: &mut QueryCtx,
    cursor: &[String],
    right: &[String],
) -> Result<(), DbError> {
    let needle = right
        .first()
        .ok_or_else(|| DbError::usage("search requires a value"))?;
    let mut hits = Vec::new();
    let mut path = cursor.to_vec();
    collect_matches(root, needle, &mut path, &mut hits);
    for (context, key) in hits {
        let value = Value::String(key);
        let context = joined(&context);
        display(root, ctx, &value, Some(&context))?;
    }
    Ok(())
}

/// Search always traverses from the root; any tokens before `@` only
/// seed the displayed context. Sequence elements match by equality and
/// report the sequence's own key; sequence contents are not descended.
fn collect_matches(
    value: &Value,
    needle: &str,
    path: &mut Vec<String>,
    hits: &mut Vec<(Vec<String>, String)>,
) {
    match value {
        Value::Map(map) => {
            for (key, child) in map {
                match child {
                    Value::String(s) if s == needle => hits.push((path.clone(), key.clone())),
                    Value::Map(_) | Value::Seq(_) => {
                        path.push(key.clone());
                        collect_matches(child, needle, path, hits);
                        path.pop();
                    }
                    _ => {}
                }
            }
        }
        Value::Seq(items) => {
            if let Some((list_key, ancestors)) = path.split_last() {
                for item in items {
                    if matches!(item, Value::String(s) if s == needle) {
                        hits.push((ancestors.to_vec(), list_key.clone()));
                    }
                }
            }
        }
        _ => {}
    }
}

fn keys_of(root: &mut Value, ctx: &mut QueryCtx, cursor: &[String]) -> Result<(), DbError> {
    match resolve(root, cursor) {
        Value::Map(map) => {
            for key in map.keys() {
                ctx.output.push(key.clone());
            }
            Ok(())
        }
        // an absent value reads as an empty mapping with no keys
        Value::Empty => Ok(()),
        other => {
            let name = cursor.last().map(String::as_str).unwrap_or("root");
            Err(DbError::usage(format!(
                "cannot list keys of non-mapping. {name} :: {}",
                other.type_name()
            )))
        }
    }
}

fn set_json(
    root: &mut Value,
    ctx: &mut QueryCtx,
    cursor: &[String],
    right: &[String],
) -> Result<(), DbError> {
    let raw = right
        .first()
        .ok_or_else(|| DbError::usage("set requires a JSON value"))?;
    let parsed: serde_json::Value =
        serde_json::from_str(raw).map_err(|_| DbError::usage("malformed json"))?;
    let new = Value::from_json(parsed);
    match cursor.split_last() {
        None => {
            if !matches!(new, Value::Map(_)) {
                return Err(DbError::usage("top-level value must be a mapping"));
            }
            if *root != new {
                *root = new;
                ctx.write_needed = true;
            }
            Ok(())
        }
        Some((left, parent_path)) => {
            let parent = map_at(root, parent_path);
            if parent.get(left) != Some(&new) {
                parent.insert(left.clone(), new);
                ctx.write_needed = true;
            }
            Ok(())
        }
    }
}

fn delete(root: &mut Value, ctx: &mut QueryCtx, cursor: &[String]) -> Result<(), DbError> {
    let (parent_path, left) = split_target(cursor, "--del")?;
    let parent = map_at(root, parent_path);
    parent.remove(left);
    ctx.write_needed = true;
    Ok(())
}

fn pop(root: &mut Value, ctx: &mut QueryCtx, cursor: &[String]) -> Result<(), DbError> {
    let (parent_path, left) = split_target(cursor, "--pop")?;

    // render first, then remove: a popped symlink dereferences against
    // the tree as it was when the value was still present
    let (value, is_seq) = {
        let parent = map_at(root, parent_path);
        match parent.get(left) {
            Some(Value::Seq(items)) => (items.last().cloned(), true),
            other => (other.cloned(), false),
        }
    };
    if let Some(value) = &value {
        display(root, ctx, value, None)?;
    }

    let parent = map_at(root, parent_path);
    if is_seq {
        if let Some(Value::Seq(items)) = parent.get_mut(left) {
            items.pop();
        }
    } else {
        parent.remove(left);
    }
    ctx.write_needed = true;
    Ok(())
}

/// Emit a value into the query output. Strings and sequence elements
/// beginning with `!` are transparently dereferenced; mappings render as
/// one pretty-printed entry; with context enabled each line is prefixed
/// by the joined path.
fn display(
    root: &mut Value,
    ctx: &mut QueryCtx,
    value: &Value,
    context: Option<&str>,
) -> Result<(), DbError> {
    if value.is_empty() {
        return Ok(());
    }
    let prefix = match context {
        Some(c) if ctx.add_context && !c.is_empty() => format!("{c} = "),
        _ => String::new(),
    };
    match value {
        Value::String(s) => {
            if let Some(target) = s.strip_prefix('!') {
                dereference(root, ctx, &Value::String(target.to_string()), &[])?;
            } else {
                ctx.output.push(format!("{prefix}{s}"));
            }
        }
        Value::Seq(items) => {
            for item in items {
                match item {
                    Value::String(s) => {
                        if let Some(target) = s.strip_prefix('!') {
                            dereference(root, ctx, &Value::String(target.to_string()), &[])?;
                        } else {
                            ctx.output.push(format!("{prefix}{s}"));
                        }
                    }
                    other if other.is_empty() => {}
                    other => ctx.output.push(format!("{prefix}{}", other.compact())),
                }
            }
        }
        Value::Map(_) => ctx.output.push(format!("{prefix}{}", value.pretty())),
        Value::Empty => {}
    }
    Ok(())
}
