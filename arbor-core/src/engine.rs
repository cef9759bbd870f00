//! Database Engine
//!
//! [`Db`] owns the in-memory tree and runs one query at a time; callers
//! serialize access with a process-wide lock. [`ServerDb`] layers the
//! query cache on top and produces the fully rendered reply string the
//! wire protocol sends back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::DbError;
use crate::interpret::{self, contains_write_op, QueryCtx};
use crate::persist;
use crate::value::Value;

/// Leading flags consumed before the argument vector is interpreted.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryFlags {
    pub add_context: bool,
    pub strict: bool,
}

/// The core tree store.
pub struct Db {
    root: Value,
    path: PathBuf,
    dirty: bool,
}

impl Db {
    /// Load the tree from `path`: zlib-compressed JSON, plain JSON, or a
    /// missing file (empty tree). Anything else is a fatal storage error.
    pub fn open(path: impl AsRef<Path>) -> Result<Db, DbError> {
        let path = path.as_ref().to_path_buf();
        let root = persist::load(&path)?;
        Ok(Db {
            root,
            path,
            dirty: false,
        })
    }

    /// An empty tree that still remembers where it would persist to.
    pub fn empty(path: impl AsRef<Path>) -> Db {
        Db {
            root: Value::root(),
            path: path.as_ref().to_path_buf(),
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Run one argument vector. The caller owns the context and decides
    /// what to do with the rendered output and flags afterwards.
    pub fn execute(&mut self, ctx: &mut QueryCtx, args: &[String]) -> Result<(), DbError> {
        interpret::run(&mut self.root, ctx, args)
    }

    /// Post-query cleanup: normalize the whole tree and queue a disk
    /// write when the query mutated it.
    pub fn post_action(&mut self, wrote: bool) {
        self.root.normalize();
        if wrote {
            self.dirty = true;
        }
    }

    /// Hand the pending-write flag to the persister, clearing it.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Snapshot bytes for the persister: compact JSON, zlib-compressed.
    pub fn snapshot(&self) -> Vec<u8> {
        persist::encode(&self.root)
    }
}

/// The engine a server hands queries to: a [`Db`] plus the memo of
/// rendered replies for side-effect-free reads.
pub struct ServerDb {
    db: Db,
    cache: HashMap<Vec<String>, String>,
}

impl ServerDb {
    pub fn open(path: impl AsRef<Path>) -> Result<ServerDb, DbError> {
        Ok(ServerDb::from_db(Db::open(path)?))
    }

    pub fn from_db(db: Db) -> ServerDb {
        ServerDb {
            db,
            cache: HashMap::new(),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut Db {
        &mut self.db
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// The node identity stored under `internal/local/identity`, when
    /// one exists. The server log line shows its first four characters.
    pub fn identity(&self) -> Option<String> {
        let mut node = self.db.root();
        for segment in ["internal", "local", "identity"] {
            node = node.as_map()?.get(segment)?;
        }
        match node {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Run one query and produce the rendered reply string: output lines
    /// joined by `\n` with a trailing `\n`, an empty result as a single
    /// `\n`, and errors as one `error: …` line.
    ///
    /// A cache hit serves the previously rendered reply unchanged; the
    /// post-query step (normalize, reset) still runs. A query is cached
    /// only when it added no context, followed no reference and contains
    /// no write operator. Any completed write clears the whole cache.
    pub fn query(&mut self, flags: QueryFlags, args: &[String]) -> String {
        if let Some(hit) = self.cache.get(args) {
            let reply = hit.clone();
            self.db.post_action(false);
            return reply;
        }

        let mut ctx = QueryCtx::new(flags.add_context, flags.strict);
        let result = self.db.execute(&mut ctx, args);
        let reply = match &result {
            Ok(()) => render(&ctx.output),
            Err(err) => err.reply_line(),
        };

        self.db.post_action(ctx.write_needed);
        if ctx.write_needed {
            self.cache.clear();
        } else if result.is_ok()
            && !ctx.add_context
            && !ctx.dereferenced
            && !contains_write_op(args)
        {
            self.cache.insert(args.to_vec(), reply.clone());
        }
        reply
    }

    /// Convenience for callers holding string slices (tests, tools).
    pub fn query_args(&mut self, flags: QueryFlags, args: &[&str]) -> String {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.query(flags, &args)
    }
}

fn render(lines: &[String]) -> String {
    if lines.is_empty() {
        "\n".to_string()
    } else {
        let mut reply = lines.join("\n");
        reply.push('\n');
        reply
    }
}
