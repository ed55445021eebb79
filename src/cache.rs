//! Prepared-statement caching.
//!
//! Three strategies share one contract: a cache key maps to a stable
//! server-side statement name, and a key is parsed at most once while
//! it stays cached. The executor drives the wire traffic; the cache
//! owns the names and the eviction policy. Mutations are serialised by
//! the connection's exclusive borrow.
use std::collections::{HashMap, VecDeque};

use crate::{common::ByteStr, postgres::Oid, statement::StatementName};

/// Identity of a prepared statement: the sql text and the bound
/// parameter-type vector, compared element-wise.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct CacheKey {
    pub sql: ByteStr,
    pub types: Vec<Oid>,
}

impl CacheKey {
    pub fn new(sql: ByteStr, types: Vec<Oid>) -> Self {
        Self { sql, types }
    }
}

/// What the executor must do to obtain a statement name for a key.
#[derive(Debug)]
pub enum StatementPlan {
    /// The statement is already prepared under this name.
    CacheHit(StatementName),
    /// A `Parse` is required; when `evict` is set, the evicted
    /// statement must be closed first.
    Parse {
        name: StatementName,
        evict: Option<StatementName>,
    },
}

/// A prepared-statement cache.
#[derive(Debug)]
pub enum StatementCache {
    /// Every call parses the unnamed statement; nothing is retained.
    Disabled,
    /// Statements are cached forever.
    Unbounded {
        map: HashMap<CacheKey, StatementName>,
        counter: u32,
    },
    /// Access-ordered cache bounded to `limit` entries; the least
    /// recently used entry is evicted (and closed) to make room.
    Bounded {
        entries: VecDeque<(CacheKey, StatementName)>,
        limit: usize,
        counter: u32,
    },
}

impl StatementCache {
    pub fn disabled() -> Self {
        Self::Disabled
    }

    pub fn unbounded() -> Self {
        Self::Unbounded { map: HashMap::new(), counter: 0 }
    }

    /// # Panics
    ///
    /// The limit must be greater than zero.
    pub fn bounded(limit: usize) -> Self {
        assert!(limit > 0, "statement cache limit must be greater than zero");
        Self::Bounded { entries: VecDeque::new(), limit, counter: 0 }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Unbounded { map, .. } => map.len(),
            Self::Bounded { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a key to a plan.
    ///
    /// A bounded cache at capacity removes its eldest entry here, before
    /// the replacement is parsed; the eviction stands even if that parse
    /// later fails.
    pub fn plan(&mut self, key: &CacheKey) -> StatementPlan {
        match self {
            Self::Disabled => StatementPlan::Parse {
                name: StatementName::unnamed(),
                evict: None,
            },
            Self::Unbounded { map, counter } => match map.get(key) {
                Some(name) => StatementPlan::CacheHit(name.clone()),
                None => {
                    let name = StatementName::numbered(*counter);
                    *counter += 1;
                    StatementPlan::Parse { name, evict: None }
                },
            },
            Self::Bounded { entries, limit, counter } => {
                if let Some(at) = entries.iter().position(|(k, _)| k == key) {
                    // promote on read
                    let entry = entries.remove(at).unwrap();
                    let name = entry.1.clone();
                    entries.push_back(entry);
                    return StatementPlan::CacheHit(name);
                }

                let evict = (entries.len() >= *limit)
                    .then(|| entries.pop_front())
                    .flatten()
                    .map(|(_, name)| name);

                let name = StatementName::numbered(*counter);
                *counter += 1;
                StatementPlan::Parse { name, evict }
            },
        }
    }

    /// Record a completed parse so later calls observe the same name.
    pub fn parsed(&mut self, key: CacheKey, name: StatementName) {
        if name.is_unnamed() {
            return;
        }
        match self {
            Self::Disabled => { },
            Self::Unbounded { map, .. } => {
                map.insert(key, name);
            },
            Self::Bounded { entries, limit, .. } => {
                debug_assert!(entries.len() < *limit);
                entries.push_back((key, name));
            },
        }
    }
}
