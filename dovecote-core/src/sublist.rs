//! Subject-match index.
//!
//! Maps subscription patterns to handles and resolves a published literal
//! subject to the set of interested subscriptions in time proportional to
//! the subject depth, not the index size.
//!
//! Design:
//! - Token trie: each level keeps a map of literal children plus dedicated
//!   `*` and `>` child slots.
//! - Terminal nodes hold plain subscriptions and queue groups separately,
//!   each in insertion order.
//! - Bounded result cache keyed by literal subject. Any structural
//!   mutation clears it wholesale; subscription churn is orders of
//!   magnitude rarer than publishes, so coarse invalidation beats
//!   per-entry bookkeeping. On overflow a quarter of the entries are
//!   evicted.
//! - Generic over the subscription type: handles are `Arc<T>` and removal
//!   compares identity, never value, so two subscriptions with identical
//!   fields stay distinct.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use hashbrown::HashMap;

use crate::error::{DovecoteError, Result};
use crate::subject;

/// Maximum number of cached match results before eviction kicks in.
const CACHE_MAX: usize = 1024;

/// Result of matching one literal subject.
///
/// Plain subscriptions come first, in insertion order. Queue groups are
/// keyed by group name; iteration order across groups is unspecified, but
/// members within a group keep insertion order.
#[derive(Debug)]
pub struct MatchResult<T> {
    pub psubs: Vec<Arc<T>>,
    pub qsubs: HashMap<Bytes, Vec<Arc<T>>>,
}

impl<T> MatchResult<T> {
    fn empty() -> Self {
        Self {
            psubs: Vec::new(),
            qsubs: HashMap::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.psubs.is_empty() && self.qsubs.is_empty()
    }

    /// Total number of subscriptions across plain and queue lists.
    #[must_use]
    pub fn len(&self) -> usize {
        self.psubs.len() + self.qsubs.values().map(Vec::len).sum::<usize>()
    }
}

#[derive(Debug)]
struct Node<T> {
    next: Option<Box<Level<T>>>,
    psubs: Vec<Arc<T>>,
    qsubs: HashMap<Bytes, Vec<Arc<T>>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            next: None,
            psubs: Vec::new(),
            qsubs: HashMap::new(),
        }
    }

    /// True when the node holds no subscriptions and no subtree.
    fn is_prunable(&self) -> bool {
        self.psubs.is_empty() && self.qsubs.is_empty() && self.next.is_none()
    }
}

#[derive(Debug)]
struct Level<T> {
    nodes: HashMap<Bytes, Node<T>>,
    pwc: Option<Box<Node<T>>>,
    fwc: Option<Box<Node<T>>>,
}

impl<T> Level<T> {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            pwc: None,
            fwc: None,
        }
    }
}

struct Inner<T> {
    root: Level<T>,
    cache: HashMap<Bytes, Arc<MatchResult<T>>>,
    count: usize,
}

/// Counters the index keeps while running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SublistStats {
    pub inserts: u64,
    pub removes: u64,
    pub matches: u64,
    pub cache_hits: u64,
}

/// The subject-match index shared by all sessions.
///
/// The trie and its cache sit behind one internal lock; all operations are
/// non-blocking beyond that lock.
pub struct Sublist<T> {
    inner: Mutex<Inner<T>>,
    inserts: AtomicU64,
    removes: AtomicU64,
    matches: AtomicU64,
    cache_hits: AtomicU64,
}

impl<T> Default for Sublist<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Sublist<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                root: Level::new(),
                cache: HashMap::new(),
                count: 0,
            }),
            inserts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            matches: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("sublist lock poisoned")
    }

    /// Register `sub` under `pattern`, optionally inside a queue group.
    ///
    /// Rejects patterns with empty tokens or a non-terminal `>`.
    pub fn insert(&self, pattern: &[u8], queue: Option<&[u8]>, sub: Arc<T>) -> Result<()> {
        if !subject::is_valid_subject(pattern) {
            return Err(DovecoteError::InvalidSubject);
        }
        let toks = subject::tokenize(pattern);
        let (last, prefix) = toks.split_last().expect("validated subject has tokens");

        let mut inner = self.lock();
        let mut level = &mut inner.root;
        for tok in prefix {
            let node = node_entry(level, tok);
            level = node.next.get_or_insert_with(|| Box::new(Level::new()));
        }
        let node = node_entry(level, last);
        match queue {
            None => node.psubs.push(sub),
            Some(q) => node
                .qsubs
                .entry(Bytes::copy_from_slice(q))
                .or_default()
                .push(sub),
        }
        inner.count += 1;
        inner.cache.clear();
        self.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove the entry whose identity equals `sub` from `pattern`.
    ///
    /// Returns whether anything was removed. Empty terminal nodes are
    /// pruned; interior nodes are left in place, trading bounded memory
    /// for cheap churn.
    pub fn remove(&self, pattern: &[u8], queue: Option<&[u8]>, sub: &Arc<T>) -> bool {
        if !subject::is_valid_subject(pattern) {
            return false;
        }
        let toks = subject::tokenize(pattern);
        let mut inner = self.lock();
        let removed = remove_level(&mut inner.root, &toks, queue, sub);
        if removed {
            inner.count -= 1;
            inner.cache.clear();
            self.removes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Resolve a literal subject to its interested subscriptions.
    ///
    /// Invalid literals (wildcards, empty tokens) match nothing. Results
    /// are cached under the subject; cache hits are constant-time.
    pub fn match_subject(&self, literal: &[u8]) -> Arc<MatchResult<T>> {
        self.matches.fetch_add(1, Ordering::Relaxed);
        if !subject::is_valid_literal_subject(literal) {
            return Arc::new(MatchResult::empty());
        }
        let toks = subject::tokenize(literal);

        let mut inner = self.lock();
        if let Some(cached) = inner.cache.get(literal) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return cached.clone();
        }

        let mut result = MatchResult::empty();
        match_level(Some(&inner.root), &toks, &mut result);
        let result = Arc::new(result);

        inner
            .cache
            .insert(Bytes::copy_from_slice(literal), result.clone());
        if inner.cache.len() > CACHE_MAX {
            let evict: Vec<Bytes> = inner.cache.keys().take(CACHE_MAX / 4).cloned().collect();
            for key in &evict {
                inner.cache.remove(key);
            }
        }
        result
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().count
    }

    /// Number of cached match results.
    #[must_use]
    pub fn cache_entries(&self) -> usize {
        self.lock().cache.len()
    }

    /// Snapshot of the running counters.
    #[must_use]
    pub fn stats(&self) -> SublistStats {
        SublistStats {
            inserts: self.inserts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }
}

/// Resolve the child node for `tok` at `level`, creating it if missing.
fn node_entry<'a, T>(level: &'a mut Level<T>, tok: &[u8]) -> &'a mut Node<T> {
    if subject::is_pwc_token(tok) {
        level.pwc.get_or_insert_with(|| Box::new(Node::new()))
    } else if subject::is_fwc_token(tok) {
        level.fwc.get_or_insert_with(|| Box::new(Node::new()))
    } else {
        level
            .nodes
            .entry(Bytes::copy_from_slice(tok))
            .or_insert_with(Node::new)
    }
}

fn add_node_to_results<T>(node: &Node<T>, out: &mut MatchResult<T>) {
    out.psubs.extend(node.psubs.iter().cloned());
    for (queue, subs) in &node.qsubs {
        out.qsubs
            .entry(queue.clone())
            .or_default()
            .extend(subs.iter().cloned());
    }
}

/// Recursive descent over the trie.
///
/// At each level the `>` child matches everything remaining, the `*` child
/// is expanded against the rest of the tokens, and the literal child is
/// followed. When the tokens run out, the node reached by literal descent
/// and the `*` node positioned on the final token both terminate.
fn match_level<'a, T>(mut level: Option<&'a Level<T>>, toks: &[&[u8]], out: &mut MatchResult<T>) {
    let mut pwc: Option<&'a Node<T>> = None;
    let mut n: Option<&'a Node<T>> = None;

    for (i, tok) in toks.iter().enumerate() {
        let Some(l) = level else { return };
        if let Some(fwc) = l.fwc.as_deref() {
            add_node_to_results(fwc, out);
        }
        pwc = l.pwc.as_deref();
        if let Some(p) = pwc {
            match_level(p.next.as_deref(), &toks[i + 1..], out);
        }
        n = l.nodes.get(*tok);
        level = n.and_then(|node| node.next.as_deref());
    }
    if let Some(node) = n {
        add_node_to_results(node, out);
    }
    if let Some(p) = pwc {
        add_node_to_results(p, out);
    }
}

fn remove_level<T>(level: &mut Level<T>, toks: &[&[u8]], queue: Option<&[u8]>, sub: &Arc<T>) -> bool {
    let Some((tok, rest)) = toks.split_first() else {
        return false;
    };

    if subject::is_pwc_token(tok) {
        let Some(node) = level.pwc.as_deref_mut() else {
            return false;
        };
        let removed = remove_in_node(node, rest, queue, sub);
        if removed && rest.is_empty() && node.is_prunable() {
            level.pwc = None;
        }
        removed
    } else if subject::is_fwc_token(tok) {
        let Some(node) = level.fwc.as_deref_mut() else {
            return false;
        };
        let removed = remove_in_node(node, rest, queue, sub);
        if removed && rest.is_empty() && node.is_prunable() {
            level.fwc = None;
        }
        removed
    } else {
        let Some(node) = level.nodes.get_mut(*tok) else {
            return false;
        };
        let removed = remove_in_node(node, rest, queue, sub);
        if removed && rest.is_empty() && node.is_prunable() {
            level.nodes.remove(*tok);
        }
        removed
    }
}

fn remove_in_node<T>(node: &mut Node<T>, rest: &[&[u8]], queue: Option<&[u8]>, sub: &Arc<T>) -> bool {
    if rest.is_empty() {
        return remove_sub_from_node(node, queue, sub);
    }
    match node.next.as_deref_mut() {
        Some(level) => remove_level(level, rest, queue, sub),
        None => false,
    }
}

/// Remove the first entry with pointer identity equal to `sub`.
fn remove_sub_from_node<T>(node: &mut Node<T>, queue: Option<&[u8]>, sub: &Arc<T>) -> bool {
    match queue {
        None => match node.psubs.iter().position(|s| Arc::ptr_eq(s, sub)) {
            Some(pos) => {
                node.psubs.remove(pos);
                true
            }
            None => false,
        },
        Some(q) => {
            let Some(list) = node.qsubs.get_mut(q) else {
                return false;
            };
            let Some(pos) = list.iter().position(|s| Arc::ptr_eq(s, sub)) else {
                return false;
            };
            list.remove(pos);
            if list.is_empty() {
                node.qsubs.remove(q);
            }
            true
        }
    }
}
