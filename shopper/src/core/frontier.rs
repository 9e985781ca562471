//! Exploration state for one link discovery run.
//!
//! Invariants:
//! - a URL enters `browsed` at most once, before it is navigated to;
//! - a URL is only queued for browsing if it is neither browsed nor queued;
//! - `to_add` never shrinks and holds no duplicates;
//! - every candidate has exactly one source entry, from its first discovery;
//! - a stalled URL is re-queued at most once per run.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frontier {
    browsed: BTreeSet<String>,
    to_browse: Vec<String>,
    to_add: Vec<String>,
    sources: BTreeMap<String, String>,
    tried_twice: BTreeSet<String>,
}

impl Frontier {
    /// Start a run at `start`, which counts as already browsed.
    pub fn new(start: &str) -> Self {
        Self {
            browsed: BTreeSet::from([start.to_string()]),
            to_browse: Vec::new(),
            to_add: Vec::new(),
            sources: BTreeMap::new(),
            tried_twice: BTreeSet::new(),
        }
    }

    /// Record a product candidate found on `found_on`. Returns false for repeats.
    pub fn offer_candidate(&mut self, url: &str, found_on: &str) -> bool {
        if self.to_add.iter().any(|known| known == url) {
            return false;
        }
        self.to_add.push(url.to_string());
        self.sources
            .entry(url.to_string())
            .or_insert_with(|| found_on.to_string());
        true
    }

    /// Queue a page for exploration. Returns false if it was browsed or is queued.
    pub fn offer_browse(&mut self, url: &str) -> bool {
        if self.browsed.contains(url) || self.to_browse.iter().any(|queued| queued == url) {
            return false;
        }
        self.to_browse.push(url.to_string());
        true
    }

    /// Re-queue a page whose hop stalled, once per URL per run.
    pub fn requeue_stalled(&mut self, url: &str) -> bool {
        if !self.tried_twice.insert(url.to_string()) {
            return false;
        }
        if !self.to_browse.iter().any(|queued| queued == url) {
            self.to_browse.push(url.to_string());
        }
        true
    }

    /// Remove and return a uniformly random queued URL.
    pub fn pick_next<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<String> {
        if self.to_browse.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..self.to_browse.len());
        Some(self.to_browse.swap_remove(index))
    }

    /// Record that `url` is about to be visited, dropping any queued copy.
    /// Returns false if it already was.
    pub fn mark_browsed(&mut self, url: &str) -> bool {
        self.to_browse.retain(|queued| queued != url);
        self.browsed.insert(url.to_string())
    }

    pub fn candidates(&self) -> &[String] {
        &self.to_add
    }

    pub fn candidate_count(&self) -> usize {
        self.to_add.len()
    }

    pub fn to_browse(&self) -> &[String] {
        &self.to_browse
    }

    pub fn browsed(&self) -> &BTreeSet<String> {
        &self.browsed
    }

    pub fn sources(&self) -> &BTreeMap<String, String> {
        &self.sources
    }

    pub fn into_parts(self) -> FrontierParts {
        FrontierParts {
            candidates: self.to_add,
            sources: self.sources,
            leftover: self.to_browse,
            visited: self.browsed,
        }
    }
}

/// Frontier contents handed back once a run finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierParts {
    pub candidates: Vec<String>,
    pub sources: BTreeMap<String, String>,
    pub leftover: Vec<String>,
    pub visited: BTreeSet<String>,
}
