//! In-process search backend.
//!
//! Used when no Elasticsearch nodes are configured and throughout the test
//! suites. Alias swaps happen under a single lock, so they are atomic the same
//! way an `_aliases` request is.

use async_trait::async_trait;
use parking_lot::Mutex;
use processor_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::backend::{CopyMode, SearchBackend};
use crate::index::{parse_index_time, IndexMeta, SearchIndex};

/// Backend operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ListIndices,
    AliasTargets,
    CreateIndex,
    UpdateMeta,
    CopyDocuments,
    Count,
    SwapAlias,
    DeleteIndex,
    IndexDocument,
    Ping,
}

#[derive(Debug)]
struct StoredIndex {
    meta: IndexMeta,
    documents: BTreeMap<String, Value>,
}

#[derive(Debug)]
struct InjectedFailure {
    point: FailPoint,
    /// Calls allowed through before the failure fires.
    skip: usize,
    status: u16,
}

#[derive(Debug, Default)]
struct State {
    indices: BTreeMap<String, StoredIndex>,
    aliases: HashMap<String, Vec<String>>,
    alias_history: HashMap<String, Vec<Vec<String>>>,
    failures: Vec<InjectedFailure>,
}

impl State {
    fn check(&mut self, point: FailPoint) -> Result<()> {
        let Some(pos) = self.failures.iter().position(|f| f.point == point) else {
            return Ok(());
        };

        if self.failures[pos].skip > 0 {
            self.failures[pos].skip -= 1;
            return Ok(());
        }

        let failure = self.failures.remove(pos);
        Err(Error::search_status(
            failure.status,
            format!("injected failure at {:?}", point),
        ))
    }

    /// Concrete indices behind a name that is either an index or an alias.
    fn resolve(&self, name: &str) -> Result<Vec<String>> {
        if self.indices.contains_key(name) {
            return Ok(vec![name.to_string()]);
        }

        let targets: Vec<String> = self
            .aliases
            .get(name)
            .map(|targets| {
                targets
                    .iter()
                    .filter(|t| self.indices.contains_key(*t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if targets.is_empty() {
            return Err(not_found(name));
        }
        Ok(targets)
    }

    fn index_mut(&mut self, name: &str) -> Result<&mut StoredIndex> {
        self.indices.get_mut(name).ok_or_else(|| not_found(name))
    }
}

fn not_found(name: &str) -> Error {
    Error::search_status(404, format!("no such index [{}]", name))
}

/// Search backend held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an index holding `documents` generated documents.
    pub fn insert_index(&self, name: &str, meta: IndexMeta, documents: u64) {
        let documents = (0..documents)
            .map(|i| (format!("doc-{}", i), json!({ "seq": i })))
            .collect();
        self.state
            .lock()
            .indices
            .insert(name.to_string(), StoredIndex { meta, documents });
    }

    /// Points `alias` at `targets` without checking they exist.
    pub fn set_alias(&self, alias: &str, targets: &[&str]) {
        self.state.lock().aliases.insert(
            alias.to_string(),
            targets.iter().map(|t| t.to_string()).collect(),
        );
    }

    /// Every target set `swap_alias` produced for `alias`, oldest first.
    pub fn alias_history(&self, alias: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .alias_history
            .get(alias)
            .cloned()
            .unwrap_or_default()
    }

    pub fn index_meta(&self, name: &str) -> Option<IndexMeta> {
        self.state.lock().indices.get(name).map(|i| i.meta.clone())
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state.lock().indices.keys().cloned().collect()
    }

    pub fn document_count(&self, name: &str) -> Option<u64> {
        self.state
            .lock()
            .indices
            .get(name)
            .map(|i| i.documents.len() as u64)
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        self.state
            .lock()
            .indices
            .get(index)
            .and_then(|i| i.documents.get(id).cloned())
    }

    /// Fails the next call at `point` with a 503.
    pub fn fail_next(&self, point: FailPoint) {
        self.fail_with(point, 0, 503);
    }

    /// Lets `skip` calls at `point` succeed, then fails one with `status`.
    pub fn fail_with(&self, point: FailPoint, skip: usize, status: u16) {
        self.state
            .lock()
            .failures
            .push(InjectedFailure { point, skip, status });
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn list_indices(&self, alias: &str) -> Result<Vec<SearchIndex>> {
        let mut state = self.state.lock();
        state.check(FailPoint::ListIndices)?;

        Ok(state
            .indices
            .iter()
            .filter(|(name, _)| parse_index_time(alias, name).is_some())
            .map(|(name, index)| SearchIndex {
                name: name.clone(),
                alias: alias.to_string(),
                meta: index.meta.clone(),
                document_count: index.documents.len() as u64,
            })
            .collect())
    }

    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.check(FailPoint::AliasTargets)?;

        let mut targets = state.aliases.get(alias).cloned().unwrap_or_default();
        targets.sort();
        Ok(targets)
    }

    async fn create_index(&self, name: &str, meta: &IndexMeta) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateIndex)?;

        if state.indices.contains_key(name) || state.aliases.contains_key(name) {
            return Err(Error::search_status(
                400,
                format!("resource_already_exists_exception [{}]", name),
            ));
        }

        state.indices.insert(
            name.to_string(),
            StoredIndex {
                meta: meta.clone(),
                documents: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn update_meta(&self, name: &str, meta: &IndexMeta) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::UpdateMeta)?;

        state.index_mut(name)?.meta = meta.clone();
        Ok(())
    }

    async fn copy_documents(&self, source: &str, dest: &str, mode: CopyMode) -> Result<u64> {
        let mut state = self.state.lock();
        state.check(FailPoint::CopyDocuments)?;

        let sources = state.resolve(source)?;
        if !state.indices.contains_key(dest) {
            return Err(not_found(dest));
        }

        let documents: Vec<(String, Value)> = sources
            .iter()
            .filter(|s| s.as_str() != dest)
            .filter_map(|s| state.indices.get(s))
            .flat_map(|i| i.documents.iter().map(|(id, doc)| (id.clone(), doc.clone())))
            .collect();

        let target = state.index_mut(dest)?;
        let mut written = 0;
        for (id, doc) in documents {
            if mode == CopyMode::CreateOnly && target.documents.contains_key(&id) {
                continue;
            }
            target.documents.insert(id, doc);
            written += 1;
        }
        Ok(written)
    }

    async fn count(&self, index: &str) -> Result<u64> {
        let mut state = self.state.lock();
        state.check(FailPoint::Count)?;

        let names = state.resolve(index)?;
        Ok(names
            .iter()
            .filter_map(|n| state.indices.get(n))
            .map(|i| i.documents.len() as u64)
            .sum())
    }

    async fn swap_alias(&self, alias: &str, remove: &[String], add: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::SwapAlias)?;

        if !state.indices.contains_key(add) {
            return Err(not_found(add));
        }

        let mut targets = state.aliases.get(alias).cloned().unwrap_or_default();
        targets.retain(|t| !remove.contains(t));
        if !targets.iter().any(|t| t == add) {
            targets.push(add.to_string());
        }
        targets.sort();

        state.aliases.insert(alias.to_string(), targets.clone());
        state
            .alias_history
            .entry(alias.to_string())
            .or_default()
            .push(targets);
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::DeleteIndex)?;

        if state.indices.remove(name).is_some() {
            for targets in state.aliases.values_mut() {
                targets.retain(|t| t != name);
            }
        }
        Ok(())
    }

    async fn index_document(&self, alias: &str, id: &str, document: &Value) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::IndexDocument)?;

        let targets = state.resolve(alias)?;
        if targets.len() > 1 {
            return Err(Error::search_status(
                400,
                format!("no write index is defined for alias [{}]", alias),
            ));
        }

        state
            .index_mut(&targets[0])?
            .documents
            .insert(id.to_string(), document.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.state.lock().check(FailPoint::Ping)
    }
}
