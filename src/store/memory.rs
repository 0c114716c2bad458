//! In-memory store backend.
//!
//! Applies batches structurally (pattern delete, then insert) and answers
//! boolean/select queries from scripted results. It is intended for embedded
//! usage and tests, and can simulate outages and rejected statements.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use crate::error::TransportError;
use crate::statement::{MutationBatch, Statement};

use super::{Row, StoreClient, DEFAULT_PROBE_QUERY};

type Triple = (String, String, String);

#[derive(Debug)]
struct MemoryState {
    triples: BTreeSet<Triple>,
    reachable: bool,
    poisoned_predicates: HashSet<String>,
    answers: HashMap<String, bool>,
    rows: HashMap<String, Vec<Row>>,
    ask_calls: HashMap<String, usize>,
    update_attempts: usize,
    applied: Vec<MutationBatch>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            triples: BTreeSet::new(),
            reachable: true,
            poisoned_predicates: HashSet::new(),
            answers: HashMap::new(),
            rows: HashMap::new(),
            ask_calls: HashMap::new(),
            update_attempts: 0,
            applied: Vec::new(),
        }
    }
}

fn lock_err(context: &'static str) -> TransportError {
    TransportError::ServerError {
        status: 500,
        message: format!("poisoned lock: {context}"),
    }
}

fn unreachable_err() -> TransportError {
    TransportError::ConnectionFailed {
        message: "in-memory store is unreachable".to_string(),
    }
}

/// Thread-safe in-memory triple store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    /// An empty, reachable store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut state) = self.state.write() {
            state.reachable = reachable;
        }
    }

    /// Reject (status 400) every batch that touches `predicate`.
    pub fn reject_predicate(&self, predicate: impl Into<String>) {
        if let Ok(mut state) = self.state.write() {
            state.poisoned_predicates.insert(predicate.into());
        }
    }

    /// Script the answer of a boolean query.
    pub fn set_answer(&self, query: impl Into<String>, answer: bool) {
        if let Ok(mut state) = self.state.write() {
            state.answers.insert(query.into(), answer);
        }
    }

    /// Script the rows of a select query.
    pub fn set_rows(&self, query: impl Into<String>, rows: Vec<Row>) {
        if let Ok(mut state) = self.state.write() {
            state.rows.insert(query.into(), rows);
        }
    }

    /// How many times `query` was asked.
    #[must_use]
    pub fn ask_count(&self, query: &str) -> usize {
        self.state
            .read()
            .map(|s| s.ask_calls.get(query).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Update calls received, including failed ones.
    #[must_use]
    pub fn update_attempts(&self) -> usize {
        self.state.read().map(|s| s.update_attempts).unwrap_or(0)
    }

    /// Successfully applied batches, in application order.
    #[must_use]
    pub fn applied(&self) -> Vec<MutationBatch> {
        self.state.read().map(|s| s.applied.clone()).unwrap_or_default()
    }

    /// True if the ground statement is stored.
    #[must_use]
    pub fn contains(&self, statement: &Statement) -> bool {
        let (Some(s), Some(o)) = (&statement.subject, &statement.object) else {
            return false;
        };
        self.state
            .read()
            .map(|state| {
                state
                    .triples
                    .contains(&(s.clone(), statement.predicate.clone(), o.clone()))
            })
            .unwrap_or(false)
    }

    /// All stored statements, sorted.
    #[must_use]
    pub fn statements(&self) -> Vec<Statement> {
        self.state
            .read()
            .map(|state| {
                state
                    .triples
                    .iter()
                    .map(|(s, p, o)| Statement::new(s.clone(), p.clone(), o.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of stored statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.triples.len()).unwrap_or(0)
    }

    /// Whether the store holds no statements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StoreClient for InMemoryStore {
    fn update(&self, batch: &MutationBatch) -> Result<(), TransportError> {
        let mut state = self.state.write().map_err(|_| lock_err("update"))?;
        state.update_attempts += 1;

        if !state.reachable {
            return Err(unreachable_err());
        }
        if batch.where_clause().is_some() {
            return Err(TransportError::Rejected {
                status: 400,
                message: "explicit where clauses are not supported in memory".to_string(),
            });
        }
        if let Some(st) = batch
            .delete_set()
            .iter()
            .chain(batch.insert_set())
            .find(|st| state.poisoned_predicates.contains(&st.predicate))
        {
            return Err(TransportError::Rejected {
                status: 400,
                message: format!("malformed statement: {st}"),
            });
        }

        for pattern in batch.delete_set() {
            state.triples.retain(|(s, p, o)| !pattern.matches(s, p, o));
        }
        for st in batch.insert_set() {
            if let (Some(s), Some(o)) = (&st.subject, &st.object) {
                state
                    .triples
                    .insert((s.clone(), st.predicate.clone(), o.clone()));
            }
        }
        state.applied.push(batch.clone());
        Ok(())
    }

    fn ask(&self, query: &str) -> Result<bool, TransportError> {
        let mut state = self.state.write().map_err(|_| lock_err("ask"))?;
        *state.ask_calls.entry(query.to_string()).or_insert(0) += 1;

        if !state.reachable {
            return Err(unreachable_err());
        }
        if query == DEFAULT_PROBE_QUERY {
            return Ok(!state.triples.is_empty());
        }
        state
            .answers
            .get(query)
            .copied()
            .ok_or_else(|| TransportError::Rejected {
                status: 400,
                message: format!("no scripted answer for query: {query}"),
            })
    }

    fn select(&self, query: &str) -> Result<Vec<Row>, TransportError> {
        let state = self.state.read().map_err(|_| lock_err("select"))?;
        if !state.reachable {
            return Err(unreachable_err());
        }
        Ok(state.rows.get(query).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::{ChangeCategory, ChangeOrigin};

    fn origin() -> ChangeOrigin {
        ChangeOrigin::new(ChangeCategory::Unknown)
    }

    #[test]
    fn update_applies_wildcard_deletes_then_inserts() {
        let store = InMemoryStore::new();
        let seed = MutationBatch::builder(origin())
            .insert(Statement::new("<u>", "ont:hasLabel", "\"old\""))
            .insert(Statement::new("<u>", "ont:hasLabel", "\"older\""))
            .insert(Statement::new("<v>", "ont:hasLabel", "\"keep\""))
            .build()
            .unwrap();
        store.update(&seed).unwrap();

        let replace = MutationBatch::builder(origin())
            .delete(Statement::any_object("<u>", "ont:hasLabel"))
            .insert(Statement::new("<u>", "ont:hasLabel", "\"new\""))
            .build()
            .unwrap();
        store.update(&replace).unwrap();

        assert!(store.contains(&Statement::new("<u>", "ont:hasLabel", "\"new\"")));
        assert!(!store.contains(&Statement::new("<u>", "ont:hasLabel", "\"old\"")));
        assert!(store.contains(&Statement::new("<v>", "ont:hasLabel", "\"keep\"")));
        assert_eq!(store.len(), 2);
        assert_eq!(store.applied().len(), 2);
    }

    #[test]
    fn unreachable_store_fails_transiently() {
        let store = InMemoryStore::new();
        store.set_reachable(false);
        let err = store.probe().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.update_attempts(), 0);
    }

    #[test]
    fn rejected_predicate_fails_permanently() {
        let store = InMemoryStore::new();
        store.reject_predicate("ont:bad");
        let batch = MutationBatch::builder(origin())
            .insert(Statement::new("<u>", "ont:bad", "\"x\""))
            .build()
            .unwrap();
        let err = store.update(&batch).unwrap_err();
        assert!(err.is_permanent());
        assert!(store.is_empty());
    }

    #[test]
    fn scripted_answers_and_call_counts() {
        let store = InMemoryStore::new();
        store.set_answer("ASK { <l1> ont:isOn true }", true);
        assert!(store.ask("ASK { <l1> ont:isOn true }").unwrap());
        assert_eq!(store.ask_count("ASK { <l1> ont:isOn true }"), 1);
        assert!(store.ask("ASK { unknown }").unwrap_err().is_permanent());
    }
}
