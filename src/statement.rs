//! Statement model: triples, mutation batches and change notifications.
//!
//! Terms are carried in their rendered form (`<iri>`, `prefix:local`,
//! `"literal"^^xsd:type`) so the transport can splice them into an update
//! without another round of escaping. A `None` subject or object is a free
//! variable and is only meaningful in a delete or where pattern.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A subject/predicate/object triple or triple pattern.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Statement {
    /// Subject term, `None` for a wildcard.
    pub subject: Option<String>,
    /// Predicate term. Never a wildcard.
    pub predicate: String,
    /// Object term, `None` for a wildcard.
    pub object: Option<String>,
}

impl Statement {
    /// A fully bound statement.
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: Some(subject.into()),
            predicate: predicate.into(),
            object: Some(object.into()),
        }
    }

    /// A pattern matching any object for `subject predicate`.
    #[must_use]
    pub fn any_object(subject: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            predicate: predicate.into(),
            object: None,
        }
    }

    /// A pattern matching any subject for `predicate object`.
    #[must_use]
    pub fn any_subject(predicate: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            subject: None,
            predicate: predicate.into(),
            object: Some(object.into()),
        }
    }

    /// True when neither subject nor object is a wildcard.
    #[must_use]
    pub const fn is_ground(&self) -> bool {
        self.subject.is_some() && self.object.is_some()
    }

    /// True when `self`, read as a pattern, matches the ground triple.
    #[must_use]
    pub fn matches(&self, subject: &str, predicate: &str, object: &str) -> bool {
        self.predicate == predicate
            && self.subject.as_deref().map_or(true, |s| s == subject)
            && self.object.as_deref().map_or(true, |o| o == object)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.subject.as_deref().unwrap_or("?"),
            self.predicate,
            self.object.as_deref().unwrap_or("?")
        )
    }
}

/// Builders for rendered terms.
pub struct Term;

impl Term {
    /// An absolute IRI in angle brackets.
    #[must_use]
    pub fn iri(iri: &str) -> String {
        format!("<{iri}>")
    }

    /// A plain string literal with SPARQL escaping applied.
    #[must_use]
    pub fn literal(value: &str) -> String {
        let mut out = String::with_capacity(value.len() + 2);
        out.push('"');
        for c in value.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                other => out.push(other),
            }
        }
        out.push('"');
        out
    }

    /// A literal with an explicit datatype (`"v"^^datatype`).
    #[must_use]
    pub fn typed(value: &str, datatype: &str) -> String {
        format!("{}^^{datatype}", Self::literal(value))
    }

    /// An `xsd:boolean` literal.
    #[must_use]
    pub fn boolean(value: bool) -> String {
        Self::typed(if value { "true" } else { "false" }, "xsd:boolean")
    }

    /// An `xsd:dateTime` literal with millisecond precision.
    #[must_use]
    pub fn date_time(value: DateTime<Utc>) -> String {
        Self::typed(
            &value.to_rfc3339_opts(SecondsFormat::Millis, true),
            "xsd:dateTime",
        )
    }
}

/// Semantic category of a change, used to route notifications to triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCategory {
    /// Registry configuration change (unit added, updated or removed).
    Unknown,
    /// Unit state observation history.
    Observation,
    /// Connection phase bookkeeping.
    Connectivity,
}

impl fmt::Display for ChangeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Observation => "observation",
            Self::Connectivity => "connectivity",
        };
        f.write_str(s)
    }
}

/// What a batch is about; the notification published after delivery is
/// derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOrigin {
    /// Kind of change.
    pub category: ChangeCategory,
    /// Unit types touched by the batch.
    #[serde(default)]
    pub unit_types: BTreeSet<String>,
    /// Service types touched by the batch.
    #[serde(default)]
    pub service_types: BTreeSet<String>,
}

impl ChangeOrigin {
    /// An origin with no unit or service types.
    #[must_use]
    pub const fn new(category: ChangeCategory) -> Self {
        Self {
            category,
            unit_types: BTreeSet::new(),
            service_types: BTreeSet::new(),
        }
    }

    /// Adds a unit type.
    #[must_use]
    pub fn with_unit_type(mut self, unit_type: impl Into<String>) -> Self {
        self.unit_types.insert(unit_type.into());
        self
    }

    /// Adds service types.
    #[must_use]
    pub fn with_service_types<I, S>(mut self, service_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service_types
            .extend(service_types.into_iter().map(Into::into));
        self
    }
}

/// Published once a batch has been applied to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Kind of change.
    pub category: ChangeCategory,
    /// Unit types touched by the change.
    pub unit_types: BTreeSet<String>,
    /// Service types touched by the change.
    pub service_types: BTreeSet<String>,
    /// Buffer entry that carried the change.
    pub entry_id: u64,
    /// When the store accepted the batch.
    pub applied_at: DateTime<Utc>,
}

impl ChangeNotification {
    /// Derives the notification for an applied batch.
    #[must_use]
    pub fn from_origin(origin: &ChangeOrigin, entry_id: u64, applied_at: DateTime<Utc>) -> Self {
        Self {
            category: origin.category,
            unit_types: origin.unit_types.clone(),
            service_types: origin.service_types.clone(),
            entry_id,
            applied_at,
        }
    }
}

/// One atomic logical change: deletions, insertions and an optional where
/// clause.
///
/// When the delete set is non-empty and no where clause is given, each delete
/// pattern is its own where pattern (delete whatever matches, then insert).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatch {
    delete_set: Vec<Statement>,
    insert_set: Vec<Statement>,
    where_clause: Option<String>,
    origin: ChangeOrigin,
}

impl MutationBatch {
    /// Starts building a batch.
    #[must_use]
    pub fn builder(origin: ChangeOrigin) -> MutationBatchBuilder {
        MutationBatchBuilder {
            delete_set: Vec::new(),
            insert_set: Vec::new(),
            where_clause: None,
            origin,
        }
    }

    /// Patterns removed before inserting.
    #[must_use]
    pub fn delete_set(&self) -> &[Statement] {
        &self.delete_set
    }

    /// Statements inserted.
    #[must_use]
    pub fn insert_set(&self) -> &[Statement] {
        &self.insert_set
    }

    /// Explicit `WHERE` clause, if any.
    #[must_use]
    pub fn where_clause(&self) -> Option<&str> {
        self.where_clause.as_deref()
    }

    /// The delete patterns doubling as the where pattern, when no explicit
    /// where clause was given.
    #[must_use]
    pub fn implicit_where(&self) -> Option<&[Statement]> {
        if self.where_clause.is_none() && !self.delete_set.is_empty() {
            Some(&self.delete_set)
        } else {
            None
        }
    }

    /// What the batch is about.
    #[must_use]
    pub const fn origin(&self) -> &ChangeOrigin {
        &self.origin
    }

    /// True for batches that only add statements.
    #[must_use]
    pub fn is_insert_only(&self) -> bool {
        self.delete_set.is_empty()
    }
}

/// Builder for [`MutationBatch`].
#[derive(Debug, Clone)]
pub struct MutationBatchBuilder {
    delete_set: Vec<Statement>,
    insert_set: Vec<Statement>,
    where_clause: Option<String>,
    origin: ChangeOrigin,
}

impl MutationBatchBuilder {
    /// Appends a delete pattern.
    #[must_use]
    pub fn delete(mut self, statement: Statement) -> Self {
        self.delete_set.push(statement);
        self
    }

    /// Appends delete patterns.
    #[must_use]
    pub fn delete_all(mut self, statements: impl IntoIterator<Item = Statement>) -> Self {
        self.delete_set.extend(statements);
        self
    }

    /// Appends an insert statement.
    #[must_use]
    pub fn insert(mut self, statement: Statement) -> Self {
        self.insert_set.push(statement);
        self
    }

    /// Appends insert statements.
    #[must_use]
    pub fn insert_all(mut self, statements: impl IntoIterator<Item = Statement>) -> Self {
        self.insert_set.extend(statements);
        self
    }

    /// Sets an explicit where clause (raw graph pattern body).
    ///
    /// Delete patterns of such a batch are templates over the clause's
    /// variables, so they must spell those variables out (`?old`) rather
    /// than use wildcards.
    #[must_use]
    pub fn where_clause(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    /// Validates and builds the batch.
    ///
    /// # Errors
    /// - `EmptyPredicate` if any statement has an empty predicate
    /// - `WildcardInInsert` if an insert statement has a wildcard
    /// - `WildcardWithWhereClause` if a delete pattern has a wildcard while
    ///   an explicit where clause is set
    /// - `EmptyBatch` if there is nothing to delete or insert
    pub fn build(self) -> Result<MutationBatch, ValidationError> {
        if self.delete_set.is_empty() && self.insert_set.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        for st in self.delete_set.iter().chain(&self.insert_set) {
            if st.predicate.trim().is_empty() {
                return Err(ValidationError::EmptyPredicate);
            }
        }
        if let Some(st) = self.insert_set.iter().find(|st| !st.is_ground()) {
            return Err(ValidationError::WildcardInInsert {
                predicate: st.predicate.clone(),
            });
        }
        if let Some(clause) = &self.where_clause {
            if clause.trim().is_empty() {
                return Err(ValidationError::EmptyField {
                    field: "where_clause".to_string(),
                });
            }
            if let Some(st) = self.delete_set.iter().find(|st| !st.is_ground()) {
                return Err(ValidationError::WildcardWithWhereClause {
                    predicate: st.predicate.clone(),
                });
            }
        }

        Ok(MutationBatch {
            delete_set: self.delete_set,
            insert_set: self.insert_set,
            where_clause: self.where_clause,
            origin: self.origin,
        })
    }
}
