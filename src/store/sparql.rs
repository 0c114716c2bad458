//! SPARQL 1.1 wire format: update rendering and JSON result parsing.
//!
//! Without an explicit where clause every delete pattern becomes its own
//! `DELETE WHERE` operation. A combined `DELETE WHERE { p1 . p2 }` would only
//! delete when all patterns match together, which is not what a per-predicate
//! wildcard delete means. All operations go out in one request, so the store
//! applies them as a unit.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::TransportError;
use crate::mapper::vocab;
use crate::statement::{MutationBatch, Statement};

use super::Row;

fn render_statement(st: &Statement, idx: usize) -> String {
    let subject = st
        .subject
        .clone()
        .unwrap_or_else(|| format!("?s{idx}"));
    let object = st.object.clone().unwrap_or_else(|| format!("?o{idx}"));
    format!("{subject} {} {object} .", st.predicate)
}

fn render_block(statements: &[Statement]) -> String {
    statements
        .iter()
        .enumerate()
        .map(|(idx, st)| render_statement(st, idx))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Renders a batch as a SPARQL update request body.
#[must_use]
pub fn render_update(batch: &MutationBatch) -> String {
    let mut ops: Vec<String> = Vec::new();

    if let Some(clause) = batch.where_clause() {
        let mut op = String::new();
        if !batch.delete_set().is_empty() {
            op.push_str(&format!("DELETE {{ {} }}\n", render_block(batch.delete_set())));
        }
        if !batch.insert_set().is_empty() {
            op.push_str(&format!("INSERT {{ {} }}\n", render_block(batch.insert_set())));
        }
        op.push_str(&format!("WHERE {{ {clause} }}"));
        ops.push(op);
    } else {
        for (idx, st) in batch.delete_set().iter().enumerate() {
            ops.push(format!("DELETE WHERE {{ {} }}", render_statement(st, idx)));
        }
        if !batch.insert_set().is_empty() {
            ops.push(format!("INSERT DATA {{ {} }}", render_block(batch.insert_set())));
        }
    }

    let mut out = vocab::prefixes();
    out.push_str(&ops.join(" ;\n"));
    out
}

#[derive(Debug, Deserialize)]
struct AskResponse {
    boolean: bool,
}

#[derive(Debug, Deserialize)]
struct SelectResponse {
    results: SelectResults,
}

#[derive(Debug, Deserialize)]
struct SelectResults {
    bindings: Vec<BTreeMap<String, BindingValue>>,
}

#[derive(Debug, Deserialize)]
struct BindingValue {
    value: String,
}

/// Parses an `application/sparql-results+json` boolean result.
///
/// # Errors
/// `InvalidResponse` if the body is not a boolean result document.
pub fn parse_ask(body: &str) -> Result<bool, TransportError> {
    serde_json::from_str::<AskResponse>(body)
        .map(|r| r.boolean)
        .map_err(|e| TransportError::InvalidResponse {
            message: format!("invalid ASK result: {e}"),
        })
}

/// Parses an `application/sparql-results+json` solution sequence.
///
/// # Errors
/// `InvalidResponse` if the body is not a solution sequence document.
pub fn parse_select(body: &str) -> Result<Vec<Row>, TransportError> {
    let parsed: SelectResponse =
        serde_json::from_str(body).map_err(|e| TransportError::InvalidResponse {
            message: format!("invalid SELECT result: {e}"),
        })?;
    Ok(parsed
        .results
        .bindings
        .into_iter()
        .map(|b| b.into_iter().map(|(k, v)| (k, v.value)).collect())
        .collect())
}
