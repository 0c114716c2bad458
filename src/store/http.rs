//! SPARQL 1.1 protocol client over HTTP.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{SyncError, SyncResult, TransportError};
use crate::statement::MutationBatch;

use super::{sparql, Row, StoreClient};

const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

/// Maximum response body echoed into an error message.
const MAX_ERROR_BODY: usize = 512;

/// Store client speaking the SPARQL 1.1 query and update protocols.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    query_endpoint: String,
    update_endpoint: String,
    probe_query: String,
    timeout: Duration,
}

impl HttpStore {
    /// Builds a client from store configuration.
    ///
    /// # Errors
    /// Returns an internal error if the HTTP client cannot be constructed.
    pub fn new(config: &StoreConfig) -> SyncResult<Self> {
        let timeout = config.request_timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            query_endpoint: config.query_endpoint.clone(),
            update_endpoint: config.update_endpoint.clone(),
            probe_query: config.probe_query.clone(),
            timeout,
        })
    }

    fn post_form(&self, endpoint: &str, key: &str, body: &str) -> Result<String, TransportError> {
        let response = self
            .client
            .post(endpoint)
            .header(ACCEPT, SPARQL_RESULTS_JSON)
            .form(&[(key, body)])
            .send()
            .map_err(|e| self.classify(&e))?;

        let status = response.status();
        let text = response.text().map_err(|e| self.classify(&e))?;
        if status.is_success() {
            return Ok(text);
        }

        let mut message = text;
        if message.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Err(TransportError::from_status(status.as_u16(), message))
    }

    fn classify(&self, err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                duration_ms: self.timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }
        } else if let Some(status) = err.status() {
            TransportError::from_status(status.as_u16(), err.to_string())
        } else {
            TransportError::ConnectionFailed {
                message: err.to_string(),
            }
        }
    }
}

impl StoreClient for HttpStore {
    fn update(&self, batch: &MutationBatch) -> Result<(), TransportError> {
        let body = sparql::render_update(batch);
        debug!(
            endpoint = %self.update_endpoint,
            deletes = batch.delete_set().len(),
            inserts = batch.insert_set().len(),
            "posting update"
        );
        self.post_form(&self.update_endpoint, "update", &body).map(|_| ())
    }

    fn ask(&self, query: &str) -> Result<bool, TransportError> {
        let body = self.post_form(&self.query_endpoint, "query", query)?;
        sparql::parse_ask(&body)
    }

    fn select(&self, query: &str) -> Result<Vec<Row>, TransportError> {
        let body = self.post_form(&self.query_endpoint, "query", query)?;
        sparql::parse_select(&body)
    }

    fn probe(&self) -> Result<(), TransportError> {
        self.ask(&self.probe_query).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_endpoint_is_transient() {
        let config = StoreConfig {
            query_endpoint: "http://127.0.0.1:9/query".to_string(),
            update_endpoint: "http://127.0.0.1:9/update".to_string(),
            request_timeout_ms: 500,
            ..StoreConfig::default()
        };
        let store = HttpStore::new(&config).unwrap();
        let err = store.probe().unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
