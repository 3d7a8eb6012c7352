//! Transport clients for remote invocation
//!
//! The executor drives two kinds of remote operations: invoking a semantic
//! web service with a minimal input graph, and issuing SELECT queries
//! against indexed SPARQL endpoints. Both are reached through the
//! [`ServiceInvoker`] trait so the transport can be swapped out in tests;
//! [`HttpServiceClient`] is the production implementation.
//!
//! Connection-level failures (unreachable host, non-success status) map to
//! [`FederationError::Connection`] / [`FederationError::Io`]; a service that
//! answers with RDF the engine cannot accept maps to
//! [`FederationError::ContractViolation`].

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{FederationError, Result};
use crate::model::{Binding, Graph, Term};
use crate::registry::ServiceRef;

/// Contract consumed from the transport layer.
#[async_trait]
pub trait ServiceInvoker: Send + Sync + fmt::Debug {
    /// Invoke a semantic web service with an input graph describing the
    /// input node; returns the service's output graph.
    async fn invoke(&self, service: &ServiceRef, input: &Graph) -> Result<Graph>;

    /// Run a SPARQL SELECT against an endpoint and return its bindings.
    async fn select(&self, endpoint: &str, query: &str) -> Result<Vec<Binding>>;
}

/// Configuration for the HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("semfed/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// HTTP implementation of [`ServiceInvoker`].
///
/// Service invocation POSTs the input graph as N-Triples and expects
/// N-Triples back; endpoint queries POST `application/sparql-query` and
/// expect `application/sparql-results+json`.
#[derive(Debug)]
pub struct HttpServiceClient {
    client: reqwest::Client,
    config: ClientConfig,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SparqlResults {
    pub results: SparqlResultRows,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SparqlResultRows {
    pub bindings: Vec<HashMap<String, SparqlResultTerm>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SparqlResultTerm {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub datatype: Option<String>,
}

impl HttpServiceClient {
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| FederationError::Io(format!("failed to create HTTP client: {e}")))?;
        Ok(HttpServiceClient { client, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait]
impl ServiceInvoker for HttpServiceClient {
    async fn invoke(&self, service: &ServiceRef, input: &Graph) -> Result<Graph> {
        debug!(
            service = service.uri.as_str(),
            input_triples = input.len(),
            "invoking service"
        );

        let response = self
            .client
            .post(&service.endpoint)
            .header("Content-Type", "application/n-triples")
            .header("Accept", "application/n-triples")
            .body(input.to_ntriples())
            .send()
            .await
            .map_err(|e| FederationError::Connection {
                service: service.uri.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(FederationError::Connection {
                service: service.uri.clone(),
                message: format!("service answered {}", response.status()),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FederationError::Connection {
                service: service.uri.clone(),
                message: e.to_string(),
            })?;

        // transport succeeded; undecodable RDF is a broken output contract
        let output = Graph::from_ntriples(&body).map_err(|e| {
            FederationError::ContractViolation {
                service: service.uri.clone(),
                message: e.to_string(),
            }
        })?;

        debug!(
            service = service.uri.as_str(),
            output_triples = output.len(),
            "service invocation complete"
        );
        Ok(output)
    }

    async fn select(&self, endpoint: &str, query: &str) -> Result<Vec<Binding>> {
        debug!(endpoint, "running endpoint SELECT");

        let response = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/sparql-query")
            .header("Accept", "application/sparql-results+json")
            .body(query.to_string())
            .send()
            .await
            .map_err(|e| FederationError::Io(format!("endpoint {endpoint} unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(FederationError::Io(format!(
                "endpoint {endpoint} answered {}",
                response.status()
            )));
        }

        let results: SparqlResults = response
            .json()
            .await
            .map_err(|e| FederationError::Parse(format!("malformed SELECT results: {e}")))?;

        Ok(convert_bindings(results))
    }
}

pub(crate) fn convert_bindings(results: SparqlResults) -> Vec<Binding> {
    let mut bindings = Vec::with_capacity(results.results.bindings.len());
    'rows: for row in results.results.bindings {
        let mut binding = Binding::new();
        for (variable, term) in row {
            let value = match term.kind.as_str() {
                "uri" => Term::iri(term.value),
                "literal" | "typed-literal" => match term.datatype {
                    Some(datatype) => {
                        Term::Literal(crate::model::Literal::typed(term.value, datatype))
                    }
                    None => Term::literal(term.value),
                },
                other => {
                    // blank nodes and future term kinds cannot join with the
                    // local graph; drop the whole row
                    warn!(kind = other, "dropping result row with unsupported term");
                    continue 'rows;
                }
            };
            binding.insert(variable, value);
        }
        bindings.push(binding);
    }
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_uri_and_literal_bindings() {
        let raw = r#"{
            "head": {"vars": ["s", "name"]},
            "results": {"bindings": [
                {
                    "s": {"type": "uri", "value": "http://ex.org/a"},
                    "name": {"type": "literal", "value": "alpha"}
                },
                {
                    "s": {"type": "uri", "value": "http://ex.org/b"},
                    "name": {"type": "typed-literal",
                             "value": "42",
                             "datatype": "http://www.w3.org/2001/XMLSchema#integer"}
                }
            ]}
        }"#;
        let parsed: SparqlResults = serde_json::from_str(raw).unwrap();
        let bindings = convert_bindings(parsed);

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0]["s"], Term::iri("http://ex.org/a"));
        assert_eq!(bindings[0]["name"], Term::literal("alpha"));
        assert_eq!(
            bindings[1]["name"],
            Term::Literal(crate::model::Literal::typed(
                "42",
                "http://www.w3.org/2001/XMLSchema#integer"
            ))
        );
    }

    #[test]
    fn drops_rows_with_blank_nodes() {
        let raw = r#"{
            "head": {"vars": ["s"]},
            "results": {"bindings": [
                {"s": {"type": "bnode", "value": "b0"}},
                {"s": {"type": "uri", "value": "http://ex.org/a"}}
            ]}
        }"#;
        let parsed: SparqlResults = serde_json::from_str(raw).unwrap();
        let bindings = convert_bindings(parsed);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0]["s"], Term::iri("http://ex.org/a"));
    }
}
