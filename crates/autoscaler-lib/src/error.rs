//! Error taxonomy for the autoscaler core

use crate::cluster::ClusterError;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Namespace, workload or pod listing failed
    #[error("cluster query failed: {0}")]
    ClusterQuery(#[source] ClusterError),

    /// The metrics backend answered but had nothing usable for the query
    #[error("metrics unavailable for query `{query}`: {reason}")]
    MetricsUnavailable { query: String, reason: String },

    /// The metrics backend answered with a value that could not be interpreted
    #[error("failed to parse metrics response: {0}")]
    MetricsParse(String),

    /// The metrics backend could not be reached
    #[error("metrics request failed: {0}")]
    MetricsTransport(#[from] reqwest::Error),

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("conflicting update on {resource}: {message}")]
    UpdateConflict { resource: String, message: String },

    #[error("failed to update {resource}: {source}")]
    Mutation {
        resource: String,
        #[source]
        source: ClusterError,
    },

    #[error("timed out after {waited:?} waiting for {resource}")]
    ConvergenceTimeout { resource: String, waited: Duration },

    #[error("stopped waiting for {resource}: {reason}")]
    ConvergenceAborted { resource: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Map a failed mutation into the most specific variant
    pub fn from_mutation(
        kind: &'static str,
        namespace: &str,
        name: &str,
        err: ClusterError,
    ) -> Self {
        let resource = format!("{kind} {namespace}/{name}");
        match err {
            ClusterError::NotFound => Error::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            ClusterError::Conflict(message) => Error::UpdateConflict { resource, message },
            other => Error::Mutation {
                resource,
                source: other,
            },
        }
    }

    /// Map a failed read into `NotFound` or a cluster query failure
    pub fn from_read(kind: &'static str, namespace: &str, name: &str, err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound => Error::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            other => Error::ClusterQuery(other),
        }
    }

    /// Whether a retry of the failed operation could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::UpdateConflict { .. } => true,
            Error::Mutation { source, .. } => source.is_retryable(),
            Error::ClusterQuery(source) => source.is_retryable(),
            _ => false,
        }
    }
}
