//! Query execution boundary
//!
//! The engine never speaks to a backend itself; it hands an opaque
//! [`QueryDescriptor`] to a [`QueryExecutor`] and records whatever comes back.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;

/// Query language understood by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryLanguage {
    Dsl,
    Ppl,
}

impl Default for QueryLanguage {
    fn default() -> Self {
        Self::Dsl
    }
}

/// What to send; interpreted only by the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    #[serde(default)]
    pub language: QueryLanguage,

    /// Query text or JSON body
    pub body: String,

    /// Index or index pattern the query runs against
    #[serde(default)]
    pub index: Option<String>,
}

impl QueryDescriptor {
    pub fn dsl(index: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            language: QueryLanguage::Dsl,
            body: body.into(),
            index: Some(index.into()),
        }
    }

    pub fn ppl(body: impl Into<String>) -> Self {
        Self {
            language: QueryLanguage::Ppl,
            body: body.into(),
            index: None,
        }
    }

    /// First `max` characters of the body, for plan listings
    pub fn preview(&self, max: usize) -> String {
        let mut chars = self.body.chars();
        let head: String = chars.by_ref().take(max).collect();
        if chars.next().is_some() {
            format!("{}...", head)
        } else {
            head
        }
    }
}

/// Result of one execution attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(duration: Duration) -> Self {
        Self {
            duration,
            success: true,
            error: None,
        }
    }

    pub fn failure(duration: Duration, error: impl Into<String>) -> Self {
        Self {
            duration,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Sends one query to the backend
///
/// Exactly one attempt per call; retry policy, if any, belongs to the
/// implementation. Failures are returned as outcomes, never panics.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &QueryDescriptor) -> ExecutionOutcome;

    /// Pre-run reachability check; returns a human-readable backend description
    async fn check_connection(&self) -> Result<String, ExecutorError> {
        Ok("connection check not implemented".to_string())
    }
}
