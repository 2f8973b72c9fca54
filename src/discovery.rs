//! Discovery queries over the item index
//!
//! Queries are executed as lazy streams of item ids. A stream that failed is
//! finished; a retry must issue a fresh query.

use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use uuid::Uuid;

use crate::error::Result;

/// Lazily produced item ids
pub type ItemStream<'a> = Pin<Box<dyn Stream<Item = Result<Uuid>> + Send + 'a>>;

/// Kind of indexed object a query is restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexableType {
    /// Installed items (archived or withdrawn)
    Item,
    WorkflowItem,
}

impl IndexableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexableType::Item => "Item",
            IndexableType::WorkflowItem => "XmlWorkflowItem",
        }
    }
}

/// A single filter predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterQuery {
    /// Some metadata value carries exactly this authority
    Authority { value: String },
    /// Some value of `field` equals `value`
    Metadata { field: String, value: String },
}

impl fmt::Display for FilterQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterQuery::Authority { value } => write!(f, "authority:\"{}\"", escape(value)),
            FilterQuery::Metadata { field, value } => write!(f, "{}:\"{}\"", field, escape(value)),
        }
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Filters are combined with AND
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverQuery {
    pub dso_type: Option<IndexableType>,
    pub filter_queries: Vec<FilterQuery>,
}

impl DiscoverQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dso_type(mut self, dso_type: IndexableType) -> Self {
        self.dso_type = Some(dso_type);
        self
    }

    pub fn with_filter(mut self, filter: FilterQuery) -> Self {
        self.filter_queries.push(filter);
        self
    }

    /// Query-string rendering, used for logging
    pub fn to_query_string(&self) -> String {
        let mut parts = Vec::new();
        if let Some(dso_type) = self.dso_type {
            parts.push(format!("search.resourcetype:{}", dso_type.as_str()));
        }
        parts.extend(self.filter_queries.iter().map(|f| f.to_string()));
        if parts.is_empty() {
            "*:*".to_string()
        } else {
            parts.join(" AND ")
        }
    }
}

/// Executes discovery queries
pub trait DiscoveryQueryRunner: Send + Sync {
    /// Start a read-only scan; nothing is fetched until the stream is polled
    fn iterate(&self, query: DiscoverQuery) -> ItemStream<'static>;
}
