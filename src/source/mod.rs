//! Data-source boundary: connecting to a database, running queries, and
//! discovering databases.

use std::future::Future;

use crate::mapper::QueryResult;

pub mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("connect to {target}: {message}")]
    Connect { target: String, message: String },
    #[error("query failed: {0}")]
    Query(String),
}

/// Opens connections to the base target, or to one database reachable from it.
pub trait Connector: Sync {
    type Connection: Connection + Send;

    /// `None` connects to the database of the base target.
    fn connect(
        &self,
        database: Option<&str>,
    ) -> impl Future<Output = Result<Self::Connection, SourceError>> + Send;
}

/// An open connection. Dropping it closes it.
pub trait Connection {
    fn query(&mut self, sql: &str) -> impl Future<Output = Result<QueryResult, SourceError>> + Send;

    /// Names of databases that accept connections and are not templates.
    fn databases(&mut self) -> impl Future<Output = Result<Vec<String>, SourceError>> + Send;
}
