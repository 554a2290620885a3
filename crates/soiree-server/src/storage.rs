//! Async access to the SQLite store.
//!
//! One connection serves the whole process behind a tokio mutex. Every call
//! carries a deadline; waiting longer than that for the connection fails the
//! operation with an internal error.
//!
//! The deadline does not interrupt a statement once the connection is held.
//! SQLite work runs to completion on the calling task and an overrun is only
//! logged. Operations are single-row or page-sized, so a holder releases the
//! connection quickly and the next waiter's deadline covers the queue.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use soiree_shared::constants::{DEFAULT_PAGE_SIZE, DEFAULT_SEARCH_LIMIT, MAX_PAGE_SIZE, MAX_SEARCH_LIMIT};
use soiree_store::Database;

use crate::error::ChatError;

/// Deadline class of a storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Single-row reads and writes.
    Point,
    /// Paged lists and searches.
    List,
    /// Listings that join several collections per row.
    Aggregate,
}

impl Deadline {
    pub fn budget(self) -> Duration {
        match self {
            Deadline::Point => Duration::from_secs(5),
            Deadline::List => Duration::from_secs(10),
            Deadline::Aggregate => Duration::from_secs(15),
        }
    }
}

/// Requested page length, defaulted and capped.
pub fn page_size(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

pub fn search_size(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_SEARCH_LIMIT)
}

#[derive(Clone)]
pub struct Storage {
    db: Arc<Mutex<Database>>,
}

impl Storage {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, soiree_store::StoreError> {
        Ok(Self::new(Database::open_at(path)?))
    }

    /// Run `op` against the database. Acquiring the connection must finish
    /// within the deadline of `class`; `op` itself is never cut short.
    pub async fn run<T, F>(&self, class: Deadline, op: F) -> Result<T, ChatError>
    where
        F: FnOnce(&Database) -> Result<T, ChatError>,
    {
        let budget = class.budget();
        let db = tokio::time::timeout(budget, self.db.lock())
            .await
            .map_err(|_| {
                warn!(?class, "storage deadline elapsed waiting for the connection");
                ChatError::Internal(format!("storage busy for more than {budget:?}"))
            })?;

        let started = Instant::now();
        let result = op(&db);
        let elapsed = started.elapsed();
        if elapsed > budget {
            warn!(?class, elapsed_ms = elapsed.as_millis() as u64, "storage operation overran its deadline");
        }
        result
    }
}
