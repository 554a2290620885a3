//! Schema migrations, applied in order by [`Database::open_at`].
//!
//! `PRAGMA user_version` records the last applied step, so each step runs
//! exactly once per database file.
//!
//! [`Database::open_at`]: crate::Database::open_at

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered steps; step `i` upgrades the schema to version `i + 1`.
const STEPS: &[(&str, Step)] = &[("v001_initial", v001_initial::up)];

/// Schema version once every step has run.
pub const CURRENT_VERSION: u32 = STEPS.len() as u32;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than this build (v{CURRENT_VERSION})"
        )));
    }

    tracing::debug!(current_version = current, target_version = CURRENT_VERSION, "checking schema");

    for (version, (name, step)) in (1u32..).zip(STEPS).skip(current as usize) {
        tracing::info!(migration = name, "applying migration");
        step(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}
