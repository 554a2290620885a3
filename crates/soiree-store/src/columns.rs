//! Column encoding shared by the `row_to_*` helpers.
//!
//! Ids and emails are stored as TEXT, timestamps as RFC 3339 with
//! microseconds so that lexical order matches time order.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

use soiree_shared::constants::SYSTEM_SENDER;
use soiree_shared::{IdError, ObjectId, UserId};

pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn conversion_failure<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn get_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<ObjectId> {
    let raw: String = row.get(idx)?;
    ObjectId::from_hex(&raw).map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn get_opt_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<ObjectId>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| ObjectId::from_hex(&s).map_err(|e| conversion_failure(idx, e)))
        .transpose()
}

/// Reads an email column; group senders may also hold the system sentinel.
pub(crate) fn get_user(row: &Row<'_>, idx: usize) -> rusqlite::Result<UserId> {
    let raw: String = row.get(idx)?;
    if raw == SYSTEM_SENDER {
        return Ok(UserId::system());
    }
    UserId::parse(&raw).map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn get_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = IdError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_failure(idx, e))
}

/// `LIKE` pattern matching `query` anywhere, with wildcards escaped.
pub(crate) fn contains_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}
