//! # soiree-store
//!
//! SQLite persistence for the Soirée chat core.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every chat
//! collection: direct invitations, conversations and messages, groups with
//! their members, invitations, messages and read receipts, plus the user
//! directory and push-token registry the chat core reads from.
//!
//! State transitions that touch several tables (accepting an invitation,
//! leaving a group) run inside a single SQLite transaction.

pub mod conversations;
pub mod database;
pub mod direct_invitations;
pub mod direct_messages;
pub mod group_invitations;
pub mod group_messages;
pub mod groups;
pub mod migrations;
pub mod models;
pub mod push_tokens;
pub mod read_receipts;
pub mod users;

mod columns;
mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
