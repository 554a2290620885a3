//! # soiree-shared
//!
//! Types shared by the Soirée chat store and server:
//! - [`types`]: creation-ordered [`ObjectId`]s, email-keyed [`UserId`]s and
//!   the small status enums persisted alongside them
//! - [`protocol`]: the JSON frames exchanged over the WebSocket
//! - [`views`]: the payload structs carried inside those frames and in HTTP
//!   responses

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;
pub mod views;

pub use error::{FrameError, IdError};
pub use types::{ObjectId, UserId};
