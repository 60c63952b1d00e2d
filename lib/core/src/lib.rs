//! Core types shared by every botwright crate.
//!
//! This crate provides the identifier types and the error-handling
//! foundation used by the flow engine, the runtime and the server binary.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{BotId, ChatUserId, InstanceId, ParseIdError};
