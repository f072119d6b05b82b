//! `stockcount-core`: identifiers and error model shared by every crate.
//!
//! This crate has no infrastructure dependencies.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{CountLineId, MutationId, SessionId};
