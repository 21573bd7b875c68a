//! Identifiers and error primitives shared by every bizops crate.
//!
//! This crate has no infrastructure concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{TenantId, UserId};
