//! `mediarun-core`: identifiers and error primitives shared by every crate.
//!
//! This crate has no runtime or storage concerns.

pub mod cursor;
pub mod error;
pub mod id;

pub use cursor::Cursor;
pub use error::{DomainError, DomainResult};
pub use id::{ItemId, JobId, RunId};
