//! `quill-core`: identifiers and errors shared by every Quill crate.
//!
//! No IO and no transport concerns live here.

pub mod error;
pub mod id;

pub use error::CoreError;
pub use id::{ProjectId, TenantId};
