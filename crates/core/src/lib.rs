//! `collectionjobs-core`: identifiers and the domain error model shared by
//! the job engine and its storage adapters.
//!
//! This crate has no infrastructure dependencies.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{CollectionId, CompanyId, JobId};
