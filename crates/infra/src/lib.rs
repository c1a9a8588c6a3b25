//! Job engine and storage for copying company memberships between collections.

pub mod jobs;
pub mod storage;
