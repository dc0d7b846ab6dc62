//! Application services layer: repository seams, job handlers and errors.

pub mod error;
pub mod jobs;
pub mod repos;
