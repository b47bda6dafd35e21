//! Application services layer: store contracts, request context, jobs.

pub mod error;
pub mod jobs;
pub mod repos;
pub mod request;
