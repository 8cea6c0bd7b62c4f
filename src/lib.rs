//! Mail intake: fetch, normalize, enrich and order support email.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod providers;
