//! CLI command implementations.

pub mod inspect;
pub mod membership;
pub mod migrate;
pub mod serve;
pub mod token;
