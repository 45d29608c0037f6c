//! CLI library components for mihomo party.

#![warn(missing_docs)]

pub mod cli;
pub mod logging;
