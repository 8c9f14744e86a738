//! A3S Mirror CLI library.

pub mod commands;
pub mod output;
