//! Command-line plumbing shared by Tether binaries.

pub mod config;
