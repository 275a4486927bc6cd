//! Thin CLI layer over `measure-core`: argument parsing, metadata loading,
//! logging setup, and per-role service wiring for the two entry points
//! (`measure-tv`, `measure-csa`).

pub mod cmd_csa;
pub mod cmd_tv;
pub mod common;
