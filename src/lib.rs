//! Backup and restore engine for Marzban panel installations

pub mod core;
pub mod utils;
