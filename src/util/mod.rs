//! Utility modules: configuration, logging and diagnostic dumps

pub mod config;
pub mod diagnostic;
pub mod logger;
