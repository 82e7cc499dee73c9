pub mod adb;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod perf;
pub mod shell;
pub mod state;
