pub mod bridge;
pub mod chain;
pub mod config;
pub mod logging;
pub mod paper;
pub mod signal;
pub mod swap;
pub mod worker;
