pub mod core;
pub mod discovery;
pub mod logging;
pub mod manifest;
pub mod workflow;
