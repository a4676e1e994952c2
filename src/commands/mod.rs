//! Command handlers module.
//!
//! - `run.rs`: Deduplicate a JSON file of records
//! - `config.rs`: Configuration display command

mod config;
mod run;

pub use config::cmd_config;
pub use run::{RunArgs, cmd_run};
