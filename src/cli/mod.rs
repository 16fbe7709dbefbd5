//! CLI Module
//!
//! Exit codes and the mapping from transfer outcomes to them

pub mod exit_codes;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
