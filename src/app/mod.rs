pub mod cli;

pub use cli::{help_text, parse_cli_options, CliOptions};
