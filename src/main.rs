//! hostpulse entry point
//!
//! Parses the command line, installs logging and runs the agent (or one of
//! the one-shot modes). Fatal errors are printed with a suggestion and the
//! process exits with status 1.

use anyhow::Result;
use clap::Parser;
use hostpulse::cli;
use hostpulse::core::error::user_friendly_error;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Set up colored output for Windows
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    cli::init_logging(cli.log_level());

    match cli.execute().await {
        Ok(()) => Ok(()),
        Err(e) => {
            let error_ctx = user_friendly_error(e);
            error_ctx.display();
            std::process::exit(1);
        }
    }
}
