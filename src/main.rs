mod cli;
mod execute;

use clap::Parser;
use colored::Colorize;
use knotvm::cancel::CancelFlag;
use knotvm::KnotError;
use crate::cli::CLI;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
            tracing::warn!("could not install Ctrl-C handler: {e}");
        }
    }

    let cli = CLI::parse();
    let exit_code = match execute::execute(cli, &cancel) {
        Ok(code) => code,
        Err(err) => report(&err),
    };
    std::process::exit(exit_code);
}

/// Single error boundary: one formatted line per failure, a hint when the
/// error carries one, and the exit code fixed by the error's category.
fn report(err: &KnotError) -> i32 {
    let code = err.code();
    eprintln!("{}: {err}", format!("error[{code}]").red().bold());
    if let Some(hint) = err.hint() {
        eprintln!("{}: {hint}", "hint".cyan().bold());
    }
    code.exit_code()
}
