use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use quill::app::{self, Cli};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so they never interleave with the reveal on stdout.
    let default_filter = if cli.verbose {
        "quill=debug,quill_llm=debug"
    } else {
        "quill=warn,quill_llm=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match app::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "quill exited with an error");
            eprintln!("quill: {error}");
            ExitCode::FAILURE
        }
    }
}
