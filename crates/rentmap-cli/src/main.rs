mod commands;
mod logging;
mod settings;

use anyhow::Context;
use clap::Parser;
use settings::{Command, Settings};

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    let _logging = logging::setup_logging(settings.trace_file.as_deref());

    match settings.command {
        Command::Serve => commands::serve(std::io::stdin().lock(), std::io::stdout().lock()),
        Command::Query(args) => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("starting tokio runtime")?;
            rt.block_on(commands::query(&args))
        }
    }
}
