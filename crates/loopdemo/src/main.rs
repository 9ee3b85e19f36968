mod cli;
mod routines;
mod run;

use anyhow::Result;

use crate::cli::Command;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Some(Command::Check(args)) => run::check(&args.config),
        None => run::run(cli.run),
    }
}
