//! The `amalgam` command-line interface.

use amalgam_cli::commands::{EvalCommand, RunCommand};
use anyhow::Result;
use clap::Parser;

#[derive(Parser)]
#[command(name = "amalgam", version, about = "Amalgam language runtime")]
enum Amalgam {
    /// Run an Amalgam source file.
    Run(RunCommand),
    /// Evaluate an expression.
    Eval(EvalCommand),
}

fn main() -> Result<()> {
    env_logger::init();
    match Amalgam::parse() {
        Amalgam::Run(command) => command.execute(),
        Amalgam::Eval(command) => command.execute(),
    }
}
