//! Implementations of the CLI subcommands.

use crate::CommonOptions;
use anyhow::{anyhow, Result};
use clap::Parser;

/// Runs an Amalgam source file.
#[derive(Parser)]
pub struct RunCommand {
    #[command(flatten)]
    common: CommonOptions,

    /// Path of the source file to evaluate.
    file: String,
}

impl RunCommand {
    pub fn execute(self) -> Result<()> {
        let source = std::fs::read_to_string(&self.file)
            .map_err(|e| anyhow!("cannot read {}: {e}", self.file))?;
        evaluate_and_print(&self.common, &source)
    }
}

/// Evaluates an expression given on the command line.
#[derive(Parser)]
pub struct EvalCommand {
    #[command(flatten)]
    common: CommonOptions,

    /// The expression to evaluate.
    expression: String,
}

impl EvalCommand {
    pub fn execute(self) -> Result<()> {
        evaluate_and_print(&self.common, &self.expression)
    }
}

fn evaluate_and_print(common: &CommonOptions, source: &str) -> Result<()> {
    let entity = common.build_entity();
    let (result, violation) = entity.execute_source(source, common.constraints());
    if let Some(violation) = violation {
        log::warn!("execution constraints exceeded: {violation:?}");
    }
    println!("{}", result.unparse());
    Ok(())
}
