//! Library support for the `amalgam` command-line interface.

pub mod commands;

use amalgam::{Entity, InterpreterConstraints, Permissions};
use clap::Parser;
use std::sync::Arc;

/// Options shared by the CLI commands that evaluate code.
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonOptions {
    /// Random seed for the root entity.
    #[arg(long, default_value = "")]
    pub rand_seed: String,

    /// Maximum number of opcodes to execute (0 = unconstrained).
    #[arg(long, default_value_t = 0)]
    pub max_execution_steps: u64,

    /// Maximum number of nodes to allocate (0 = unconstrained).
    #[arg(long, default_value_t = 0)]
    pub max_allocated_nodes: usize,

    /// Maximum opcode nesting depth (0 = unconstrained).
    #[arg(long, default_value_t = 0)]
    pub max_opcode_depth: usize,

    /// Maximum number of active threads (0 = hardware concurrency).
    #[arg(long, default_value_t = 0)]
    pub threads: i32,

    /// Run without side-effect permissions.
    #[arg(long)]
    pub sandbox: bool,
}

impl CommonOptions {
    /// Builds the root entity these options describe.
    pub fn build_entity(&self) -> Arc<Entity> {
        if self.threads != 0 {
            amalgam::concurrency::set_max_num_threads(self.threads);
        }
        let entity = Entity::new(&self.rand_seed);
        if !self.sandbox {
            entity.set_permissions(Permissions::all_permissions());
        }
        entity
    }

    /// The execution constraints these options describe, if any.
    pub fn constraints(&self) -> Option<InterpreterConstraints> {
        if self.max_execution_steps == 0
            && self.max_allocated_nodes == 0
            && self.max_opcode_depth == 0
        {
            return None;
        }
        Some(InterpreterConstraints {
            max_num_execution_steps: self.max_execution_steps,
            max_num_allocated_nodes: self.max_allocated_nodes,
            max_opcode_execution_depth: self.max_opcode_depth,
            ..InterpreterConstraints::default()
        })
    }
}
