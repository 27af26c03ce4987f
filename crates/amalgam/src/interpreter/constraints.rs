//! Per-call execution budgets, enforced cooperatively between opcodes.

/// Which budget was exhausted first.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConstraintViolation {
    ExecutionStep,
    NodeAllocation,
    ExecutionDepth,
    ContainedEntitiesDepth,
}

/// A budget imposed on one interpreter call. Zero for any `max_*` field
/// means that resource is unconstrained.
#[derive(Clone, Debug, Default)]
pub struct InterpreterConstraints {
    /// Maximum opcodes executed.
    pub max_num_execution_steps: u64,
    pub cur_execution_step: u64,
    /// Maximum nodes allocated; after
    /// [`populate_performance_counters`](Self::populate_performance_counters)
    /// this is an absolute count the manager's usage is compared against.
    pub max_num_allocated_nodes: usize,
    /// Maximum opcode stack depth.
    pub max_opcode_execution_depth: usize,
    /// Maximum contained entities creatable under the constrained entity.
    pub max_num_contained_entities: usize,
    /// Maximum contained-entity nesting depth.
    pub max_contained_entity_depth: usize,
    /// Maximum length of a new entity id.
    pub max_entity_id_length: usize,
    /// Set when any budget is exhausted.
    pub constraints_exceeded: bool,
    pub constraint_violation: Option<ConstraintViolation>,
}

impl InterpreterConstraints {
    pub fn with_max_execution_steps(steps: u64) -> InterpreterConstraints {
        InterpreterConstraints {
            max_num_execution_steps: steps,
            ..InterpreterConstraints::default()
        }
    }

    pub fn constrained_execution_steps(&self) -> bool {
        self.max_num_execution_steps != 0
    }

    pub fn constrained_allocated_nodes(&self) -> bool {
        self.max_num_allocated_nodes != 0
    }

    pub fn constrained_opcode_execution_depth(&self) -> bool {
        self.max_opcode_execution_depth != 0
    }

    pub fn remaining_execution_steps(&self) -> u64 {
        self.max_num_execution_steps
            .saturating_sub(self.cur_execution_step)
    }

    fn exceed(&mut self, violation: ConstraintViolation) {
        self.constraints_exceeded = true;
        self.constraint_violation = Some(violation);
    }

    /// Derives a child budget from a parent's remaining resources.
    ///
    /// Order matters: each budget is first clamped to the parent's
    /// remainder, and only afterwards is `max_num_allocated_nodes` scaled
    /// by the number of active threads and offset by the nodes currently
    /// in use.
    pub fn populate_performance_counters(
        &mut self,
        parent: Option<&InterpreterConstraints>,
        used_nodes: usize,
        opcode_stack_depth: usize,
    ) {
        self.constraints_exceeded = false;

        if let Some(parent) = parent {
            if parent.constrained_execution_steps() {
                let remaining_steps = parent.remaining_execution_steps();
                if remaining_steps > 0 {
                    if self.constrained_execution_steps() {
                        self.max_num_execution_steps =
                            self.max_num_execution_steps.min(remaining_steps);
                    } else {
                        self.max_num_execution_steps = remaining_steps;
                    }
                } else {
                    // out of resources; ensure nothing will run (0 would
                    // mean unconstrained)
                    self.max_num_execution_steps = 1;
                    self.cur_execution_step = 1;
                    self.exceed(ConstraintViolation::ExecutionStep);
                }
            }

            if parent.constrained_allocated_nodes() {
                let remaining_allocs = parent.max_num_allocated_nodes.saturating_sub(used_nodes);
                if remaining_allocs > 0 {
                    if self.constrained_allocated_nodes() {
                        self.max_num_allocated_nodes =
                            self.max_num_allocated_nodes.min(remaining_allocs);
                    } else {
                        self.max_num_allocated_nodes = remaining_allocs;
                    }
                } else {
                    self.max_num_allocated_nodes = 1;
                    self.exceed(ConstraintViolation::NodeAllocation);
                }
            }

            if parent.constrained_opcode_execution_depth() {
                let remaining_depth = parent
                    .max_opcode_execution_depth
                    .saturating_sub(opcode_stack_depth);
                if remaining_depth > 0 {
                    if self.constrained_opcode_execution_depth() {
                        self.max_opcode_execution_depth =
                            self.max_opcode_execution_depth.min(remaining_depth);
                    } else {
                        self.max_opcode_execution_depth = remaining_depth;
                    }
                } else {
                    self.max_opcode_execution_depth = 1;
                    self.exceed(ConstraintViolation::ExecutionDepth);
                }
            }

            if self.max_num_contained_entities == 0 {
                self.max_num_contained_entities = parent.max_num_contained_entities;
            }
            if self.max_contained_entity_depth == 0 {
                self.max_contained_entity_depth = parent.max_contained_entity_depth;
            }
            if self.max_entity_id_length == 0 {
                self.max_entity_id_length = parent.max_entity_id_length;
            }
        }

        if self.constrained_allocated_nodes() {
            // other threads eat into the same arena, so scale by the number
            // currently active, then make the budget absolute
            self.max_num_allocated_nodes = self
                .max_num_allocated_nodes
                .saturating_mul(crate::concurrency::num_active_threads().max(1) as usize);
            self.max_num_allocated_nodes = self.max_num_allocated_nodes.saturating_add(used_nodes);
        }
    }

    /// Checks every budget, recording the first violation. Called between
    /// opcodes; enforcement is cooperative.
    pub fn are_execution_resources_exhausted(
        &mut self,
        used_nodes: usize,
        opcode_stack_depth: usize,
        increment_step: bool,
    ) -> bool {
        if increment_step {
            self.cur_execution_step += 1;
        }

        if self.constrained_execution_steps()
            && self.cur_execution_step > self.max_num_execution_steps
        {
            self.exceed(ConstraintViolation::ExecutionStep);
        }
        if self.constrained_allocated_nodes() && used_nodes > self.max_num_allocated_nodes {
            self.exceed(ConstraintViolation::NodeAllocation);
        }
        if self.constrained_opcode_execution_depth()
            && opcode_stack_depth > self.max_opcode_execution_depth
        {
            self.exceed(ConstraintViolation::ExecutionDepth);
        }
        self.constraints_exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_exhaust_and_flag() {
        let mut constraints = InterpreterConstraints::with_max_execution_steps(3);
        for _ in 0..3 {
            assert!(!constraints.are_execution_resources_exhausted(0, 0, true));
        }
        assert!(constraints.are_execution_resources_exhausted(0, 0, true));
        assert_eq!(
            constraints.constraint_violation,
            Some(ConstraintViolation::ExecutionStep)
        );
    }

    #[test]
    fn child_clamps_to_parent_remainder() {
        let mut parent = InterpreterConstraints::with_max_execution_steps(100);
        parent.cur_execution_step = 90;

        let mut child = InterpreterConstraints::with_max_execution_steps(50);
        child.populate_performance_counters(Some(&parent), 0, 0);
        assert_eq!(child.max_num_execution_steps, 10);

        let mut unconstrained = InterpreterConstraints::default();
        unconstrained.populate_performance_counters(Some(&parent), 0, 0);
        assert_eq!(unconstrained.max_num_execution_steps, 10);
    }

    #[test]
    fn exhausted_parent_poisons_child() {
        let mut parent = InterpreterConstraints::with_max_execution_steps(10);
        parent.cur_execution_step = 10;

        let mut child = InterpreterConstraints::with_max_execution_steps(50);
        child.populate_performance_counters(Some(&parent), 0, 0);
        assert!(child.constraints_exceeded);
        assert_eq!(
            child.constraint_violation,
            Some(ConstraintViolation::ExecutionStep)
        );
    }

    #[test]
    fn allocation_budget_scales_after_clamping() {
        let parent = InterpreterConstraints {
            max_num_allocated_nodes: 1000,
            ..InterpreterConstraints::default()
        };
        let mut child = InterpreterConstraints {
            max_num_allocated_nodes: 600,
            ..InterpreterConstraints::default()
        };
        // clamp to min(600, 1000 - 100) = 600, scale by >= 1 active
        // thread, then offset by the 100 nodes in use
        child.populate_performance_counters(Some(&parent), 100, 0);
        assert!(child.max_num_allocated_nodes >= 700);
    }
}
