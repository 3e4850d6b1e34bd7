//! Plan assembly scenarios
//!
//! End-to-end checks of the command-buffer rewrite: threshold boundaries,
//! interleaved capturable/non-capturable patterns, and the dispatch listing.

use despachar::{assemble, CommandBufferConfig, DispatchUnit, Operation, Program};

fn custom_calls(n: usize) -> Vec<Operation> {
    (0..n)
        .map(|i| Operation::custom_call(format!("kernel-{i}").into_bytes()))
        .collect()
}

fn assemble_default(ops: Vec<Operation>) -> despachar::ExecutionPlan {
    assemble(Program::new(ops).unwrap(), &CommandBufferConfig::default())
}

// ============================================================================
// Threshold behavior
// ============================================================================

#[test]
fn test_five_custom_calls_become_one_command_buffer() {
    // Five back-to-back capturable custom calls is exactly enough to batch.
    let plan = assemble_default(custom_calls(5));
    assert_eq!(plan.len(), 1);
    assert!(plan.units()[0].is_command_buffer());
    assert_eq!(plan.units()[0].op_count(), 5);
}

#[test]
fn test_four_custom_calls_stay_individual() {
    let plan = assemble_default(custom_calls(4));
    assert_eq!(plan.len(), 4);
    assert!(plan.units().iter().all(|u| !u.is_command_buffer()));
}

#[test]
fn test_threshold_boundary_is_inclusive() {
    for n in 1..=10 {
        let plan = assemble(
            Program::new(custom_calls(n)).unwrap(),
            &CommandBufferConfig::with_min_batch_size(5),
        );
        if n >= 5 {
            assert_eq!(plan.len(), 1, "run of {n} should batch");
        } else {
            assert_eq!(plan.len(), n, "run of {n} should pass through");
        }
    }
}

#[test]
fn test_custom_threshold_is_respected() {
    let plan = assemble(
        Program::new(custom_calls(3)).unwrap(),
        &CommandBufferConfig::with_min_batch_size(3),
    );
    assert_eq!(plan.len(), 1);
    assert!(plan.units()[0].is_command_buffer());
}

// ============================================================================
// Interleaved patterns
// ============================================================================

#[test]
fn test_barrier_between_runs() {
    // 6 capturable | barrier | 6 capturable: two groups around one single
    let mut ops = custom_calls(6);
    ops.push(Operation::built_in().capturable(false));
    ops.extend(custom_calls(6));
    let plan = assemble_default(ops);

    assert_eq!(plan.len(), 3);
    assert!(plan.units()[0].is_command_buffer());
    assert!(!plan.units()[1].is_command_buffer());
    assert!(plan.units()[2].is_command_buffer());
}

#[test]
fn test_short_runs_between_barriers_never_batch() {
    let mut ops = Vec::new();
    for _ in 0..4 {
        ops.extend(custom_calls(2));
        ops.push(Operation::built_in().capturable(false));
    }
    let plan = assemble_default(ops);
    assert_eq!(plan.len(), 12);
    assert!(plan.units().iter().all(|u| !u.is_command_buffer()));
}

#[test]
fn test_capturable_built_ins_join_groups() {
    // Built-in operations marked capturable count toward a run.
    let mut ops = custom_calls(3);
    ops.push(Operation::built_in());
    ops.push(Operation::built_in());
    let plan = assemble_default(ops);
    assert_eq!(plan.len(), 1);
    assert_eq!(plan.units()[0].op_count(), 5);
}

#[test]
fn test_flattening_recovers_original_sequence() {
    let mut ops = custom_calls(7);
    ops.push(Operation::built_in().capturable(false));
    ops.extend(custom_calls(2));
    ops.push(Operation::built_in());
    let total = ops.len();
    let plan = assemble_default(ops);

    let ids: Vec<usize> = plan.flatten().iter().map(|op| op.id()).collect();
    assert_eq!(ids, (0..total).collect::<Vec<_>>());
}

#[test]
fn test_groups_are_contiguous_id_ranges() {
    let mut ops = custom_calls(5);
    ops.push(Operation::built_in().capturable(false));
    ops.extend(custom_calls(6));
    let plan = assemble_default(ops);

    for unit in plan.units() {
        if let DispatchUnit::CommandBuffer(members) = unit {
            let ids: Vec<usize> = members.iter().map(|op| op.id()).collect();
            for pair in ids.windows(2) {
                assert_eq!(pair[1], pair[0] + 1, "group members must be contiguous");
            }
        }
    }
}

// ============================================================================
// Dispatch listing
// ============================================================================

#[test]
fn test_listing_for_mixed_plan() {
    let mut ops = custom_calls(5);
    ops.push(Operation::built_in().capturable(false));
    ops.push(Operation::custom_call(b"tail".to_vec()));
    let plan = assemble_default(ops);

    let listing = plan.render();
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "000: command-buffer [0, 1, 2, 3, 4]");
    assert_eq!(lines[1], "001: built-in id=5");
    assert_eq!(lines[2], "002: custom-call id=6");
}

#[test]
fn test_listing_empty_plan_is_empty() {
    let plan = assemble_default(Vec::new());
    assert!(plan.render().is_empty());
}
