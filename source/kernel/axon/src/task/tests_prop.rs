// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the lifecycle machine and PID leases
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Random transition sequences never leave KILLED and never enter SLEEPING
//!   - Rejected transitions leave the state unchanged
//!   - Live PID leases are unique, non-zero and bounded by the limit
//!   - Dropped leases make their PID available again

use alloc::{collections::BTreeSet, vec::Vec};

use proptest::prelude::*;

use super::{pid::PidAllocator, Priority, RunState, TaskError, Thread};
use crate::types::{Pid, Tid};

extern "C" fn noop(_arg: usize) {}

fn arb_state() -> impl Strategy<Value = RunState> {
    prop_oneof![
        Just(RunState::Initial),
        Just(RunState::Ready),
        Just(RunState::Running),
        Just(RunState::Blocked),
        Just(RunState::Sleeping),
        Just(RunState::Killed),
    ]
}

#[derive(Clone, Debug)]
enum PidOp {
    Allocate,
    Release(usize),
}

fn arb_pid_op() -> impl Strategy<Value = PidOp> {
    prop_oneof![
        2 => Just(PidOp::Allocate),
        1 => any::<usize>().prop_map(PidOp::Release),
    ]
}

proptest! {
    #[test]
    fn transitions_follow_the_machine(steps in prop::collection::vec(arb_state(), 0..40)) {
        let mut thread = Thread::new_kernel(Pid::from_raw(1), Tid::from_raw(1), noop, 0, Priority::Mid, 256);
        let mut killed = false;
        for next in steps {
            let before = thread.state();
            let result = thread.transition(next);
            if before.can_transition_to(next) {
                prop_assert_eq!(result, Ok(()));
                prop_assert_eq!(thread.state(), next);
            } else {
                prop_assert_eq!(result, Err(TaskError::InvalidTransition));
                prop_assert_eq!(thread.state(), before);
            }
            prop_assert_ne!(thread.state(), RunState::Sleeping);
            if killed {
                prop_assert_eq!(thread.state(), RunState::Killed);
            }
            killed |= thread.state() == RunState::Killed;
        }
    }

    #[test]
    fn pid_leases_are_unique_and_recycled(limit in 2usize..64, ops in prop::collection::vec(arb_pid_op(), 0..128)) {
        let pids = PidAllocator::new(limit);
        let mut live = Vec::new();
        for op in ops {
            match op {
                PidOp::Allocate => match pids.allocate() {
                    Some(lease) => live.push(lease),
                    None => prop_assert_eq!(live.len(), limit - 1),
                },
                PidOp::Release(pick) if !live.is_empty() => {
                    let lease = live.swap_remove(pick % live.len());
                    let pid = lease.pid();
                    drop(lease);
                    prop_assert!(!pids.in_use(pid));
                }
                PidOp::Release(_) => {}
            }
            let unique: BTreeSet<u32> = live.iter().map(|l| l.pid().as_raw()).collect();
            prop_assert_eq!(unique.len(), live.len());
            prop_assert!(!unique.contains(&0));
            prop_assert!(unique.iter().all(|raw| (*raw as usize) < limit));
        }
    }
}
