// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for dispatch selection
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; drives `select_next` over generated run tables.
//!
//! TEST_SCOPE:
//!   - Selection only returns eligible threads and finds one whenever one exists
//!   - Round robin reaches every READY thread within N decisions
//!   - Threads never run on a core other than the one they first ran on

use alloc::{collections::BTreeSet, vec::Vec};

use proptest::prelude::*;

use super::{select_next, Candidate, RunView};
use crate::{
    task::{RunState, ThreadRef},
    types::{CpuId, Pid, Tid},
};

#[derive(Clone, Debug)]
struct Table {
    runnable: Vec<bool>,
    threads: Vec<Vec<Candidate>>,
}

impl RunView for Table {
    fn process_count(&self) -> usize {
        self.threads.len()
    }

    fn process_runnable(&self, index: usize) -> bool {
        self.runnable[index]
    }

    fn thread_count(&self, index: usize) -> usize {
        self.threads[index].len()
    }

    fn thread_at(&self, index: usize, slot: usize) -> Option<Candidate> {
        self.threads.get(index)?.get(slot).copied()
    }
}

impl Table {
    fn eligible(&self, cpu: CpuId) -> Vec<ThreadRef> {
        self.threads
            .iter()
            .enumerate()
            .filter(|(index, _)| self.runnable[*index])
            .flat_map(|(_, threads)| threads.iter())
            .filter(|c| c.eligible_on(cpu))
            .map(|c| c.id)
            .collect()
    }
}

fn arb_state() -> impl Strategy<Value = RunState> {
    prop_oneof![
        4 => Just(RunState::Ready),
        1 => Just(RunState::Running),
        1 => Just(RunState::Blocked),
        1 => Just(RunState::Killed),
    ]
}

fn arb_cpu() -> impl Strategy<Value = Option<CpuId>> {
    prop_oneof![3 => Just(None), 1 => (0u16..4).prop_map(|c| Some(CpuId::from_raw(c)))]
}

fn arb_table() -> impl Strategy<Value = Table> {
    prop::collection::vec(
        (any::<bool>(), prop::collection::vec((arb_state(), arb_cpu(), arb_cpu()), 0..5)),
        0..6,
    )
    .prop_map(|processes| {
        let mut runnable = Vec::new();
        let mut threads = Vec::new();
        for (index, (is_runnable, slots)) in processes.into_iter().enumerate() {
            runnable.push(is_runnable);
            threads.push(
                slots
                    .into_iter()
                    .enumerate()
                    .map(|(slot, (state, last_cpu, on_cpu))| Candidate {
                        id: ThreadRef::new(
                            Pid::from_raw(index as u32 + 1),
                            Tid::from_raw(slot as u32 + 1),
                        ),
                        state,
                        last_cpu,
                        on_cpu,
                    })
                    .collect(),
            );
        }
        Table { runnable, threads }
    })
}

fn all_ready(shape: &[usize]) -> Table {
    let threads: Vec<Vec<Candidate>> = shape
        .iter()
        .enumerate()
        .map(|(index, count)| {
            (0..*count)
                .map(|slot| Candidate {
                    id: ThreadRef::new(Pid::from_raw(index as u32 + 1), Tid::from_raw(slot as u32 + 1)),
                    state: RunState::Ready,
                    last_cpu: None,
                    on_cpu: None,
                })
                .collect()
        })
        .collect();
    Table { runnable: alloc::vec![true; threads.len()], threads }
}

proptest! {
    #[test]
    fn selection_is_eligible_and_complete(table in arb_table(), cpu in 0u16..4, pick in any::<prop::sample::Index>()) {
        let cpu = CpuId::from_raw(cpu);
        let eligible = table.eligible(cpu);
        let every: Vec<ThreadRef> = table.threads.iter().flatten().map(|c| c.id).collect();
        let current = if every.is_empty() { None } else { Some(every[pick.index(every.len())]) };
        for start in [None, current] {
            match select_next(&table, cpu, start) {
                Some(next) => prop_assert!(eligible.contains(&next)),
                None => prop_assert!(eligible.is_empty()),
            }
        }
    }

    #[test]
    fn round_robin_reaches_every_ready_thread(shape in prop::collection::vec(0usize..4, 1..6)) {
        let table = all_ready(&shape);
        let total: usize = shape.iter().sum();
        let mut seen = BTreeSet::new();
        let mut current = None;
        for _ in 0..total {
            current = select_next(&table, CpuId::BOOT, current);
            if let Some(id) = current {
                seen.insert(id);
            }
        }
        prop_assert_eq!(seen.len(), total);
    }

    #[test]
    fn foreign_threads_are_never_selected(table in arb_table()) {
        let cpu = CpuId::from_raw(1);
        if let Some(next) = select_next(&table, cpu, None) {
            let picked = table.threads.iter().flatten().find(|c| c.id == next).copied();
            prop_assert!(picked.is_some());
            let picked = picked.unwrap();
            prop_assert!(picked.last_cpu.map_or(true, |last| last == cpu));
            prop_assert!(picked.on_cpu.is_none());
        }
    }
}
