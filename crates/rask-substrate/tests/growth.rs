// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Frame-stack growth under a running task.

mod common;

use std::sync::{Arc, Mutex};

use common::{config, run_one, Shared};
use rask_substrate::{FrameLayout, HeapAllocator, RuntimeConfig, StackAddr, TaskCx, TaskRef};

/// locals: 0 = n, 1 = child's result, 2 = stage, 3 = address of local 1.
const SUM_FRAME: FrameLayout = FrameLayout::new(4).with_pointer(3);

/// Sum 1..=n by explicit call/return on the frame stack: one frame per
/// level, results written through each frame's argp. Yields every
/// `yield_every` calls when non-zero.
fn sum_on_frames(cx: &mut TaskCx, n: usize, yield_every: usize) -> usize {
    cx.push_frame(FrameLayout::new(1), StackAddr::NULL);
    let result = cx.frames().slot_addr(0).unwrap();
    cx.push_frame(SUM_FRAME, result);
    cx.frames_mut().set_local(0, n).unwrap();

    let mut calls = 0usize;
    loop {
        let frames = cx.frames_mut();
        let n = frames.local(0).unwrap();
        let stage = frames.local(2).unwrap();
        let ret = if n == 0 {
            Some(0)
        } else if stage == 0 {
            frames.set_local(2, 1).unwrap();
            let own = frames.slot_addr(1).unwrap();
            frames.set_local(3, own.0).unwrap();
            cx.push_frame(SUM_FRAME, own);
            cx.frames_mut().set_local(0, n - 1).unwrap();
            calls += 1;
            if yield_every != 0 && calls % yield_every == 0 {
                cx.yield_now();
            }
            None
        } else {
            // Read the child's result through the relocated pointer local.
            let child = frames.load(StackAddr(frames.local(3).unwrap()));
            assert_eq!(child, frames.local(1).unwrap());
            Some(n + child)
        };
        if let Some(value) = ret {
            let argp = cx.frames().argp().unwrap();
            cx.frames_mut().store(argp, value);
            cx.pop_frame();
            if cx.frames().depth() == 1 {
                break;
            }
        }
    }
    let total = cx.frames().local(0).unwrap();
    cx.pop_frame();
    total
}

/// Guard 64, 128-byte initial stack: the root frame fits, the first
/// call frame does not.
fn one_frame_budget() -> RuntimeConfig {
    config().with_stack_guard(64).with_frame_stack(128, 1 << 30)
}

struct Outcome {
    total: usize,
    growths: u32,
    final_size: usize,
}

fn run_sum(config: RuntimeConfig, n: usize, yield_every: usize, tasks: usize) -> (Vec<Outcome>, u64) {
    let alloc = Arc::new(HeapAllocator);
    let results = Arc::new(Mutex::new(Vec::new()));
    let spawned: Vec<TaskRef> = (0..tasks)
        .map(|_| {
            let results = results.clone();
            TaskRef::spawn(&config, alloc.clone(), move |cx| {
                let total = sum_on_frames(cx, n, yield_every);
                let frames = cx.frames();
                results.lock().unwrap().push(Outcome {
                    total,
                    growths: frames.growths(),
                    final_size: frames.size(),
                });
            })
            .unwrap()
        })
        .collect();
    let shared = Shared::new(spawned);
    let worker = run_one(config, alloc, &shared);
    for task in shared.take_finished() {
        assert!(task.panic_message().is_none(), "{:?}", task.panic_message());
    }
    let outcomes = std::mem::take(&mut *results.lock().unwrap());
    (outcomes, worker.stats().growths)
}

#[test_log::test]
fn deep_sum_grows_from_one_frame() {
    let (outcomes, growths) = run_sum(one_frame_budget(), 10_000, 0, 1);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].total, 50_005_000);
    assert!(outcomes[0].growths >= 1);
    assert!(outcomes[0].final_size >= 10_000 * SUM_FRAME.bytes());
    assert_eq!(growths, outcomes[0].growths as u64);
}

#[test]
fn grown_and_ungrown_runs_agree() {
    let roomy = config().with_frame_stack(1 << 20, 1 << 30);
    for n in [0usize, 1, 2, 17, 1000, 5000] {
        let (grown, _) = run_sum(one_frame_budget(), n, 0, 1);
        let (flat, growths) = run_sum(roomy.clone(), n, 0, 1);
        assert_eq!(grown[0].total, flat[0].total, "n = {n}");
        assert_eq!(grown[0].total, n * (n + 1) / 2);
        assert_eq!(flat[0].growths, 0);
        assert_eq!(growths, 0);
    }
}

#[test]
fn interleaved_tasks_grow_independently() {
    let (outcomes, growths) = run_sum(one_frame_budget(), 3000, 97, 3);
    assert_eq!(outcomes.len(), 3);
    for o in &outcomes {
        assert_eq!(o.total, 3000 * 3001 / 2);
        assert!(o.growths >= 1);
    }
    let per_task: u64 = outcomes.iter().map(|o| o.growths as u64).sum();
    assert_eq!(growths, per_task);
}

#[test]
fn ensure_stack_space_preflights_growth() {
    let alloc = Arc::new(HeapAllocator);
    let seen = Arc::new(Mutex::new(None));
    let out = seen.clone();
    let config = one_frame_budget();
    let task = TaskRef::spawn(&config, alloc.clone(), move |cx| {
        let before = cx.frames().size();
        cx.ensure_stack_space(16 * 1024);
        let after = cx.frames().size();
        cx.ensure_stack_space(1024);
        *out.lock().unwrap() = Some((before, after, cx.frames().size(), cx.frames().growths()));
    })
    .unwrap();
    let shared = Shared::new(vec![task]);
    run_one(config, alloc, &shared);
    let (before, after, last, growths) = seen.lock().unwrap().take().unwrap();
    assert_eq!(before, 128);
    assert!(after >= 16 * 1024 + 64);
    assert_eq!(last, after);
    assert_eq!(growths, 1);
}

#[test]
fn call_argp_follows_the_frames_when_they_move() {
    let alloc = Arc::new(HeapAllocator);
    let seen = Arc::new(Mutex::new(None));
    let out = seen.clone();
    let config = one_frame_budget();
    let task = TaskRef::spawn(&config, alloc.clone(), move |cx| {
        cx.push_frame(FrameLayout::new(1), StackAddr::NULL);
        let before = cx.frames().slot_addr(0).unwrap();
        // Does not fit in the 128-byte budget: grows, then pushes.
        cx.push_frame(FrameLayout::new(4), before);
        let argp = cx.frames().argp().unwrap();
        let inside = cx.frames().bounds().contains(argp.0);
        cx.frames_mut().store(argp, 99);
        cx.pop_frame();
        let value = cx.frames().local(0).unwrap();
        *out.lock().unwrap() = Some((before, argp, inside, value, cx.frames().growths()));
        cx.pop_frame();
    })
    .unwrap();
    let shared = Shared::new(vec![task]);
    run_one(config, alloc, &shared);
    let (before, argp, inside, value, growths) = seen.lock().unwrap().take().unwrap();
    assert_eq!(growths, 1);
    assert_ne!(argp, before);
    assert!(inside);
    assert_eq!(value, 99);
}
