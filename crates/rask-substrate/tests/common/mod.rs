// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! A small FIFO scheduler over the substrate, shared by the scenario tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rask_substrate::{Handoff, RuntimeConfig, StackAllocator, TaskRef, Worker};

pub struct Shared {
    pub queue: Mutex<VecDeque<TaskRef>>,
    pub parked: Mutex<Vec<TaskRef>>,
    pub finished: Mutex<Vec<TaskRef>>,
    pub total: usize,
    pub done: AtomicUsize,
}

impl Shared {
    pub fn new(tasks: Vec<TaskRef>) -> Arc<Self> {
        Arc::new(Self {
            total: tasks.len(),
            queue: Mutex::new(tasks.into()),
            parked: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            done: AtomicUsize::new(0),
        })
    }

    /// Dead tasks, in completion order.
    pub fn take_finished(&self) -> Vec<TaskRef> {
        std::mem::take(&mut *self.finished.lock().unwrap())
    }
}

/// Round-robin over the shared queue. Parked tasks are woken once the queue
/// runs dry; the worker exits when every task has finished.
pub fn schedule(w: &mut Worker) -> ! {
    let shared = match w.attachment::<Arc<Shared>>() {
        Some(shared) => shared.clone(),
        None => w.exit(),
    };
    match w.take_handoff() {
        Some(Handoff::Yield(task)) => shared.queue.lock().unwrap().push_back(task),
        Some(Handoff::Park(task)) => shared.parked.lock().unwrap().push(task),
        Some(Handoff::Exit(task)) => {
            shared.finished.lock().unwrap().push(task);
            shared.done.fetch_add(1, Ordering::SeqCst);
        }
        None => {}
    }
    loop {
        let next = shared.queue.lock().unwrap().pop_front();
        if let Some(task) = next {
            drop(shared);
            w.resume(task);
        }
        if shared.done.load(Ordering::SeqCst) == shared.total {
            drop(shared);
            w.exit();
        }
        {
            let mut parked = shared.parked.lock().unwrap();
            if !parked.is_empty() {
                shared.queue.lock().unwrap().extend(parked.drain(..));
                continue;
            }
        }
        thread::yield_now();
    }
}

pub fn config() -> RuntimeConfig {
    RuntimeConfig::default().with_seed(0x5eed)
}

/// Run `shared` to completion on one worker on the current thread.
pub fn run_one(config: RuntimeConfig, allocator: Arc<dyn StackAllocator>, shared: &Arc<Shared>) -> Worker {
    let mut worker = Worker::new(0, config, allocator).unwrap();
    worker.attach(shared.clone());
    worker.run(schedule);
    worker
}

/// Run `shared` to completion on `n` workers, one OS thread each.
pub fn run_many(n: usize, config: RuntimeConfig, allocator: Arc<dyn StackAllocator>, shared: &Arc<Shared>) {
    let handles: Vec<_> = (0..n)
        .map(|id| {
            let config = config.clone();
            let allocator = allocator.clone();
            let shared = shared.clone();
            thread::spawn(move || {
                let mut worker = Worker::new(id, config, allocator).unwrap();
                worker.attach(shared);
                worker.run(schedule);
                worker.stats()
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
