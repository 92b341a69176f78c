//! Worker pool
//!
//! Workers run as scoped threads borrowing the collection. The first
//! worker is started alone and must get one segment through (or give up)
//! before the others follow, so setup problems show up once rather than
//! once per thread.

use super::Worker;
use crate::coordinator::Collection;
use crate::error::{exit, exit_status_of};
use crossbeam::thread::{Scope, ScopedJoinHandle};
use tracing::{debug, error};

fn spawn<'scope, 'env>(
    scope: &'scope Scope<'env>,
    coll: &'env Collection,
    id: usize,
) -> std::io::Result<ScopedJoinHandle<'scope, ()>> {
    scope
        .builder()
        .name(format!("sgcopy-worker-{}", id))
        .spawn(move |_| match Worker::new(id, coll) {
            Ok(worker) => worker.run(),
            Err(e) => {
                error!("worker {}: {:#}", id, e);
                coll.exit.record(exit_status_of(&e));
                coll.stop_both();
                coll.settle();
            }
        })
}

/// Run `threads` workers to completion
pub fn run<'env>(scope: &Scope<'env>, coll: &'env Collection, threads: usize) {
    let mut handles = Vec::with_capacity(threads);

    let guard = coll.lock_write();
    match spawn(scope, coll, 0) {
        Ok(h) => handles.push(h),
        Err(e) => {
            drop(guard);
            error!("unable to start worker thread: {}", e);
            coll.exit.record(exit::OTHER);
            coll.stop_both();
            return;
        }
    }
    let guard = coll.wait_settled(guard);
    let stopped = guard.stop;
    drop(guard);
    debug!(stopped, "shakedown complete");

    if !stopped {
        for id in 1..threads {
            match spawn(scope, coll, id) {
                Ok(h) => handles.push(h),
                Err(e) => {
                    error!("unable to start worker thread {}: {}", id, e);
                    coll.exit.record(exit::OTHER);
                    coll.stop_both();
                    break;
                }
            }
        }
    }

    for handle in handles {
        if handle.join().is_err() {
            error!("worker thread panicked");
            coll.exit.record(exit::OTHER);
        }
    }
}
