//! Signal listener
//!
//! One thread inside the copy's scope waits on SIGINT, SIGQUIT, SIGPIPE,
//! SIGUSR1 and SIGUSR2 and acts on them against the shared collection. It
//! is closed once every worker has been joined.

use super::Collection;
use crossbeam::thread::Scope;
use signal_hook::consts::signal::{SIGINT, SIGPIPE, SIGQUIT, SIGUSR1, SIGUSR2};
use signal_hook::iterator::{Handle, Signals};
use std::time::Instant;
use tracing::{debug, warn};

const LISTENED: [libc::c_int; 5] = [SIGINT, SIGQUIT, SIGPIPE, SIGUSR1, SIGUSR2];

/// Handle to the running listener
pub struct Listener {
    handle: Handle,
}

impl Listener {
    /// Stop listening; the thread exits and is joined with the scope
    pub fn close(self) {
        self.handle.close();
    }
}

/// What the listener did with one signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Response {
    Stopped,
    Reported,
    ReportedAndWoke,
    /// Reported, then the default action is due
    Terminate,
    Ignored,
}

fn report(coll: &Collection, start: Instant, prefix: &str) {
    let snap = coll.snapshot(Some(start.elapsed()));
    snap.print_throughput(true);
    snap.print_stats(prefix);
}

pub(crate) fn respond(coll: &Collection, sig: libc::c_int, start: Instant) -> Response {
    match sig {
        SIGINT => {
            debug!("SIGINT, stopping both directions");
            coll.stop_both();
            Response::Stopped
        }
        SIGUSR1 => {
            eprintln!("Progress report, continuing ...");
            report(coll, start, "  ");
            Response::Reported
        }
        SIGUSR2 => {
            eprintln!("Progress report, continuing ...");
            report(coll, start, "  ");
            eprintln!("Send broadcast on out_sync_cv condition variable");
            coll.broadcast();
            Response::ReportedAndWoke
        }
        SIGQUIT | SIGPIPE => {
            eprintln!("Interrupted by signal,");
            report(coll, start, "");
            Response::Terminate
        }
        _ => Response::Ignored,
    }
}

/// Start listening inside `scope`
///
/// Returns `None` (after a warning) when the handlers can't be installed;
/// the copy then runs without them.
pub fn spawn<'env>(scope: &Scope<'env>, coll: &'env Collection, start: Instant) -> Option<Listener> {
    let mut signals = match Signals::new(LISTENED) {
        Ok(s) => s,
        Err(e) => {
            warn!("unable to install signal handlers: {}", e);
            return None;
        }
    };
    let handle = signals.handle();
    let spawned = scope
        .builder()
        .name("sgcopy-signals".to_string())
        .spawn(move |_| {
            for sig in signals.forever() {
                if respond(coll, sig, start) == Response::Terminate {
                    if let Err(e) = signal_hook::low_level::emulate_default_handler(sig) {
                        warn!("unable to take default action for signal {}: {}", sig, e);
                    }
                }
            }
        });
    match spawned {
        Ok(_) => Some(Listener { handle }),
        Err(e) => {
            warn!("unable to start signal listener: {}", e);
            handle.close();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CopyConfig;
    use crate::target::{Endpoint, Endpoints};

    fn collection() -> Collection {
        let endpoints = Endpoints {
            input: Endpoint::Discard,
            output: Endpoint::Discard,
            mirror: None,
            record: None,
        };
        Collection::new(CopyConfig::default(), endpoints, 8)
    }

    #[test]
    fn test_sigint_stops_both_sides() {
        let coll = collection();
        assert_eq!(respond(&coll, SIGINT, Instant::now()), Response::Stopped);
        assert!(coll.lock_read().stop);
        assert!(coll.lock_write().stop);
    }

    #[test]
    fn test_sigint_wakes_gated_writers() {
        let coll = collection();
        crossbeam::thread::scope(|s| {
            let waiters: Vec<_> = (1..4u64)
                .map(|i| {
                    let coll = &coll;
                    s.spawn(move |_| coll.wait_for_turn(coll.lock_write(), i * 4).stop)
                })
                .collect();
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert_eq!(respond(&coll, SIGINT, Instant::now()), Response::Stopped);
            for w in waiters {
                assert!(w.join().unwrap());
            }
        })
        .unwrap();
        assert_eq!(coll.lock_write().next_block, 0);
    }

    #[test]
    fn test_progress_signals_keep_running() {
        let coll = collection();
        assert_eq!(respond(&coll, SIGUSR1, Instant::now()), Response::Reported);
        assert_eq!(respond(&coll, SIGUSR2, Instant::now()), Response::ReportedAndWoke);
        assert!(!coll.lock_read().stop);
        assert!(!coll.lock_write().stop);
    }

    #[test]
    fn test_quit_asks_for_default_action() {
        let coll = collection();
        assert_eq!(respond(&coll, SIGQUIT, Instant::now()), Response::Terminate);
        assert_eq!(respond(&coll, SIGPIPE, Instant::now()), Response::Terminate);
        assert_eq!(respond(&coll, libc::SIGHUP, Instant::now()), Response::Ignored);
    }
}
