// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Handshakes between the engines of a launch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use crossbeam::utils::Backoff;

/// How often a blocked engine looks at the launch's abort signal.
const POLL: Duration = Duration::from_millis(20);

/// A peer engine unwound; the waiting engine stops too.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Aborted;

/// Raised once by the first engine that unwinds.
#[derive(Debug, Default)]
pub(crate) struct AbortSignal(AtomicBool);

impl AbortSignal {
    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Guard that raises the signal if the current thread panics.
    pub(crate) fn on_panic(&self) -> AbortOnPanic<'_> {
        AbortOnPanic(self)
    }
}

pub(crate) struct AbortOnPanic<'a>(&'a AbortSignal);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.raise();
        }
    }
}

/// Event flag with one setter and one waiter.
///
/// Set puts a token in a channel of capacity one; wait takes it out again,
/// which is what makes the flag reusable for the next tile. Setting a flag
/// that is already set does nothing.
pub(crate) struct CrossEngineFlag {
    name: &'static str,
    id: usize,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl CrossEngineFlag {
    pub(crate) fn new(name: &'static str, id: usize) -> Self {
        let (tx, rx) = bounded(1);
        CrossEngineFlag { name, id, tx, rx }
    }

    pub(crate) fn set(&self) {
        dprint!("flag {}[{}] set", self.name, self.id);
        let _ = self.tx.try_send(());
    }

    pub(crate) fn wait(&self, abort: &AbortSignal) -> Result<(), Aborted> {
        loop {
            match self.rx.recv_timeout(POLL) {
                Ok(()) => {
                    dprint!("flag {}[{}] taken", self.name, self.id);
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) if !abort.is_raised() => {}
                Err(_) => return Err(Aborted),
            }
        }
    }

    #[cfg(test)]
    fn is_set(&self) -> bool {
        !self.rx.is_empty()
    }
}

/// The ping-pong pair of one unit's epilogue staging slots.
///
/// The matrix engine waits `free[s]`, fills slot `s`, sets `ready[s]`; the
/// vector engine waits `ready[s]`, drains slot `s`, sets `free[s]`.
pub(crate) struct FlagPair {
    pub(crate) ready: [CrossEngineFlag; 2],
    pub(crate) free: [CrossEngineFlag; 2],
}

impl FlagPair {
    pub(crate) fn new(unit: usize) -> Self {
        let pair = FlagPair {
            ready: [CrossEngineFlag::new("ready", 2 * unit), CrossEngineFlag::new("ready", 2 * unit + 1)],
            free: [CrossEngineFlag::new("free", 2 * unit), CrossEngineFlag::new("free", 2 * unit + 1)],
        };
        // both slots start out empty
        pair.free[0].set();
        pair.free[1].set();
        pair
    }
}

/// One flag per unit, set once and read by any number of waiters.
pub(crate) struct CompletionFlags {
    flags: Vec<AtomicBool>,
}

impl CompletionFlags {
    pub(crate) fn new(units: usize) -> Self {
        CompletionFlags { flags: (0..units).map(|_| AtomicBool::new(false)).collect() }
    }

    pub(crate) fn set(&self, unit: usize) {
        self.flags[unit].store(true, Ordering::Release);
    }

    pub(crate) fn is_set(&self, unit: usize) -> bool {
        self.flags[unit].load(Ordering::Acquire)
    }

    pub(crate) fn wait(&self, unit: usize, abort: &AbortSignal) -> Result<(), Aborted> {
        let backoff = Backoff::new();
        while !self.is_set(unit) {
            if abort.is_raised() {
                return Err(Aborted);
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(50));
            } else {
                backoff.snooze();
            }
        }
        Ok(())
    }

    pub(crate) fn wait_all(&self, abort: &AbortSignal) -> Result<(), Aborted> {
        for unit in 0..self.flags.len() {
            self.wait(unit, abort)?;
        }
        Ok(())
    }
}

/// Every flag of one launch.
pub(crate) struct LaunchFlags {
    pub(crate) pairs: Vec<FlagPair>,
    /// Vector engine of each unit finished reformatting its share.
    pub(crate) prologue: CompletionFlags,
    /// Matrix engine of each unit wrote all its partial tiles.
    pub(crate) matrix_done: CompletionFlags,
    pub(crate) abort: AbortSignal,
}

impl LaunchFlags {
    pub(crate) fn new(units: usize) -> Self {
        LaunchFlags {
            pairs: (0..units).map(FlagPair::new).collect(),
            prologue: CompletionFlags::new(units),
            matrix_done: CompletionFlags::new(units),
            abort: AbortSignal::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_toggles() {
        let abort = AbortSignal::default();
        let flag = CrossEngineFlag::new("t", 0);
        assert!(!flag.is_set());
        flag.set();
        flag.set();
        assert!(flag.is_set());
        flag.wait(&abort).unwrap();
        assert!(!flag.is_set());
    }

    #[test]
    fn ping_pong_between_threads() {
        let abort = AbortSignal::default();
        let pair = FlagPair::new(0);
        let mut log = Vec::new();
        crossbeam::scope(|s| {
            s.spawn(|_| {
                for tile in 0..6 {
                    let slot = tile % 2;
                    pair.ready[slot].wait(&abort).unwrap();
                    pair.free[slot].set();
                }
            });
            for tile in 0..6 {
                let slot = tile % 2;
                pair.free[slot].wait(&abort).unwrap();
                log.push(tile);
                pair.ready[slot].set();
            }
        }).unwrap();
        assert_eq!(log, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn abort_releases_waiters() {
        let abort = AbortSignal::default();
        let flag = CrossEngineFlag::new("t", 0);
        let done = CompletionFlags::new(2);
        done.set(0);
        crossbeam::scope(|s| {
            s.spawn(|_| {
                let _guard = abort.on_panic();
                if !abort.is_raised() {
                    panic!("engine failure");
                }
            });
        }).unwrap_err();
        assert!(abort.is_raised());
        assert_eq!(flag.wait(&abort), Err(Aborted));
        assert_eq!(done.wait_all(&abort), Err(Aborted));
        assert!(done.is_set(0));
    }
}
