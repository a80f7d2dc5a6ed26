// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The local lock table: write combining and read delegation.
//!
//! Keyed by a hash of the user key. While a leader is driving a remote
//! write for key `k`, later local writers of `k` deposit their value
//! into the leader's combine slot and suspend; the leader re-reads the
//! slot right before its remote write, so the last deposited value wins
//! exactly as if the writers had run back to back. Reads delegate
//! symmetrically: the first reader fans its result out to everyone who
//! arrived while it was in flight.
//!
//! This is a performance mechanism, not a correctness one; the remote
//! latch protocol stands on its own.

use crate::{error::Error, key::Key, layout::LOCAL_LOCK_N, value::Value};
use rustc_hash::FxHasher;
use std::{
    hash::{Hash, Hasher},
    sync::{Arc, Condvar, Mutex},
};

/// Which write operation a leader is driving. An upsert may absorb any
/// same-key write, but a strict update may only absorb other updates: an
/// upsert folded into a failing update would be lost.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Upsert,
    Strict,
}

/// What the leader's remote write amounted to, relayed to every
/// follower whose value was combined into it. Combining must behave as
/// if the writes ran back to back, so a follower has to see the same
/// failure its write actually met, not an unconditional success.
///
/// Mirrors [`enum@Error`] minus the non-clonable payloads (an
/// `std::io::Error` keeps only its kind).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// The remote write was applied.
    Applied,
    /// Strict update of a key that does not exist.
    KeyNotFound,
    /// The leader's transport failed.
    Io(std::io::ErrorKind),
    /// The leader exhausted its retry budget.
    RetryLimit,
    /// The leader tripped an on-wire invariant.
    Corruption(&'static str),
}

impl WriteOutcome {
    /// Condenses a leader's result for handover.
    pub fn of<R>(result: &crate::Result<R>) -> Self {
        match result {
            Ok(_) => Self::Applied,
            Err(Error::Io(e)) => Self::Io(e.kind()),
            Err(Error::KeyNotFound) => Self::KeyNotFound,
            Err(Error::RetryLimit) => Self::RetryLimit,
            Err(Error::Corruption(what)) => Self::Corruption(what),
        }
    }

    /// Expands back into the result a follower reports to its caller.
    pub fn into_result(self) -> crate::Result<()> {
        match self {
            Self::Applied => Ok(()),
            Self::KeyNotFound => Err(Error::KeyNotFound),
            Self::Io(kind) => Err(Error::Io(kind.into())),
            Self::RetryLimit => Err(Error::RetryLimit),
            Self::Corruption(what) => Err(Error::Corruption(what)),
        }
    }
}

struct WriteState {
    /// Deposits are accepted only while the leader has not yet read the
    /// combine slot; a later arrival waits for the next leader instead.
    open: bool,
    latest: Value,
    done: bool,
    outcome: WriteOutcome,
}

struct WriteSession {
    state: Mutex<WriteState>,
    cond: Condvar,
}

struct ReadState {
    open: bool,
    done: bool,
    result: Option<Value>,
}

struct ReadSession {
    state: Mutex<ReadState>,
    cond: Condvar,
}

enum Active {
    Write(Key, WriteKind, Arc<WriteSession>),
    Read(Key, Arc<ReadSession>),
}

struct Bucket {
    active: Mutex<Option<Active>>,
    turnstile: Condvar,
}

/// Outcome of [`LocalLockTable::acquire_write`].
pub(crate) enum WriteTicket {
    /// The caller drives the remote operation.
    Leader(WriteLease),
    /// The caller's value was combined into an in-flight write; carries
    /// how that write actually ended.
    Combined(WriteOutcome),
}

/// Leadership over one bucket for one write.
pub(crate) struct WriteLease {
    bucket: usize,
    session: Arc<WriteSession>,
}

/// Outcome of [`LocalLockTable::acquire_read`].
pub(crate) enum ReadTicket {
    /// The caller performs the remote lookup.
    Leader(ReadLease),
    /// The caller was handed the leader's result.
    Delegated(Option<Value>),
}

/// Leadership over one bucket for one read.
pub(crate) struct ReadLease {
    bucket: usize,
    session: Arc<ReadSession>,
}

/// Per-client table that coalesces contending same-key operations.
pub(crate) struct LocalLockTable {
    buckets: Vec<Bucket>,
}

impl LocalLockTable {
    pub fn new() -> Self {
        Self {
            buckets: (0..LOCAL_LOCK_N)
                .map(|_| Bucket {
                    active: Mutex::new(None),
                    turnstile: Condvar::new(),
                })
                .collect(),
        }
    }

    fn bucket_index(&self, k: &Key) -> usize {
        let mut hasher = FxHasher::default();
        k.hash(&mut hasher);
        (hasher.finish() % self.buckets.len() as u64) as usize
    }

    /// Acquires the write slot for `k`, either becoming the leader or
    /// combining `v` into the in-flight leader's write and blocking
    /// until it completes.
    pub fn acquire_write(&self, k: &Key, kind: WriteKind, v: Value) -> WriteTicket {
        let index = self.bucket_index(k);
        let bucket = &self.buckets[index];
        let mut active = bucket.active.lock().expect("lock table poisoned");

        loop {
            let combinable = match active.as_ref() {
                None => None,
                Some(Active::Write(active_key, active_kind, session))
                    if active_key == k
                        && !(*active_kind == WriteKind::Strict && kind == WriteKind::Upsert) =>
                {
                    Some(Arc::clone(session))
                }
                Some(_) => {
                    active = bucket.turnstile.wait(active).expect("lock table poisoned");
                    continue;
                }
            };

            let Some(session) = combinable else {
                let session = Arc::new(WriteSession {
                    state: Mutex::new(WriteState {
                        open: true,
                        latest: v,
                        done: false,
                        outcome: WriteOutcome::Applied,
                    }),
                    cond: Condvar::new(),
                });
                *active = Some(Active::Write(*k, kind, Arc::clone(&session)));
                return WriteTicket::Leader(WriteLease {
                    bucket: index,
                    session,
                });
            };

            let mut state = session.state.lock().expect("lock table poisoned");
            if state.open {
                state.latest = v;
                drop(active);
                while !state.done {
                    state = session.cond.wait(state).expect("lock table poisoned");
                }
                return WriteTicket::Combined(state.outcome);
            }
            // combine window already closed; wait for the next
            // leadership vacancy
            drop(state);
            active = bucket.turnstile.wait(active).expect("lock table poisoned");
        }
    }

    /// Closes the combine window and returns the freshest value for the
    /// leader to write. Call immediately before the remote write.
    pub fn combining_value(&self, lease: &WriteLease) -> Value {
        let mut state = lease.session.state.lock().expect("lock table poisoned");
        state.open = false;
        state.latest
    }

    /// Ends the leader's write, waking combined writers with how it
    /// went.
    pub fn release_write(&self, lease: WriteLease, outcome: WriteOutcome) {
        {
            let mut state = lease.session.state.lock().expect("lock table poisoned");
            state.open = false;
            state.done = true;
            state.outcome = outcome;
            lease.session.cond.notify_all();
        }
        let bucket = &self.buckets[lease.bucket];
        let mut active = bucket.active.lock().expect("lock table poisoned");
        *active = None;
        bucket.turnstile.notify_all();
    }

    /// Acquires the read slot for `k`, either becoming the leader or
    /// blocking until the in-flight leader hands over its result.
    pub fn acquire_read(&self, k: &Key) -> ReadTicket {
        let index = self.bucket_index(k);
        let bucket = &self.buckets[index];
        let mut active = bucket.active.lock().expect("lock table poisoned");

        loop {
            let delegable = match active.as_ref() {
                None => None,
                Some(Active::Read(active_key, session)) if active_key == k => {
                    Some(Arc::clone(session))
                }
                Some(_) => {
                    active = bucket.turnstile.wait(active).expect("lock table poisoned");
                    continue;
                }
            };

            let Some(session) = delegable else {
                let session = Arc::new(ReadSession {
                    state: Mutex::new(ReadState {
                        open: true,
                        done: false,
                        result: None,
                    }),
                    cond: Condvar::new(),
                });
                *active = Some(Active::Read(*k, Arc::clone(&session)));
                return ReadTicket::Leader(ReadLease {
                    bucket: index,
                    session,
                });
            };

            let mut state = session.state.lock().expect("lock table poisoned");
            if state.open {
                drop(active);
                while !state.done {
                    state = session.cond.wait(state).expect("lock table poisoned");
                }
                return ReadTicket::Delegated(state.result);
            }
            drop(state);
            active = bucket.turnstile.wait(active).expect("lock table poisoned");
        }
    }

    /// Ends the leader's read, fanning `result` out to delegated
    /// readers.
    pub fn release_read(&self, lease: ReadLease, result: Option<Value>) {
        {
            let mut state = lease.session.state.lock().expect("lock table poisoned");
            state.open = false;
            state.done = true;
            state.result = result;
            lease.session.cond.notify_all();
        }
        let bucket = &self.buckets[lease.bucket];
        let mut active = bucket.active.lock().expect("lock table poisoned");
        *active = None;
        bucket.turnstile.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};
    use test_log::test;

    #[test]
    fn single_writer_is_leader() {
        let table = LocalLockTable::new();
        let k = Key::from(1);
        match table.acquire_write(&k, WriteKind::Upsert, 10) {
            WriteTicket::Leader(lease) => {
                assert_eq!(10, table.combining_value(&lease));
                table.release_write(lease, WriteOutcome::Applied);
            }
            WriteTicket::Combined(_) => panic!("no one to combine with"),
        }
    }

    #[test]
    fn second_writer_combines_and_leader_sees_its_value() {
        let table = Arc::new(LocalLockTable::new());
        let k = Key::from(7);

        let WriteTicket::Leader(lease) = table.acquire_write(&k, WriteKind::Upsert, 1) else {
            panic!("first writer must lead");
        };

        let follower = {
            let table = Arc::clone(&table);
            thread::spawn(move || match table.acquire_write(&k, WriteKind::Upsert, 2) {
                WriteTicket::Combined(outcome) => outcome,
                WriteTicket::Leader(lease) => {
                    // raced past the leader's release; just complete
                    table.release_write(lease, WriteOutcome::Applied);
                    WriteOutcome::Applied
                }
            })
        };

        // give the follower time to deposit
        thread::sleep(Duration::from_millis(50));
        let combined = table.combining_value(&lease);
        table.release_write(lease, WriteOutcome::Applied);

        assert_eq!(WriteOutcome::Applied, follower.join().expect("no panic"));
        assert!(combined == 1 || combined == 2);
    }

    #[test]
    fn combined_writer_observes_leader_failure() {
        let table = Arc::new(LocalLockTable::new());
        let k = Key::from(8);

        let WriteTicket::Leader(lease) = table.acquire_write(&k, WriteKind::Upsert, 1) else {
            panic!("first writer must lead");
        };

        let follower = {
            let table = Arc::clone(&table);
            thread::spawn(move || match table.acquire_write(&k, WriteKind::Upsert, 2) {
                WriteTicket::Combined(outcome) => outcome,
                WriteTicket::Leader(lease) => {
                    table.release_write(lease, WriteOutcome::Applied);
                    WriteOutcome::Applied
                }
            })
        };

        thread::sleep(Duration::from_millis(50));
        // the leader's remote write blew up; the follower's value was
        // never persisted and it must hear about that
        table.release_write(lease, WriteOutcome::RetryLimit);

        let outcome = follower.join().expect("no panic");
        assert!(
            matches!(outcome, WriteOutcome::RetryLimit | WriteOutcome::Applied),
            "unexpected outcome {outcome:?}"
        );
        if outcome == WriteOutcome::RetryLimit {
            assert!(outcome.into_result().is_err());
        }
    }

    #[test]
    fn delegated_readers_see_leader_result() {
        let table = Arc::new(LocalLockTable::new());
        let k = Key::from(9);

        let ReadTicket::Leader(lease) = table.acquire_read(&k) else {
            panic!("first reader must lead");
        };

        let followers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || match table.acquire_read(&k) {
                    ReadTicket::Delegated(result) => result,
                    ReadTicket::Leader(lease) => {
                        table.release_read(lease, Some(123));
                        Some(123)
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        table.release_read(lease, Some(123));

        for follower in followers {
            assert_eq!(Some(123), follower.join().expect("no panic"));
        }
    }

    #[test]
    fn different_keys_do_not_interfere() {
        let table = LocalLockTable::new();
        let WriteTicket::Leader(a) = table.acquire_write(&Key::from(100), WriteKind::Upsert, 1) else {
            panic!("must lead");
        };
        // hash collisions aside, an unrelated key gets its own leader
        let WriteTicket::Leader(b) = table.acquire_write(&Key::from(101), WriteKind::Upsert, 2) else {
            panic!("must lead");
        };
        table.release_write(a, WriteOutcome::Applied);
        table.release_write(b, WriteOutcome::Applied);
    }
}
