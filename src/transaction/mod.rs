//! The transactional data manager: a two-phase-commit participant that
//! releases a deferred action (an SMTP send or a spool-writer commit)
//! exactly when the surrounding transaction commits.
//!
//! There is no ambient "current transaction" host framework in this
//! ecosystem the way there is in the system this crate is modeled on, so
//! this module is also a minimal implementation of one: a thread-local
//! [`Transaction`] that delivery facades join via [`join`], and that the
//! surrounding application drives with [`commit`], [`abort`], and
//! [`savepoint`].
//!
//! State machine per participant: `joined -> voting -> finishing -> done`,
//! or `joined -> aborting -> done`. `finish` never propagates an error: an
//! SMTP failure escaping here would corrupt the transaction's bookkeeping,
//! so it is logged and swallowed. The mail may be lost; the surrounding
//! transaction's consistency takes priority.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Error;

type VoteFn = Box<dyn FnMut() -> Result<(), Error>>;
type ActionFn = Box<dyn FnOnce() -> Result<(), Error>>;
type AbortFn = Box<dyn FnMut()>;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A participant in a commit: a deferred action, an optional pre-commit
/// vote, and an optional abort callback.
pub struct MailDataManager {
    id: u64,
    action: Option<ActionFn>,
    vote: Option<VoteFn>,
    on_abort: Option<AbortFn>,
}

impl MailDataManager {
    /// Builds a participant. `action` runs at `finish` (commit) time and any
    /// error it returns is logged, not propagated. `vote`, if present, runs
    /// at `vote` time and *does* propagate: a vote failure aborts the whole
    /// transaction before `finish` is ever called. `on_abort` runs at most
    /// once, on abort.
    pub fn new(
        action: impl FnOnce() -> Result<(), Error> + 'static,
        vote: Option<impl FnMut() -> Result<(), Error> + 'static>,
        on_abort: Option<impl FnMut() + 'static>,
    ) -> Self {
        MailDataManager {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            action: Some(Box::new(action)),
            vote: vote.map(|v| Box::new(v) as VoteFn),
            on_abort: on_abort.map(|a| Box::new(a) as AbortFn),
        }
    }

    fn tpc_vote(&mut self) -> Result<(), Error> {
        match &mut self.vote {
            Some(vote) => vote(),
            None => Ok(()),
        }
    }

    fn tpc_finish(&mut self) {
        if let Some(action) = self.action.take() {
            if let Err(err) = action() {
                tracing::error!(manager = self.id, error = %err, "failed in tpc_finish");
            }
        }
    }

    fn do_abort(&mut self) {
        if let Some(on_abort) = &mut self.on_abort {
            on_abort();
        }
        self.on_abort = None;
    }

    /// A stable string derived from this manager's identity, used by a host
    /// framework to order multi-participant commits.
    pub fn sort_key(&self) -> String {
        self.id.to_string()
    }

    /// Returns a no-op savepoint handle. This manager has no notion of a
    /// partially-sent email to roll back to, so rolling back a savepoint
    /// taken on it is a no-op; it exists only so that host frameworks which
    /// insist every joined participant support savepoints (some do) don't
    /// reject this one.
    pub fn savepoint(&self) -> NoOpSavepoint {
        NoOpSavepoint
    }
}

/// Dummy per-participant savepoint: see [`MailDataManager::savepoint`].
#[derive(Debug, Clone, Copy)]
pub struct NoOpSavepoint;

impl NoOpSavepoint {
    pub fn rollback(&self) {}
}

/// A transaction: an ordered set of joined participants. Exists per-thread
/// via [`current`]; most callers use the free functions [`join`],
/// [`commit`], [`abort`], and [`savepoint`] instead of touching this type
/// directly.
#[derive(Default)]
pub struct Transaction {
    managers: Vec<MailDataManager>,
}

impl Transaction {
    fn new() -> Self {
        Transaction {
            managers: Vec::new(),
        }
    }

    fn join(&mut self, manager: MailDataManager) {
        self.managers.push(manager);
    }

    /// Votes every participant in join order; on the first failure, aborts
    /// every participant (including the failed one) and returns the error
    /// without running `finish` on anyone. Otherwise finishes every
    /// participant, swallowing individual failures.
    fn commit(&mut self) -> Result<(), Error> {
        for manager in &mut self.managers {
            if let Err(err) = manager.tpc_vote() {
                self.abort();
                return Err(err);
            }
        }
        for manager in &mut self.managers {
            manager.tpc_finish();
        }
        self.managers.clear();
        Ok(())
    }

    fn abort(&mut self) {
        for manager in &mut self.managers {
            manager.do_abort();
        }
        self.managers.clear();
    }

    fn mark(&self) -> usize {
        self.managers.len()
    }

    fn rollback_to(&mut self, mark: usize) {
        // Participants joined after the savepoint never voted or finished;
        // dropping them is enough, there is nothing to undo.
        self.managers.truncate(mark);
    }
}

thread_local! {
    static CURRENT: RefCell<Transaction> = RefCell::new(Transaction::new());
}

/// Joins `manager` to the current thread's transaction.
pub fn join(manager: MailDataManager) {
    CURRENT.with(|txn| txn.borrow_mut().join(manager));
}

/// Votes and finishes every participant joined so far, then starts a fresh
/// transaction for subsequent joins.
pub fn commit() -> Result<(), Error> {
    CURRENT.with(|txn| txn.borrow_mut().commit())
}

/// Aborts every participant joined so far (invoking each `on_abort` at most
/// once) and starts a fresh transaction.
pub fn abort() {
    CURRENT.with(|txn| txn.borrow_mut().abort());
}

/// A mark in the current transaction's join order. Rolling it back removes
/// every participant joined since, without affecting ones joined before.
#[derive(Debug, Clone, Copy)]
pub struct Savepoint(usize);

/// Takes a savepoint at the current point in the transaction's join order.
pub fn savepoint() -> Savepoint {
    Savepoint(CURRENT.with(|txn| txn.borrow().mark()))
}

impl Savepoint {
    /// Removes every participant joined since this savepoint was taken.
    /// Participants joined before it are untouched and will still vote and
    /// finish at the next `commit`.
    pub fn rollback(self) {
        CURRENT.with(|txn| txn.borrow_mut().rollback_to(self.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<StdRefCell<Vec<&'static str>>>, impl Fn(&'static str) -> MailDataManager) {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |label: &'static str| {
                let log = log.clone();
                MailDataManager::new(
                    move || {
                        log.borrow_mut().push(label);
                        Ok(())
                    },
                    None::<fn() -> Result<(), Error>>,
                    None::<fn()>,
                )
            }
        };
        (log, make)
    }

    #[test]
    fn commit_runs_every_joined_action_once() {
        let (log, make) = recorder();
        join(make("a"));
        join(make("b"));
        commit().unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b"]);

        // the transaction resets after commit
        commit().unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn abort_runs_on_abort_and_not_the_action() {
        let (log, make) = recorder();
        let aborted = Rc::new(StdRefCell::new(false));
        let aborted2 = aborted.clone();
        let log2 = log.clone();
        let dm = MailDataManager::new(
            move || {
                log2.borrow_mut().push("action");
                Ok(())
            },
            None::<fn() -> Result<(), Error>>,
            Some(move || *aborted2.borrow_mut() = true),
        );
        join(dm);
        abort();
        assert!(log.borrow().is_empty());
        assert!(*aborted.borrow());
    }

    #[test]
    fn failing_vote_aborts_before_any_finish() {
        let (log, make) = recorder();
        join(make("a"));
        let failing = MailDataManager::new(
            || Ok(()),
            Some(|| Err(Error::MissingTo)),
            None::<fn()>,
        );
        join(failing);
        let err = commit().unwrap_err();
        assert!(matches!(err, Error::MissingTo));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn savepoint_rollback_elides_only_later_joins() {
        let (log, make) = recorder();
        join(make("a"));
        let sp = savepoint();
        join(make("b"));
        sp.rollback();
        join(make("c"));
        commit().unwrap();
        assert_eq!(*log.borrow(), vec!["a", "c"]);
    }
}
