//! FIFO command scheduler with a single active slot.
//!
//! The device accepts one in-flight request at a time, so commands from all
//! connections funnel through this queue in submission order. The scheduler
//! is a pure data structure; the broker performs the serial writes and timer
//! arming that a [`Dispatch::Now`] result calls for.

use std::collections::VecDeque;

/// Handle identifying a client connection. Entries outlive the connection
/// they came from; a stale id simply no longer resolves in the broker's
/// client table.
pub type ClientId = u64;

/// Upper bound on queued commands. Exceeding it is treated as a protocol
/// error on the submitting connection.
pub const MAX_PENDING: usize = 64;

/// A queued command awaiting its turn on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub client: ClientId,
    pub line: Vec<u8>,
}

/// Outcome of a submission.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// The slot was free and is now claimed; the caller writes the command.
    Now(PendingCommand),
    /// Another command is in flight; the command was queued.
    Queued,
    /// The pending queue is at capacity; the submitter must be closed.
    QueueFull,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    active: Option<ClientId>,
    pending: VecDeque<PendingCommand>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The connection currently owed a reply, if any.
    pub fn active(&self) -> Option<ClientId> {
        self.active
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Submit a command. If the active slot is free it is claimed for
    /// `client` and the command is handed back for immediate dispatch;
    /// otherwise the command is copied into the pending queue.
    pub fn submit(&mut self, client: ClientId, line: Vec<u8>) -> Dispatch {
        if self.active.is_none() {
            self.active = Some(client);
            Dispatch::Now(PendingCommand { client, line })
        } else if self.pending.len() >= MAX_PENDING {
            Dispatch::QueueFull
        } else {
            self.pending.push_back(PendingCommand { client, line });
            Dispatch::Queued
        }
    }

    /// Finish the in-flight command and promote the queue head, if any, into
    /// the active slot. The caller dispatches the returned command and
    /// re-arms the response timer; `None` leaves the slot empty.
    pub fn complete(&mut self) -> Option<PendingCommand> {
        self.active = None;
        let next = self.pending.pop_front()?;
        self.active = Some(next.client);
        Some(next)
    }

    /// Claim the active slot directly (dispatch path for `Dispatch::Now`).
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(s: &str) -> Vec<u8> {
        format!("{s}\n").into_bytes()
    }

    #[test]
    fn test_first_submission_dispatches_immediately() {
        let mut sched = Scheduler::new();
        let dispatch = sched.submit(1, cmd("A"));
        assert_eq!(
            dispatch,
            Dispatch::Now(PendingCommand {
                client: 1,
                line: cmd("A")
            })
        );
        assert_eq!(sched.active(), Some(1));
        assert_eq!(sched.pending_len(), 0);
    }

    #[test]
    fn test_fifo_across_connections() {
        let mut sched = Scheduler::new();
        assert!(matches!(sched.submit(1, cmd("A 1")), Dispatch::Now(_)));
        assert_eq!(sched.submit(2, cmd("B 1")), Dispatch::Queued);
        assert_eq!(sched.submit(1, cmd("A 2")), Dispatch::Queued);
        assert_eq!(sched.submit(3, cmd("C 1")), Dispatch::Queued);

        let order: Vec<Vec<u8>> = std::iter::from_fn(|| sched.complete().map(|p| p.line)).collect();
        assert_eq!(order, vec![cmd("B 1"), cmd("A 2"), cmd("C 1")]);
        assert!(sched.is_idle());
    }

    #[test]
    fn test_complete_promotes_queue_head() {
        let mut sched = Scheduler::new();
        sched.submit(1, cmd("A"));
        sched.submit(2, cmd("B"));

        let next = sched.complete().expect("queued command");
        assert_eq!(next.client, 2);
        assert_eq!(sched.active(), Some(2));

        assert!(sched.complete().is_none());
        assert_eq!(sched.active(), None);
    }

    #[test]
    fn test_per_connection_order_is_preserved() {
        let mut sched = Scheduler::new();
        sched.submit(7, cmd("first"));
        for i in 0..5 {
            sched.submit(7, cmd(&format!("cmd {i}")));
        }
        let replies: Vec<Vec<u8>> =
            std::iter::from_fn(|| sched.complete().map(|p| p.line)).collect();
        let expected: Vec<Vec<u8>> = (0..5).map(|i| cmd(&format!("cmd {i}"))).collect();
        assert_eq!(replies, expected);
    }

    #[test]
    fn test_queue_overflow_reports_full() {
        let mut sched = Scheduler::new();
        sched.submit(1, cmd("active"));
        for _ in 0..MAX_PENDING {
            assert_eq!(sched.submit(2, cmd("fill")), Dispatch::Queued);
        }
        assert_eq!(sched.submit(3, cmd("over")), Dispatch::QueueFull);
        // The offender is closed but already-queued commands survive.
        assert_eq!(sched.pending_len(), MAX_PENDING);
    }

    #[test]
    fn test_single_command_in_flight() {
        let mut sched = Scheduler::new();
        sched.submit(1, cmd("A"));
        sched.submit(2, cmd("B"));
        // The slot holds exactly one occupant until complete() is called.
        assert_eq!(sched.active(), Some(1));
        sched.complete();
        assert_eq!(sched.active(), Some(2));
    }
}
