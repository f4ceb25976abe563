use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;

/// Position of one request in the switch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

/// Why a request did not get its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnError {
    Cancelled,
    TimedOut(Duration),
}

/// Why a cancellation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AlreadyStarted;

#[derive(Default)]
struct QueueState {
    next_ticket: u64,
    waiting: VecDeque<Ticket>,
    running: Option<Ticket>,
    /// Cancelled while waiting; the owner has not observed it yet.
    cancelled: FxHashSet<Ticket>,
}

/// First-in-first-out turnstile for switch operations.
///
/// Only the ticket at the front may run, and only when nothing else is
/// running. The running ticket holds a [`Turn`]; dropping it lets the next
/// ticket in.
#[derive(Default)]
pub struct SwitchQueue {
    state: Mutex<QueueState>,
    turn_changed: Condvar,
}

impl SwitchQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&self) -> Ticket {
        let mut state = self.state.lock();
        state.next_ticket += 1;
        let ticket = Ticket(state.next_ticket);
        state.waiting.push_back(ticket);
        ticket
    }

    /// Blocks until `ticket` is at the front and the queue is idle.
    pub(crate) fn wait_turn(&self, ticket: Ticket, timeout: Duration) -> Result<Turn<'_>, TurnError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.cancelled.remove(&ticket) {
                return Err(TurnError::Cancelled);
            }
            if state.running.is_none() && state.waiting.front() == Some(&ticket) {
                state.waiting.pop_front();
                state.running = Some(ticket);
                return Ok(Turn {
                    queue: self,
                    ticket,
                });
            }
            if self.turn_changed.wait_until(&mut state, deadline).timed_out() {
                // Re-check once: the turn may have arrived together with the timeout.
                if state.running.is_none() && state.waiting.front() == Some(&ticket) {
                    continue;
                }
                state.waiting.retain(|&t| t != ticket);
                state.cancelled.remove(&ticket);
                self.turn_changed.notify_all();
                return Err(TurnError::TimedOut(timeout));
            }
        }
    }

    /// Removes a ticket that has not started yet.
    ///
    /// Cancelling an already-cancelled ticket succeeds again; cancelling a
    /// running or finished one fails.
    pub(crate) fn cancel(&self, ticket: Ticket) -> Result<(), AlreadyStarted> {
        let mut state = self.state.lock();
        if state.cancelled.contains(&ticket) {
            return Ok(());
        }
        let before = state.waiting.len();
        state.waiting.retain(|&t| t != ticket);
        if state.waiting.len() == before {
            return Err(AlreadyStarted);
        }
        state.cancelled.insert(ticket);
        self.turn_changed.notify_all();
        Ok(())
    }

    /// Drops the bookkeeping of a cancelled ticket whose owner will never wait.
    pub(crate) fn forget(&self, ticket: Ticket) {
        let mut state = self.state.lock();
        state.waiting.retain(|&t| t != ticket);
        state.cancelled.remove(&ticket);
        self.turn_changed.notify_all();
    }

    /// Requests queued and not yet started.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }
}

/// Exclusive right to run one switch. Released on drop.
pub(crate) struct Turn<'a> {
    queue: &'a SwitchQueue,
    ticket: Ticket,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        if state.running == Some(self.ticket) {
            state.running = None;
        }
        self.queue.turn_changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn turns_are_granted_in_arrival_order() {
        let queue = Arc::new(SwitchQueue::new());
        let first = queue.enqueue();
        let held = queue.wait_turn(first, LONG).unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let tickets: Vec<_> = (0..4).map(|_| queue.enqueue()).collect();
        let started = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for &ticket in tickets.iter().rev() {
                let queue = Arc::clone(&queue);
                let order = Arc::clone(&order);
                let started = Arc::clone(&started);
                scope.spawn(move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    let _turn = queue.wait_turn(ticket, LONG).unwrap();
                    order.lock().push(ticket);
                });
            }
            while started.load(Ordering::SeqCst) < tickets.len() {
                std::thread::yield_now();
            }
            drop(held);
        });

        assert_eq!(*order.lock(), tickets);
    }

    #[test]
    fn cancelled_ticket_is_skipped() {
        let queue = SwitchQueue::new();
        let a = queue.enqueue();
        let b = queue.enqueue();
        let c = queue.enqueue();

        queue.cancel(b).unwrap();
        drop(queue.wait_turn(a, LONG).unwrap());
        assert_eq!(queue.wait_turn(b, LONG).err(), Some(TurnError::Cancelled));
        assert!(queue.wait_turn(c, LONG).is_ok());
    }

    #[test]
    fn running_ticket_cannot_be_cancelled() {
        let queue = SwitchQueue::new();
        let a = queue.enqueue();
        let _turn = queue.wait_turn(a, LONG).unwrap();
        assert_eq!(queue.cancel(a), Err(AlreadyStarted));
    }

    #[test]
    fn waiting_times_out_and_leaves_queue_usable() {
        let queue = SwitchQueue::new();
        let a = queue.enqueue();
        let b = queue.enqueue();
        let c = queue.enqueue();
        let turn = queue.wait_turn(a, LONG).unwrap();

        let err = queue.wait_turn(b, Duration::from_millis(10)).err();
        assert_eq!(err, Some(TurnError::TimedOut(Duration::from_millis(10))));
        assert_eq!(queue.waiting(), 1);

        drop(turn);
        assert!(queue.wait_turn(c, LONG).is_ok());
    }
}
