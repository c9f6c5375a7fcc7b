//! Execution slots.
//!
//! A [`SlotPool`] holds N slots, one per accelerator. Each slot is a FIFO
//! ticket lock: a [`SlotTicket`] is issued when a request is admitted, and
//! tickets of one slot are served strictly in issue order. A request that
//! turns out not to need the slot (its result was reused) drops its ticket
//! without waiting, and the slot moves on to the next ticket.
//!
//! ```text
//! slot 0:  t0 ──► t2 ──► t4 ...      at most one occupant per slot
//! slot 1:  t1 ──► t3 ──► t5 ...      at most N occupants in total
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Default)]
struct TicketState {
    next_ticket: u64,
    now_serving: u64,
    /// Tickets dropped before their turn.
    abandoned: BTreeSet<u64>,
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<TicketState>,
    turn: Notify,
}

impl Slot {
    fn issue(&self) -> u64 {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        ticket
    }

    fn is_turn(&self, ticket: u64) -> bool {
        self.state.lock().now_serving == ticket
    }

    /// Pass the turn to the next ticket that has not been abandoned.
    fn advance(&self) {
        {
            let mut state = self.state.lock();
            state.now_serving += 1;
            loop {
                let serving = state.now_serving;
                if !state.abandoned.remove(&serving) {
                    break;
                }
                state.now_serving += 1;
            }
        }
        self.turn.notify_waiters();
    }

    fn abandon(&self, ticket: u64) {
        let current = {
            let mut state = self.state.lock();
            if state.now_serving == ticket {
                true
            } else {
                state.abandoned.insert(ticket);
                false
            }
        };
        if current {
            self.advance();
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    slots: Vec<Slot>,
    occupied: AtomicUsize,
    high_water: AtomicUsize,
}

/// A fixed set of execution slots.
#[derive(Debug, Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

impl SlotPool {
    /// Create a pool of `slots` slots (at least one).
    pub fn new(slots: usize) -> Self {
        let slots = (0..slots.max(1)).map(|_| Slot::default()).collect();
        Self {
            inner: Arc::new(PoolInner {
                slots,
                occupied: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    /// Always false; a pool has at least one slot.
    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    /// Slot assigned to the `sequence`-th admitted request.
    pub fn slot_for(&self, sequence: usize) -> usize {
        sequence % self.len()
    }

    /// Take the next ticket for `slot`.
    pub fn issue(&self, slot: usize) -> SlotTicket {
        let slot = slot % self.len();
        let number = self.inner.slots[slot].issue();
        trace!(slot, ticket = number, "Issued slot ticket");
        SlotTicket {
            inner: Arc::clone(&self.inner),
            slot,
            number,
            armed: true,
        }
    }

    /// Slots currently occupied.
    pub fn occupied(&self) -> usize {
        self.inner.occupied.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously occupied slots seen so far.
    pub fn high_water_mark(&self) -> usize {
        self.inner.high_water.load(Ordering::SeqCst)
    }
}

/// A place in one slot's queue. Dropping it gives up the place.
#[derive(Debug)]
pub struct SlotTicket {
    inner: Arc<PoolInner>,
    slot: usize,
    number: u64,
    armed: bool,
}

impl SlotTicket {
    /// The slot this ticket belongs to.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Wait until it is this ticket's turn and occupy the slot.
    ///
    /// If the returned future is dropped before completing, the ticket is
    /// abandoned and later tickets are not blocked.
    pub async fn acquire(mut self) -> SlotGuard {
        let slot = &self.inner.slots[self.slot];
        loop {
            let notified = slot.turn.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if slot.is_turn(self.number) {
                break;
            }
            notified.await;
        }

        self.armed = false;
        let occupied = self.inner.occupied.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.high_water.fetch_max(occupied, Ordering::SeqCst);
        trace!(slot = self.slot, ticket = self.number, occupied, "Slot acquired");

        SlotGuard {
            inner: Arc::clone(&self.inner),
            slot: self.slot,
        }
    }
}

impl Drop for SlotTicket {
    fn drop(&mut self) {
        if self.armed {
            trace!(slot = self.slot, ticket = self.number, "Slot ticket abandoned");
            self.inner.slots[self.slot].abandon(self.number);
        }
    }
}

/// Occupancy of one slot; released on drop.
#[derive(Debug)]
pub struct SlotGuard {
    inner: Arc<PoolInner>,
    slot: usize,
}

impl SlotGuard {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.occupied.fetch_sub(1, Ordering::SeqCst);
        self.inner.slots[self.slot].advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_round_robin_assignment() {
        let pool = SlotPool::new(3);
        let slots: Vec<usize> = (0..7).map(|i| pool.slot_for(i)).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_zero_slots_becomes_one() {
        let pool = SlotPool::new(0);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_second_ticket_waits_for_first() {
        let pool = SlotPool::new(1);
        let first = pool.issue(0);
        let second = pool.issue(0);

        let guard = first.acquire().await;
        assert_eq!(pool.occupied(), 1);

        let waiting = tokio::spawn(second.acquire());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        let guard = timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guard.slot(), 0);
        assert_eq!(pool.occupied(), 1);
        drop(guard);
        assert_eq!(pool.occupied(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_ticket_does_not_block() {
        let pool = SlotPool::new(1);
        let first = pool.issue(0);
        let second = pool.issue(0);
        let third = pool.issue(0);

        // Abandoned while not yet its turn.
        drop(second);
        drop(first.acquire().await);

        let guard = timeout(Duration::from_secs(1), third.acquire())
            .await
            .unwrap();
        drop(guard);

        // Abandoned while it is its turn.
        let fourth = pool.issue(0);
        let fifth = pool.issue(0);
        drop(fourth);
        timeout(Duration::from_secs(1), fifth.acquire())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_wait_abandons_ticket() {
        let pool = SlotPool::new(1);
        let guard = pool.issue(0).acquire().await;
        let waiting = pool.issue(0);
        let next = pool.issue(0);

        assert!(timeout(Duration::from_millis(20), waiting.acquire())
            .await
            .is_err());
        drop(guard);

        timeout(Duration::from_secs(1), next.acquire())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fifo_order_within_slot() {
        let pool = SlotPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let tickets: Vec<SlotTicket> = (0..5).map(|_| pool.issue(0)).collect();
        let mut handles = Vec::new();
        // Spawn in reverse so scheduling order differs from ticket order.
        for (i, ticket) in tickets.into_iter().enumerate().rev() {
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = ticket.acquire().await;
                order.lock().push(i);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_occupancy_never_exceeds_slot_count() {
        let pool = SlotPool::new(2);
        let mut handles = Vec::new();
        for i in 0..12 {
            let ticket = pool.issue(pool.slot_for(i));
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let _guard = ticket.acquire().await;
                assert!(pool.occupied() <= 2);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(pool.occupied(), 0);
        assert!(pool.high_water_mark() <= 2);
        assert!(pool.high_water_mark() >= 1);
    }
}
