/// FIFO admission for transactions
///
/// Only one connect or send may drive the link at a time. Callers take a
/// ticket and wait until it is served; tickets are served strictly in the
/// order they were issued. A bounded number of callers may wait in line,
/// beyond that `enter` fails with `Busy`.

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::transport::abstraction::TransportError;

struct QueueState {
    next_ticket: u64,
    now_serving: u64,
}

pub struct TransactionQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
    max_queued: usize,
}

/// Held while a caller owns the link; dropping it admits the next ticket
pub struct QueueTurn<'a> {
    queue: &'a TransactionQueue,
    ticket: u64,
}

impl TransactionQueue {
    /// Create a queue allowing `max_queued` callers to wait behind the
    /// active one
    pub fn new(max_queued: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_ticket: 0,
                now_serving: 0,
            }),
            condvar: Condvar::new(),
            max_queued,
        }
    }

    /// Callers holding or waiting for a turn
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        (state.next_ticket - state.now_serving) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for this caller's turn
    pub fn enter(&self) -> Result<QueueTurn<'_>, TransportError> {
        let mut state = self.state.lock();
        let in_line = (state.next_ticket - state.now_serving) as usize;
        if in_line > self.max_queued {
            return Err(TransportError::Busy);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        if ticket != state.now_serving {
            trace!("Queued behind {} transaction(s)", ticket - state.now_serving);
        }
        while state.now_serving != ticket {
            self.condvar.wait(&mut state);
        }
        Ok(QueueTurn {
            queue: self,
            ticket,
        })
    }
}

impl Drop for QueueTurn<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        debug_assert_eq!(state.now_serving, self.ticket);
        state.now_serving += 1;
        self.queue.condvar.notify_all();
    }
}
