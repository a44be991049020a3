/// Request/response coordinator for the SMP characteristic
///
/// Owns the single in-flight transaction of a transport: the request header
/// it answers to, the response bytes gathered so far and the length the
/// response announced. Only the first notification of a response carries
/// a header; the rest are raw continuation bytes matched to the pending
/// transaction by arrival order.
///
/// Each transaction gets a generation number. When a transaction is
/// cancelled the coordinator remembers how many bytes of its response are
/// still outstanding and drains them, so late chunks are dropped instead of
/// being spliced into the next response.

use tracing::{debug, trace, warn};

use crate::smp::McuMgrHeader;
use crate::transport::abstraction::{ProtocolError, TransportError};

/// Lifecycle of the coordinator's transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    AwaitingFirstChunk,
    AwaitingMoreChunks,
    Complete,
    Failed,
}

/// Result of feeding an event to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// More chunks are needed
    Pending,
    /// The full response frame, header included
    Complete(Vec<u8>),
    /// The transaction failed
    Failed(TransportError),
    /// The event does not belong to the pending transaction
    Ignored,
}

#[derive(Debug)]
struct PendingTransaction {
    generation: u64,
    request: McuMgrHeader,
    buffer: Vec<u8>,
    /// Header + payload length announced by the first chunk
    expected_length: usize,
}

/// Bytes still owed by a response nobody is waiting for
#[derive(Debug, Clone, Copy)]
struct StaleResponse {
    sequence_number: u8,
    remaining: usize,
}

#[derive(Debug)]
pub struct WriteCoordinator {
    state: TransactionState,
    generation: u64,
    pending: Option<PendingTransaction>,
    stale: Option<StaleResponse>,
}

impl WriteCoordinator {
    pub fn new() -> Self {
        Self {
            state: TransactionState::Idle,
            generation: 0,
            pending: None,
            stale: None,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Generation of the most recent transaction
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a transaction is waiting for response chunks
    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            TransactionState::AwaitingFirstChunk | TransactionState::AwaitingMoreChunks
        )
    }

    /// Start a transaction for `request` and return its generation
    pub fn begin(&mut self, request: McuMgrHeader) -> u64 {
        if let Some(previous) = self.pending.take() {
            warn!(
                "Abandoning transaction {} (seq {}) for a new request",
                previous.generation, previous.request.sequence_number
            );
            self.remember_stale(&previous);
        }
        self.generation += 1;
        self.pending = Some(PendingTransaction {
            generation: self.generation,
            request,
            buffer: Vec::new(),
            expected_length: 0,
        });
        self.state = TransactionState::AwaitingFirstChunk;
        debug!(
            "Transaction {} started: group {} cmd {} seq {}",
            self.generation, request.group, request.command_id, request.sequence_number
        );
        self.generation
    }

    /// Feed one notification payload
    pub fn received(&mut self, chunk: &[u8]) -> Progress {
        match self.state {
            TransactionState::AwaitingFirstChunk => self.first_chunk(chunk),
            TransactionState::AwaitingMoreChunks => self.append(chunk),
            _ => {
                self.discard_unsolicited(chunk);
                Progress::Ignored
            }
        }
    }

    /// Fail the pending transaction, if any
    pub fn fail(&mut self, error: TransportError) -> Progress {
        match self.pending.take() {
            Some(pending) if self.is_busy() => {
                debug!("Transaction {} failed: {}", pending.generation, error);
                self.state = TransactionState::Failed;
                Progress::Failed(error)
            }
            _ => Progress::Ignored,
        }
    }

    /// Abandon transaction `generation` after its caller stopped waiting.
    /// Returns false if that transaction is no longer pending.
    pub fn cancel(&mut self, generation: u64) -> bool {
        match self.pending.take() {
            Some(pending) if pending.generation == generation => {
                self.remember_stale(&pending);
                self.state = TransactionState::Failed;
                debug!("Transaction {} cancelled", generation);
                true
            }
            other => {
                self.pending = other;
                false
            }
        }
    }

    /// Return to `Idle` once the caller of `generation` has its result
    pub fn finish(&mut self, generation: u64) {
        if self.generation == generation && !self.is_busy() {
            self.state = TransactionState::Idle;
        }
    }

    /// Drop all transaction and stale state (link went down)
    pub fn reset(&mut self) {
        self.pending = None;
        self.stale = None;
        self.state = TransactionState::Idle;
    }

    fn first_chunk(&mut self, chunk: &[u8]) -> Progress {
        let Some(request) = self.pending.as_ref().map(|p| p.request) else {
            return Progress::Ignored;
        };
        let header = McuMgrHeader::parse(chunk);

        if let Some(stale) = self.stale {
            match header {
                Some(h) if h.sequence_number == request.sequence_number && h.op.is_response() => {
                    self.stale = None;
                }
                _ => {
                    self.drain(stale, chunk);
                    return Progress::Ignored;
                }
            }
        }

        let Some(header) = header else {
            return self.fail(ProtocolError::MissingHeader.into());
        };

        if header.sequence_number != request.sequence_number {
            warn!(
                "Dropping response seq {} while waiting for seq {}",
                header.sequence_number, request.sequence_number
            );
            self.start_drain(header, chunk.len());
            return Progress::Ignored;
        }
        if !header.op.is_response() {
            return self.fail(
                ProtocolError::BadHeader(format!("{:?} is not a response", header.op)).into(),
            );
        }
        if header.group != request.group || header.command_id != request.command_id {
            return self.fail(
                ProtocolError::BadHeader(format!(
                    "response for group {} cmd {}, expected group {} cmd {}",
                    header.group, header.command_id, request.group, request.command_id
                ))
                .into(),
            );
        }

        if let Some(pending) = self.pending.as_mut() {
            pending.expected_length = header.frame_length();
        }
        self.state = TransactionState::AwaitingMoreChunks;
        self.append(chunk)
    }

    fn append(&mut self, chunk: &[u8]) -> Progress {
        let Some(pending) = self.pending.as_mut() else {
            return Progress::Ignored;
        };
        pending.buffer.extend_from_slice(chunk);

        let expected = pending.expected_length;
        let actual = pending.buffer.len();
        trace!(
            "Transaction {}: {} of {} bytes",
            pending.generation,
            actual,
            expected
        );

        if actual > expected {
            return self.fail(ProtocolError::LengthMismatch { expected, actual }.into());
        }
        if actual < expected {
            return Progress::Pending;
        }

        self.state = TransactionState::Complete;
        match self.pending.take() {
            Some(pending) => {
                debug!("Transaction {} complete ({} bytes)", pending.generation, actual);
                Progress::Complete(pending.buffer)
            }
            None => Progress::Ignored,
        }
    }

    fn remember_stale(&mut self, pending: &PendingTransaction) {
        if self.state == TransactionState::AwaitingMoreChunks {
            let remaining = pending.expected_length.saturating_sub(pending.buffer.len());
            if remaining > 0 {
                self.stale = Some(StaleResponse {
                    sequence_number: pending.request.sequence_number,
                    remaining,
                });
            }
        }
    }

    fn start_drain(&mut self, header: McuMgrHeader, received: usize) {
        let remaining = header.frame_length().saturating_sub(received);
        self.stale = (remaining > 0).then_some(StaleResponse {
            sequence_number: header.sequence_number,
            remaining,
        });
    }

    fn drain(&mut self, stale: StaleResponse, chunk: &[u8]) {
        let remaining = stale.remaining.saturating_sub(chunk.len());
        debug!(
            "Draining {} stale bytes of seq {} ({} left)",
            chunk.len(),
            stale.sequence_number,
            remaining
        );
        self.stale = (remaining > 0).then_some(StaleResponse { remaining, ..stale });
    }

    fn discard_unsolicited(&mut self, chunk: &[u8]) {
        if let Some(stale) = self.stale {
            self.drain(stale, chunk);
            return;
        }
        match McuMgrHeader::parse(chunk) {
            Some(header) if header.op.is_response() => {
                warn!(
                    "Dropping late response seq {} ({} bytes)",
                    header.sequence_number,
                    chunk.len()
                );
                self.start_drain(header, chunk.len());
            }
            _ => warn!(
                "Discarding {} trailing bytes with no pending transaction: {}",
                chunk.len(),
                hex::encode(chunk)
            ),
        }
    }
}

impl Default for WriteCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
