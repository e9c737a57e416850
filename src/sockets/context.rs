//! Pooled, reusable handles for a single in-flight socket operation.
//!
//! A context carries one operation at a time: checking it out, starting an accept or a
//! data transfer, and awaiting the outcome. Completion and cancellation both resolve
//! the context's slot; the first resolution wins and the loser is a no-op. Contexts return to a bounded pool when the guard
//! drops, unless an operation is still pending on them.

use super::buffer_list::BufferList;
use super::socket::Socket;
use crate::error::TransportError;
use parking_lot::Mutex;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const MAX_POOLED_ACCEPT: usize = 64;
const MAX_POOLED_DATA: usize = 256;

/// Buffers a data context keeps across check-ins.
const RETAINED_DATA_BUFFERS: usize = 4;

const FREE: u8 = 0;
const AWAITING: u8 = 1;
const FINISHING: u8 = 2;

static ACCEPT_POOL: ContextPool<AcceptContext> = ContextPool::new(MAX_POOLED_ACCEPT);
static DATA_POOL: ContextPool<DataContext> = ContextPool::new(MAX_POOLED_DATA);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Free,
    Awaiting,
    Finishing,
}

type Outcome<T> = Result<T, TransportError>;

/// Single-assignment completion slot for one operation.
///
/// The state moves Free -> Awaiting on `begin` and Awaiting -> Finishing on the first
/// `resolve`; the outcome is stored under the same lock, so later resolutions are no-ops.
pub struct OperationSlot<T> {
    state: AtomicU8,
    outcome: Mutex<Option<Outcome<T>>>,
}

impl<T> Default for OperationSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OperationSlot<T> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(FREE),
            outcome: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ContextState {
        match self.state.load(Ordering::Acquire) {
            FREE => ContextState::Free,
            AWAITING => ContextState::Awaiting,
            _ => ContextState::Finishing,
        }
    }

    /// Arm the slot for a new operation.
    pub fn begin(&self) -> Result<(), TransportError> {
        let mut outcome = self.outcome.lock();
        self.state
            .compare_exchange(FREE, AWAITING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TransportError::ContextInUse)?;
        *outcome = None;
        Ok(())
    }

    /// Deliver the outcome. Returns `false` if the slot was already resolved.
    pub fn resolve(&self, result: Outcome<T>) -> bool {
        let mut outcome = self.outcome.lock();
        if self
            .state
            .compare_exchange(AWAITING, FINISHING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *outcome = Some(result);
        true
    }

    /// Take the winning outcome. A slot that was never resolved reads as canceled.
    pub fn take(&self) -> Outcome<T> {
        self.outcome.lock().take().unwrap_or(Err(TransportError::Canceled))
    }

    /// Make a finished slot available again. Pending slots are left untouched.
    fn recycle(&self) -> bool {
        match self.state.compare_exchange(FINISHING, FREE, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(current) => current == FREE,
        }
    }
}

fn transport_error(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::TimedOut {
        TransportError::TimedOut
    } else {
        TransportError::Io(e)
    }
}

/// Context types that can be returned to a [`ContextPool`].
pub trait Recycle: Send + 'static {
    /// Prepare for reuse. `false` means the context must be discarded.
    fn recycle(&mut self) -> bool;
}

/// Bounded free list of contexts. Check-ins beyond the bound are dropped.
pub struct ContextPool<C> {
    max: usize,
    idle: Mutex<Vec<C>>,
}

impl<C: Recycle> ContextPool<C> {
    pub const fn new(max: usize) -> Self {
        Self {
            max,
            idle: parking_lot::const_mutex(Vec::new()),
        }
    }

    pub fn check_out(&'static self, make: fn() -> C) -> Pooled<C> {
        let ctx = self.idle.lock().pop().unwrap_or_else(make);
        Pooled {
            ctx: Some(ctx),
            pool: self,
        }
    }

    fn check_in(&self, mut ctx: C) {
        if !ctx.recycle() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max {
            idle.push(ctx);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A checked-out context; returns itself to its pool on drop.
pub struct Pooled<C: Recycle> {
    ctx: Option<C>,
    pool: &'static ContextPool<C>,
}

impl<C: Recycle> Deref for Pooled<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.ctx {
            Some(ctx) => ctx,
            None => unreachable!("context used after check-in"),
        }
    }
}

impl<C: Recycle> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.ctx {
            Some(ctx) => ctx,
            None => unreachable!("context used after check-in"),
        }
    }
}

impl<C: Recycle> Drop for Pooled<C> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.check_in(ctx);
        }
    }
}

/// Context for accepting one inbound connection.
pub struct AcceptContext {
    slot: OperationSlot<Arc<dyn Socket>>,
}

impl AcceptContext {
    pub fn new() -> Self {
        Self {
            slot: OperationSlot::new(),
        }
    }

    pub fn check_out() -> Pooled<AcceptContext> {
        ACCEPT_POOL.check_out(AcceptContext::new)
    }

    pub fn state(&self) -> ContextState {
        self.slot.state()
    }

    /// Accept one connection from `listener`, or fail with `Canceled` once `cancel` fires.
    pub async fn accept(
        &self,
        listener: &dyn Socket,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Socket>, TransportError> {
        self.slot.begin()?;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Canceled),
            accepted = listener.accept() => accepted.map_err(transport_error),
        };
        // A connection accepted after cancellation is dropped, which closes it.
        self.slot.resolve(outcome);
        self.slot.take()
    }
}

impl Default for AcceptContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Recycle for AcceptContext {
    fn recycle(&mut self) -> bool {
        self.slot.recycle()
    }
}

/// Context for one receive or send, owning the buffer list used for the transfer.
pub struct DataContext {
    slot: OperationSlot<usize>,
    buffers: BufferList,
}

impl DataContext {
    pub fn new() -> Self {
        Self {
            slot: OperationSlot::new(),
            buffers: BufferList::new(),
        }
    }

    pub fn check_out() -> Pooled<DataContext> {
        DATA_POOL.check_out(DataContext::new)
    }

    pub fn state(&self) -> ContextState {
        self.slot.state()
    }

    pub fn buffers(&self) -> &BufferList {
        &self.buffers
    }

    /// Receive up to `dest.len()` bytes into `dest`. `Ok(0)` means the peer closed.
    pub async fn receive(
        &mut self,
        socket: &dyn Socket,
        dest: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize, TransportError> {
        self.slot.begin()?;
        if self.buffers.set_length(dest.len()) {
            trace!(
                socket = socket.identifier(),
                segments = self.buffers.segment_count(),
                "Receive layout changed"
            );
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Canceled),
            received = socket.receive(&mut self.buffers) => received.map_err(transport_error),
        };
        self.slot.resolve(outcome);
        let received = self.slot.take()?;
        Ok(self.buffers.copy_to(&mut dest[..received]))
    }

    /// Send all of `src`. Returns the number of bytes the socket accepted.
    pub async fn send(
        &mut self,
        socket: &dyn Socket,
        src: &[u8],
        cancel: &CancellationToken,
    ) -> Result<usize, TransportError> {
        self.slot.begin()?;
        if self.buffers.copy_from(src) {
            trace!(
                socket = socket.identifier(),
                segments = self.buffers.segment_count(),
                "Send layout changed"
            );
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Canceled),
            sent = socket.send(&self.buffers) => sent.map_err(transport_error),
        };
        self.slot.resolve(outcome);
        self.slot.take()
    }
}

impl Default for DataContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Recycle for DataContext {
    fn recycle(&mut self) -> bool {
        self.buffers.limit(RETAINED_DATA_BUFFERS);
        self.slot.recycle()
    }
}
