// Copyright 2025 the bufring authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    cell::UnsafeCell,
    cmp::min,
    fmt,
    ptr::NonNull,
    sync::{Arc, Mutex},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};

use crate::{
    error::RingError,
    io::{RingRx, RingTx},
    segment::{PeekSegment, ReadSegment, WriteSegment},
};

/// A contiguous run of occupied or free storage. One logical read or write
/// may need two runs because the region can straddle the physical end of the
/// storage array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IoPosition {
    pub(crate) offset: usize,
    pub(crate) length: usize,
}

type Positions = (Option<IoPosition>, Option<IoPosition>);

/// The record of a single pending waiter for one direction. The per-direction
/// gates guarantee at most one waiter exists per slot; this is a rendezvous,
/// not a queue.
#[derive(Debug)]
enum Demand {
    Idle,
    Waiting(Waiter),
    Closed,
}

#[derive(Debug)]
struct Waiter {
    /// length the suspended call asked for, kept for diagnostics
    amount: usize,
    /// distinguishes this installation from any later one, so a cancelled
    /// call never clears a slot it does not own
    token: u64,
    signal: oneshot::Sender<()>,
}

impl Demand {
    fn is_closed(&self) -> bool {
        matches!(self, Demand::Closed)
    }

    /// Take the waiter out of the slot, leaving it `Idle`.
    fn take_waiter(&mut self) -> Option<Waiter> {
        if matches!(self, Demand::Waiting(_)) {
            match std::mem::replace(self, Demand::Idle) {
                Demand::Waiting(waiter) => Some(waiter),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    /// Transition to the terminal `Closed` state, handing back any waiter so
    /// the caller can wake it to re-observe the state.
    fn close(&mut self) -> Option<Waiter> {
        match std::mem::replace(self, Demand::Closed) {
            Demand::Waiting(waiter) => Some(waiter),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct State {
    tx_pos: usize,
    rx_pos: usize,
    /// true when the writer has wrapped past the end of storage and now
    /// trails the reader numerically
    inversed: bool,
    tx_demand: Demand,
    rx_demand: Demand,
    next_token: u64,
}

impl State {
    /// Occupied runs available to the reader, in consumption order.
    fn reader_positions(&self, capacity: usize) -> Positions {
        if self.inversed {
            let first = IoPosition {
                offset: self.rx_pos,
                length: capacity - self.rx_pos,
            };
            let second = (self.tx_pos > 0).then_some(IoPosition {
                offset: 0,
                length: self.tx_pos,
            });
            (Some(first), second)
        } else if self.tx_pos > self.rx_pos {
            let run = IoPosition {
                offset: self.rx_pos,
                length: self.tx_pos - self.rx_pos,
            };
            (Some(run), None)
        } else {
            (None, None)
        }
    }

    /// Free runs available to the writer, in fill order.
    fn writer_positions(&self, capacity: usize) -> Positions {
        if self.inversed {
            if self.rx_pos > self.tx_pos {
                let run = IoPosition {
                    offset: self.tx_pos,
                    length: self.rx_pos - self.tx_pos,
                };
                (Some(run), None)
            } else {
                (None, None)
            }
        } else {
            let first = IoPosition {
                offset: self.tx_pos,
                length: capacity - self.tx_pos,
            };
            let second = (self.rx_pos > 0).then_some(IoPosition {
                offset: 0,
                length: self.rx_pos,
            });
            (Some(first), second)
        }
    }

    fn reader_ready(&self, capacity: usize) -> usize {
        let (first, second) = self.reader_positions(capacity);
        first.map_or(0, |p| p.length) + second.map_or(0, |p| p.length)
    }

    fn writer_free(&self, capacity: usize) -> usize {
        let (first, second) = self.writer_positions(capacity);
        first.map_or(0, |p| p.length) + second.map_or(0, |p| p.length)
    }

    /// Advance the read cursor by `consumed` elements taken from a single
    /// run. Crossing the wrap boundary clears `inversed`; draining the buffer
    /// rewinds both cursors to zero.
    fn advance_read(&mut self, consumed: usize, capacity: usize) {
        let new_pos = self.rx_pos + consumed;
        debug_assert!(
            new_pos <= capacity,
            "rx_pos({}) + consumed({}) > capacity({})",
            self.rx_pos,
            consumed,
            capacity
        );
        if new_pos == capacity {
            debug_assert!(self.inversed, "read cursor hit the boundary while not inversed");
            self.rx_pos = 0;
            self.inversed = false;
        } else if new_pos == self.tx_pos && !self.inversed {
            self.tx_pos = 0;
            self.rx_pos = 0;
        } else {
            self.rx_pos = new_pos;
        }
    }

    /// Advance the write cursor by `consumed` filled elements from a single
    /// run. Reaching the boundary wraps the cursor and sets `inversed`.
    fn advance_write(&mut self, consumed: usize, capacity: usize) {
        let new_pos = self.tx_pos + consumed;
        debug_assert!(
            new_pos <= capacity,
            "tx_pos({}) + consumed({}) > capacity({})",
            self.tx_pos,
            consumed,
            capacity
        );
        if new_pos == capacity {
            debug_assert!(
                !self.inversed,
                "write cursor wrapped twice without the reader catching up"
            );
            self.tx_pos = 0;
            self.inversed = true;
        } else {
            self.tx_pos = new_pos;
        }
    }

    fn install_demand(
        &mut self,
        write_side: bool,
        amount: usize,
    ) -> Result<(oneshot::Receiver<()>, u64), RingError> {
        let token = self.next_token;
        self.next_token += 1;
        let slot = if write_side {
            &mut self.tx_demand
        } else {
            &mut self.rx_demand
        };
        match slot {
            Demand::Closed => return Err(RingError::Closed),
            Demand::Waiting(_) => {
                unreachable!("demand slot already occupied behind a held gate")
            }
            Demand::Idle => {}
        }
        let (signal, wait) = oneshot::channel();
        *slot = Demand::Waiting(Waiter {
            amount,
            token,
            signal,
        });
        tracing::trace!(write_side, amount, token, "demand installed");
        Ok((wait, token))
    }
}

/// Clears this call's own demand slot when the call is cancelled while
/// suspended. The token check makes sure a stale cancellation never disturbs
/// a waiter installed later on the same direction.
struct DemandGuard<'a, T> {
    shared: &'a Shared<T>,
    write_side: bool,
    token: u64,
}

impl<T> Drop for DemandGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        let slot = if self.write_side {
            &mut state.tx_demand
        } else {
            &mut state.rx_demand
        };
        if matches!(slot, Demand::Waiting(waiter) if waiter.token == self.token) {
            *slot = Demand::Idle;
            tracing::trace!(token = self.token, "cancelled waiter cleared its demand slot");
        }
    }
}

pub(crate) struct Shared<T> {
    storage: Box<[UnsafeCell<T>]>,
    state: Mutex<State>,
    tx_gate: Arc<Semaphore>,
    rx_gate: Arc<Semaphore>,
}

// Storage access is arbitrated by the gates and the cursor protocol: a live
// segment is the only party touching its runs, so the container moves across
// threads whenever the element type does.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    pub(crate) fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn run_ptr(&self, offset: usize) -> NonNull<T> {
        debug_assert!(offset < self.storage.len());
        let base = self.storage.as_ptr() as *mut T;
        unsafe { NonNull::new_unchecked(base.add(offset)) }
    }

    pub(crate) fn is_tx_closed(&self) -> bool {
        self.state.lock().unwrap().tx_demand.is_closed()
    }

    pub(crate) fn is_rx_closed(&self) -> bool {
        self.state.lock().unwrap().rx_demand.is_closed()
    }

    pub(crate) fn reader_ready(&self) -> usize {
        self.state.lock().unwrap().reader_ready(self.capacity())
    }

    pub(crate) fn writer_free(&self) -> usize {
        self.state.lock().unwrap().writer_free(self.capacity())
    }

    /// Called when a read segment is released: advance the read cursor by the
    /// consumed length, then wake a writer blocked on free space. The wake
    /// fires after the state lock is released.
    pub(crate) fn reclaim_read(&self, consumed: usize) {
        if consumed == 0 {
            return;
        }
        let waiter = {
            let mut state = self.state.lock().unwrap();
            state.advance_read(consumed, self.capacity());
            state.tx_demand.take_waiter()
        };
        if let Some(waiter) = waiter {
            tracing::trace!(consumed, amount = waiter.amount, "read reclaim wakes writer");
            _ = waiter.signal.send(());
        }
    }

    /// Mirror of [`Shared::reclaim_read`] for released write segments.
    pub(crate) fn reclaim_write(&self, consumed: usize) {
        if consumed == 0 {
            return;
        }
        let waiter = {
            let mut state = self.state.lock().unwrap();
            state.advance_write(consumed, self.capacity());
            state.rx_demand.take_waiter()
        };
        if let Some(waiter) = waiter {
            tracing::trace!(consumed, amount = waiter.amount, "write reclaim wakes reader");
            _ = waiter.signal.send(());
        }
    }

    /// Half-close the producer direction. Terminal and idempotent. Waiters of
    /// both directions are woken so suspended calls re-observe the state and
    /// fail or drain.
    pub(crate) fn set_tx_closed(&self) {
        // Seal the gate when it is free so no later borrow is admitted; a
        // borrow already in flight keeps its permit and sees `Closed` on its
        // next loop turn.
        if let Ok(permit) = self.tx_gate.try_acquire() {
            permit.forget();
        }
        let (own, peer) = {
            let mut state = self.state.lock().unwrap();
            (state.tx_demand.close(), state.rx_demand.take_waiter())
        };
        tracing::debug!("tx direction closed");
        for waiter in own.into_iter().chain(peer) {
            _ = waiter.signal.send(());
        }
    }

    /// Mirror of [`Shared::set_tx_closed`] for the consumer direction.
    pub(crate) fn set_rx_closed(&self) {
        if let Ok(permit) = self.rx_gate.try_acquire() {
            permit.forget();
        }
        let (own, peer) = {
            let mut state = self.state.lock().unwrap();
            (state.rx_demand.close(), state.tx_demand.take_waiter())
        };
        tracing::debug!("rx direction closed");
        for waiter in own.into_iter().chain(peer) {
            _ = waiter.signal.send(());
        }
    }

    /// Borrow up to `length` elements of buffered data as 1–2 read segments.
    pub(crate) async fn borrow_read(
        shared: &Arc<Self>,
        length: usize,
    ) -> Result<Vec<ReadSegment<T>>, RingError> {
        {
            let state = shared.state.lock().unwrap();
            if state.rx_demand.is_closed() {
                return Err(RingError::Closed);
            }
            if state.tx_demand.is_closed() && state.reader_ready(shared.capacity()) == 0 {
                return Err(RingError::Closed);
            }
        }
        if length == 0 {
            return Ok(Vec::new());
        }
        if length > shared.capacity() {
            return Err(RingError::Incapable);
        }

        let permit = shared
            .rx_gate
            .clone()
            .acquire_owned()
            .await
            .expect("reader gate semaphore closed");
        let mut permit = Some(permit);
        loop {
            let (wait, token) = {
                let mut state = shared.state.lock().unwrap();
                let (first, second) = state.reader_positions(shared.capacity());
                if let Some(first) = first {
                    let pass = Arc::new(ReadPass {
                        shared: shared.clone(),
                        _permit: permit.take().expect("borrow resolved twice"),
                    });
                    return Ok(gather_read(shared, &pass, length, first, second));
                }
                if state.tx_demand.is_closed() {
                    return Err(RingError::Closed);
                }
                state.install_demand(false, length)?
            };
            let _slot = DemandGuard {
                shared: shared.as_ref(),
                write_side: false,
                token,
            };
            // an Err only means the sender vanished mid-transition; either
            // way the next loop turn re-observes the state
            _ = wait.await;
        }
    }

    /// Borrow up to `length` elements of free space as 1–2 write segments.
    pub(crate) async fn borrow_write(
        shared: &Arc<Self>,
        length: usize,
    ) -> Result<Vec<WriteSegment<T>>, RingError> {
        {
            let state = shared.state.lock().unwrap();
            if state.tx_demand.is_closed() {
                return Err(RingError::Closed);
            }
            if state.rx_demand.is_closed() && state.writer_free(shared.capacity()) == 0 {
                return Err(RingError::Closed);
            }
        }
        if length == 0 {
            return Ok(Vec::new());
        }
        if length > shared.capacity() {
            return Err(RingError::Incapable);
        }

        let permit = shared
            .tx_gate
            .clone()
            .acquire_owned()
            .await
            .expect("writer gate semaphore closed");
        let mut permit = Some(permit);
        loop {
            let (wait, token) = {
                let mut state = shared.state.lock().unwrap();
                let (first, second) = state.writer_positions(shared.capacity());
                if let Some(first) = first {
                    let pass = Arc::new(WritePass {
                        shared: shared.clone(),
                        _permit: permit.take().expect("borrow resolved twice"),
                    });
                    return Ok(gather_write(shared, &pass, length, first, second));
                }
                if state.rx_demand.is_closed() {
                    return Err(RingError::Closed);
                }
                state.install_demand(true, length)?
            };
            let _slot = DemandGuard {
                shared: shared.as_ref(),
                write_side: true,
                token,
            };
            _ = wait.await;
        }
    }

    /// Borrow the buffered data past `offset` as 1–2 non-consuming peek
    /// segments, waiting until more than `offset` elements are buffered.
    pub(crate) async fn borrow_peek(
        shared: &Arc<Self>,
        offset: usize,
    ) -> Result<Vec<PeekSegment<T>>, RingError> {
        {
            let state = shared.state.lock().unwrap();
            if state.rx_demand.is_closed() {
                return Err(RingError::Closed);
            }
            if state.tx_demand.is_closed() && state.reader_ready(shared.capacity()) <= offset {
                return Err(RingError::Closed);
            }
        }
        if offset >= shared.capacity() {
            return Err(RingError::Incapable);
        }

        let permit = shared
            .rx_gate
            .clone()
            .acquire_owned()
            .await
            .expect("reader gate semaphore closed");
        let mut permit = Some(permit);
        loop {
            let (wait, token) = {
                let mut state = shared.state.lock().unwrap();
                if state.reader_ready(shared.capacity()) > offset {
                    let pass = Arc::new(PeekPass {
                        shared: shared.clone(),
                        _permit: permit.take().expect("borrow resolved twice"),
                    });
                    let positions = state.reader_positions(shared.capacity());
                    return Ok(gather_peek(shared, &pass, offset, positions));
                }
                if state.tx_demand.is_closed() {
                    return Err(RingError::Closed);
                }
                state.install_demand(false, offset + 1)?
            };
            let _slot = DemandGuard {
                shared: shared.as_ref(),
                write_side: false,
                token,
            };
            _ = wait.await;
        }
    }

    /// Discard up to `length` buffered elements without exposing them,
    /// waiting for data exactly as a read would. Returns the discarded count.
    pub(crate) async fn discard(shared: &Arc<Self>, length: usize) -> Result<usize, RingError> {
        {
            let state = shared.state.lock().unwrap();
            if state.rx_demand.is_closed() {
                return Err(RingError::Closed);
            }
            if state.tx_demand.is_closed() && state.reader_ready(shared.capacity()) == 0 {
                return Err(RingError::Closed);
            }
        }
        if length == 0 {
            return Ok(0);
        }
        if length > shared.capacity() {
            return Err(RingError::Incapable);
        }

        let _permit = shared
            .rx_gate
            .clone()
            .acquire_owned()
            .await
            .expect("reader gate semaphore closed");
        loop {
            let (wait, token) = {
                let mut state = shared.state.lock().unwrap();
                let (first, second) = state.reader_positions(shared.capacity());
                if let Some(first) = first {
                    let mut remaining = length;
                    let take = min(remaining, first.length);
                    state.advance_read(take, shared.capacity());
                    remaining -= take;
                    if remaining > 0 {
                        if let Some(second) = second {
                            let take = min(remaining, second.length);
                            state.advance_read(take, shared.capacity());
                            remaining -= take;
                        }
                    }
                    let waiter = state.tx_demand.take_waiter();
                    drop(state);
                    if let Some(waiter) = waiter {
                        _ = waiter.signal.send(());
                    }
                    return Ok(length - remaining);
                }
                if state.tx_demand.is_closed() {
                    return Err(RingError::Closed);
                }
                state.install_demand(false, length)?
            };
            let _slot = DemandGuard {
                shared: shared.as_ref(),
                write_side: false,
                token,
            };
            _ = wait.await;
        }
    }
}

fn gather_read<T>(
    shared: &Arc<Shared<T>>,
    pass: &Arc<ReadPass<T>>,
    length: usize,
    first: IoPosition,
    second: Option<IoPosition>,
) -> Vec<ReadSegment<T>> {
    let mut segments = Vec::with_capacity(2);
    let take = min(length, first.length);
    segments.push(ReadSegment::from_ring(
        pass.clone(),
        shared.run_ptr(first.offset),
        take,
    ));
    let rest = length - take;
    if rest > 0 {
        if let Some(second) = second {
            segments.push(ReadSegment::from_ring(
                pass.clone(),
                shared.run_ptr(second.offset),
                min(rest, second.length),
            ));
        }
    }
    segments
}

fn gather_write<T>(
    shared: &Arc<Shared<T>>,
    pass: &Arc<WritePass<T>>,
    length: usize,
    first: IoPosition,
    second: Option<IoPosition>,
) -> Vec<WriteSegment<T>> {
    let mut segments = Vec::with_capacity(2);
    let take = min(length, first.length);
    segments.push(WriteSegment::from_ring(
        pass.clone(),
        shared.run_ptr(first.offset),
        take,
    ));
    let rest = length - take;
    if rest > 0 {
        if let Some(second) = second {
            segments.push(WriteSegment::from_ring(
                pass.clone(),
                shared.run_ptr(second.offset),
                min(rest, second.length),
            ));
        }
    }
    segments
}

fn gather_peek<T>(
    shared: &Arc<Shared<T>>,
    pass: &Arc<PeekPass<T>>,
    mut skip: usize,
    positions: Positions,
) -> Vec<PeekSegment<T>> {
    let (first, second) = positions;
    let mut segments = Vec::with_capacity(2);
    for run in [first, second].into_iter().flatten() {
        if skip >= run.length {
            skip -= run.length;
            continue;
        }
        segments.push(PeekSegment::from_ring(
            pass.clone(),
            shared.run_ptr(run.offset + skip),
            run.length - skip,
        ));
        skip = 0;
    }
    segments
}

/// Keeps the reader gate held and the storage alive for the lifetime of one
/// scatter/gather read result; the last released segment of the result drops
/// it, which returns the gate.
pub(crate) struct ReadPass<T> {
    shared: Arc<Shared<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T> ReadPass<T> {
    pub(crate) fn reclaim(&self, consumed: usize) {
        self.shared.reclaim_read(consumed);
    }
}

/// Writer-side counterpart of [`ReadPass`].
pub(crate) struct WritePass<T> {
    shared: Arc<Shared<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T> WritePass<T> {
    pub(crate) fn reclaim(&self, consumed: usize) {
        self.shared.reclaim_write(consumed);
    }
}

/// Gate hold for a peek result. Dropping it returns the reader gate; peeks
/// never advance the read cursor.
pub(crate) struct PeekPass<T> {
    shared: Arc<Shared<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T> PeekPass<T> {
    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.shared
    }
}

/// Fixed-capacity single-producer/single-consumer ring buffer with zero-copy
/// segment borrowing and asynchronous backpressure.
///
/// A producer borrows writable [`WriteSegment`]s, fills them in place and
/// drops them, which commits the filled length and wakes a blocked reader.
/// The consumer side mirrors this with [`ReadSegment`]s. [`RingBuffer::split`]
/// hands out one closing handle per direction.
pub struct RingBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Default> RingBuffer<T> {
    /// Create a buffer holding exactly `capacity` elements. The capacity is
    /// fixed for the lifetime of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must not be zero");
        let storage = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();
        Self {
            shared: Arc::new(Shared {
                storage,
                state: Mutex::new(State {
                    tx_pos: 0,
                    rx_pos: 0,
                    inversed: false,
                    tx_demand: Demand::Idle,
                    rx_demand: Demand::Idle,
                    next_token: 0,
                }),
                tx_gate: Arc::new(Semaphore::new(1)),
                rx_gate: Arc::new(Semaphore::new(1)),
            }),
        }
    }
}

impl<T> RingBuffer<T> {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Number of buffered elements the reader could consume right now.
    pub fn reader_ready(&self) -> usize {
        self.shared.reader_ready()
    }

    /// Number of free element slots the writer could fill right now.
    pub fn writer_free(&self) -> usize {
        self.shared.writer_free()
    }

    /// Borrow up to `length` buffered elements as 1–2 [`ReadSegment`]s, in
    /// consumption order. Waits while the buffer is empty and the producer is
    /// still open; fails with [`RingError::Closed`] once it is drained after
    /// a producer close.
    ///
    /// The segments must be consumed and dropped in order; the reader gate is
    /// held until the last of them is released.
    pub async fn read(&self, length: usize) -> Result<Vec<ReadSegment<T>>, RingError> {
        Shared::borrow_read(&self.shared, length).await
    }

    /// Borrow up to `length` free element slots as 1–2 [`WriteSegment`]s, in
    /// fill order. Waits while the buffer is full and the consumer is still
    /// open.
    ///
    /// The segments must be filled and dropped in order; the writer gate is
    /// held until the last of them is released.
    pub async fn write(&self, length: usize) -> Result<Vec<WriteSegment<T>>, RingError> {
        Shared::borrow_write(&self.shared, length).await
    }

    /// Borrow everything buffered past `offset` as non-consuming
    /// [`PeekSegment`]s, waiting until more than `offset` elements are
    /// buffered. Releasing them returns the reader gate without moving the
    /// read cursor, so a following `read` observes the same data.
    pub async fn peek(&self, offset: usize) -> Result<Vec<PeekSegment<T>>, RingError> {
        Shared::borrow_peek(&self.shared, offset).await
    }

    /// Discard up to `length` buffered elements, exactly as a read would but
    /// without exposing the content. Returns the discarded count.
    pub async fn skip(&self, length: usize) -> Result<usize, RingError> {
        Shared::discard(&self.shared, length).await
    }

    pub fn is_tx_closed(&self) -> bool {
        self.shared.is_tx_closed()
    }

    pub fn is_rx_closed(&self) -> bool {
        self.shared.is_rx_closed()
    }

    /// Split into one closing handle per direction. Dropping a handle
    /// half-closes its direction exactly once.
    pub fn split(self) -> (RingTx<T>, RingRx<T>) {
        (
            RingTx::new(self.shared.clone(), true),
            RingRx::new(self.shared, true),
        )
    }

    /// A producer handle that does not close its direction on drop, for
    /// callers that manage the close through another handle.
    pub fn tx_handle(&self) -> RingTx<T> {
        RingTx::new(self.shared.clone(), false)
    }

    /// Consumer-side counterpart of [`RingBuffer::tx_handle`].
    pub fn rx_handle(&self) -> RingRx<T> {
        RingRx::new(self.shared.clone(), false)
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("tx_pos", &state.tx_pos)
            .field("rx_pos", &state.rx_pos)
            .field("inversed", &state.inversed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn fill(ring: &RingBuffer<u8>, data: &[u8]) {
        let mut wrote = 0;
        while wrote < data.len() {
            let segments = ring.write(data.len() - wrote).await.unwrap();
            for mut segment in segments {
                wrote += segment.copy_from(&data[wrote..]);
            }
        }
    }

    async fn drain(ring: &RingBuffer<u8>, length: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let segments = ring.read(length).await.unwrap();
        for mut segment in segments {
            out.extend_from_slice(segment.take());
        }
        out
    }

    #[tokio::test]
    async fn test_borrow_never_exceeds_demand() {
        let ring = RingBuffer::<u8>::new(16);
        for i in 0..ring.capacity() {
            let segments = ring.write(i).await.unwrap();
            let granted: usize = segments.iter().map(|s| s.len()).sum();
            assert!(granted <= i);
            assert!(i == 0 || granted > 0);
            for mut segment in segments {
                let len = segment.len();
                segment.advance(len);
            }

            let segments = ring.read(i).await.unwrap();
            let consumed: usize = segments
                .into_iter()
                .map(|mut s| s.take().len())
                .sum();
            assert!(consumed <= i);
            assert_eq!(consumed, granted);
        }
    }

    #[tokio::test]
    async fn test_borrow_rejects_over_capacity() {
        let ring = RingBuffer::<u8>::new(8);
        assert_eq!(ring.write(9).await.unwrap_err(), RingError::Incapable);
        assert_eq!(ring.read(9).await.unwrap_err(), RingError::Incapable);
        assert_eq!(ring.skip(9).await.unwrap_err(), RingError::Incapable);
        assert_eq!(ring.peek(8).await.unwrap_err(), RingError::Incapable);
    }

    #[tokio::test]
    async fn test_zero_length_borrow_is_empty() {
        let ring = RingBuffer::<u8>::new(8);
        assert!(ring.write(0).await.unwrap().is_empty());
        assert!(ring.read(0).await.unwrap().is_empty());
        assert_eq!(ring.skip(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wraparound_yields_two_segments() {
        let ring = RingBuffer::<u8>::new(8);
        fill(&ring, &[0, 1, 2, 3, 4, 5]).await;
        assert_eq!(drain(&ring, 4).await, vec![0, 1, 2, 3]);

        // the free region now straddles the boundary: [6, 8) then [0, 4)
        let segments = ring.write(6).await.unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].len(), 2);
        assert_eq!(segments[1].len(), 4);
        for (i, mut segment) in segments.into_iter().enumerate() {
            let src: Vec<u8> = (0..segment.len() as u8).map(|v| 10 + 10 * i as u8 + v).collect();
            segment.copy_from(&src);
        }

        let segments = ring.read(8).await.unwrap();
        assert_eq!(segments.len(), 2);
        let mut got = Vec::new();
        for mut segment in segments {
            got.extend_from_slice(segment.take());
        }
        assert_eq!(got, vec![4, 5, 10, 11, 20, 21, 22, 23]);
    }

    #[tokio::test]
    async fn test_cursor_rewind_on_drain() {
        let ring = RingBuffer::<u8>::new(8);
        fill(&ring, &[1, 2, 3]).await;
        assert_eq!(drain(&ring, 3).await, vec![1, 2, 3]);
        {
            let state = ring.shared.state.lock().unwrap();
            assert_eq!(state.tx_pos, 0);
            assert_eq!(state.rx_pos, 0);
            assert!(!state.inversed);
        }
        // a full borrow is available again without wrapping
        let segments = ring.write(8).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].len(), 8);
    }

    #[tokio::test]
    async fn test_partial_consumption_reclaims_only_consumed() {
        let ring = RingBuffer::<u8>::new(8);
        fill(&ring, &[7, 8, 9, 10]).await;

        let mut segments = ring.read(4).await.unwrap();
        let mut dst = [0u8; 2];
        segments[0].copy_to(&mut dst);
        assert_eq!(dst, [7, 8]);
        drop(segments);

        // only the two consumed bytes were reclaimed
        assert_eq!(ring.reader_ready(), 2);
        assert_eq!(drain(&ring, 4).await, vec![9, 10]);
    }

    #[tokio::test]
    async fn test_unconsumed_drop_advances_nothing() {
        let ring = RingBuffer::<u8>::new(8);
        fill(&ring, &[1, 2, 3]).await;
        drop(ring.read(3).await.unwrap());
        assert_eq!(drain(&ring, 3).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_peek_is_idempotent_and_non_destructive() {
        let ring = RingBuffer::<u8>::new(8);
        fill(&ring, b"abcd").await;

        for _ in 0..2 {
            let peeked = ring.peek(0).await.unwrap();
            let flat: Vec<u8> = peeked.iter().flat_map(|s| s.iter().copied()).collect();
            assert_eq!(flat, b"abcd");
        }
        let peeked = ring.peek(2).await.unwrap();
        assert_eq!(&*peeked[0], b"cd");
        drop(peeked);

        assert_eq!(drain(&ring, 4).await, b"abcd".to_vec());
    }

    #[tokio::test]
    async fn test_skip_commits_after_peek() {
        let ring = RingBuffer::<u8>::new(8);
        fill(&ring, b"header:x").await;

        let peeked = ring.peek(0).await.unwrap();
        assert_eq!(&*peeked[0], b"header:x");
        drop(peeked);

        assert_eq!(ring.skip(7).await.unwrap(), 7);
        assert_eq!(drain(&ring, 1).await, b"x".to_vec());
    }

    #[tokio::test]
    async fn test_skip_across_wrap_boundary() {
        let ring = RingBuffer::<u8>::new(8);
        fill(&ring, &[0; 6]).await;
        assert_eq!(ring.skip(4).await.unwrap(), 4);
        fill(&ring, &[1; 5]).await;
        // occupied region is [4, 8) plus [0, 3); discard it in one call
        assert_eq!(ring.skip(8).await.unwrap(), 7);
        assert_eq!(ring.reader_ready(), 0);
        assert_eq!(ring.writer_free(), 8);
    }

    #[tokio::test]
    async fn test_drain_then_close() {
        let ring = RingBuffer::<u8>::new(8);
        fill(&ring, &[1, 2, 3]).await;
        ring.shared.set_tx_closed();
        assert!(ring.is_tx_closed());

        assert_eq!(drain(&ring, 2).await, vec![1, 2]);
        assert_eq!(drain(&ring, 2).await, vec![3]);
        assert_eq!(ring.read(1).await.unwrap_err(), RingError::Closed);
        assert_eq!(ring.skip(1).await.unwrap_err(), RingError::Closed);
        assert_eq!(ring.peek(0).await.unwrap_err(), RingError::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let ring = RingBuffer::<u8>::new(8);
        ring.shared.set_tx_closed();
        ring.shared.set_tx_closed();
        assert!(ring.is_tx_closed());
        assert!(!ring.is_rx_closed());
    }

    #[tokio::test]
    async fn test_write_fails_only_when_closed_and_full() {
        let ring = RingBuffer::<u8>::new(4);
        ring.shared.set_rx_closed();
        // space remains, the borrow still succeeds
        let segments = ring.write(2).await.unwrap();
        let granted: usize = segments.iter().map(|s| s.len()).sum();
        assert_eq!(granted, 2);
        for mut segment in segments {
            let len = segment.len();
            segment.advance(len);
        }
        fill(&ring, &[0, 0]).await;
        assert_eq!(ring.write(1).await.unwrap_err(), RingError::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_wakes_blocked_reader() {
        let ring = std::sync::Arc::new(RingBuffer::<u8>::new(4));
        let reader = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.read(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ring.shared.set_tx_closed();
        assert_eq!(reader.await.unwrap().unwrap_err(), RingError::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_wakes_blocked_writer() {
        let ring = std::sync::Arc::new(RingBuffer::<u8>::new(2));
        fill(&ring, &[0, 0]).await;
        let writer = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.write(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ring.shared.set_rx_closed();
        assert_eq!(writer.await.unwrap().unwrap_err(), RingError::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_read_leaves_ring_usable() {
        let ring = std::sync::Arc::new(RingBuffer::<u8>::new(4));
        let blocked = tokio::time::timeout(Duration::from_millis(20), ring.read(1)).await;
        assert!(blocked.is_err());

        // the stale waiter must not occupy the demand slot or the gate
        let reader = {
            let ring = ring.clone();
            tokio::spawn(async move {
                let mut segments = ring.read(1).await.unwrap();
                let mut dst = [0u8; 1];
                segments[0].copy_to(&mut dst);
                dst[0]
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        fill(&ring, &[42]).await;
        assert_eq!(reader.await.unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_write_leaves_ring_usable() {
        let ring = std::sync::Arc::new(RingBuffer::<u8>::new(2));
        fill(&ring, &[1, 2]).await;
        let blocked = tokio::time::timeout(Duration::from_millis(20), ring.write(1)).await;
        assert!(blocked.is_err());

        assert_eq!(drain(&ring, 2).await, vec![1, 2]);
        let segments = ring.write(2).await.unwrap();
        let granted: usize = segments.iter().map(|s| s.len()).sum();
        assert_eq!(granted, 2);
    }

    #[test]
    fn test_positions_cover_all_cursor_shapes() {
        let capacity = 8;
        let mut state = State {
            tx_pos: 0,
            rx_pos: 0,
            inversed: false,
            tx_demand: Demand::Idle,
            rx_demand: Demand::Idle,
            next_token: 0,
        };

        // empty: no reader runs, writer owns the full capacity
        assert_eq!(state.reader_ready(capacity), 0);
        assert_eq!(state.writer_free(capacity), 8);

        // writer ahead of reader
        state.tx_pos = 5;
        state.rx_pos = 2;
        assert_eq!(
            state.reader_positions(capacity),
            (
                Some(IoPosition {
                    offset: 2,
                    length: 3
                }),
                None
            )
        );
        assert_eq!(
            state.writer_positions(capacity),
            (
                Some(IoPosition {
                    offset: 5,
                    length: 3
                }),
                Some(IoPosition {
                    offset: 0,
                    length: 2
                })
            )
        );

        // inversed: occupied region straddles the boundary
        state.tx_pos = 2;
        state.rx_pos = 5;
        state.inversed = true;
        assert_eq!(
            state.reader_positions(capacity),
            (
                Some(IoPosition {
                    offset: 5,
                    length: 3
                }),
                Some(IoPosition {
                    offset: 0,
                    length: 2
                })
            )
        );
        assert_eq!(
            state.writer_positions(capacity),
            (
                Some(IoPosition {
                    offset: 2,
                    length: 3
                }),
                None
            )
        );

        // full: reader owns the whole capacity, writer nothing
        state.tx_pos = 5;
        assert_eq!(state.reader_ready(capacity), 8);
        assert_eq!(state.writer_free(capacity), 0);
    }

    #[test]
    #[should_panic(expected = "capacity must not be zero")]
    fn test_zero_capacity_panics() {
        let _ = RingBuffer::<u8>::new(0);
    }
}
