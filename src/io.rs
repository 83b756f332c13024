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

use std::{cmp::min, future::Future, sync::Arc};

use crate::{
    error::{IoError, RingError},
    ring::{RingBuffer, Shared},
    segment::{PeekSegment, ReadSegment, WriteSegment},
};

/// Consumer-side capability contract. Framing layers that demultiplex the
/// byte stream consume this surface and nothing below it.
pub trait AsyncReadBuf<T> {
    /// Borrow up to `length` buffered elements as 1–2 read segments.
    fn read(
        &mut self,
        length: usize,
    ) -> impl Future<Output = Result<Vec<ReadSegment<T>>, RingError>> + Send;

    /// Borrow the buffered data past `offset` without consuming it.
    ///
    /// Peeking at the same offset repeatedly yields the same data until a
    /// `read` or `skip` intervenes.
    fn peek(
        &mut self,
        offset: usize,
    ) -> impl Future<Output = Result<Vec<PeekSegment<T>>, RingError>> + Send;

    /// Discard up to `length` buffered elements, returning the count.
    fn skip(&mut self, length: usize) -> impl Future<Output = Result<usize, RingError>> + Send;

    /// true once the producer half has been closed
    fn is_tx_closed(&self) -> bool;
}

/// Producer-side capability contract.
pub trait AsyncWriteBuf<T> {
    /// Borrow up to `length` free element slots as 1–2 write segments.
    fn write(
        &mut self,
        length: usize,
    ) -> impl Future<Output = Result<Vec<WriteSegment<T>>, RingError>> + Send;

    /// true once the consumer half has been closed
    fn is_rx_closed(&self) -> bool;
}

impl<U, T: AsyncReadBuf<U> + Send> AsyncReadBuf<U> for &mut T {
    async fn read(&mut self, length: usize) -> Result<Vec<ReadSegment<U>>, RingError> {
        (**self).read(length).await
    }

    async fn peek(&mut self, offset: usize) -> Result<Vec<PeekSegment<U>>, RingError> {
        (**self).peek(offset).await
    }

    async fn skip(&mut self, length: usize) -> Result<usize, RingError> {
        (**self).skip(length).await
    }

    fn is_tx_closed(&self) -> bool {
        (**self).is_tx_closed()
    }
}

impl<U, T: AsyncWriteBuf<U> + Send> AsyncWriteBuf<U> for &mut T {
    async fn write(&mut self, length: usize) -> Result<Vec<WriteSegment<U>>, RingError> {
        (**self).write(length).await
    }

    fn is_rx_closed(&self) -> bool {
        (**self).is_rx_closed()
    }
}

impl<T: Send> AsyncReadBuf<T> for RingBuffer<T> {
    async fn read(&mut self, length: usize) -> Result<Vec<ReadSegment<T>>, RingError> {
        RingBuffer::read(self, length).await
    }

    async fn peek(&mut self, offset: usize) -> Result<Vec<PeekSegment<T>>, RingError> {
        RingBuffer::peek(self, offset).await
    }

    async fn skip(&mut self, length: usize) -> Result<usize, RingError> {
        RingBuffer::skip(self, length).await
    }

    fn is_tx_closed(&self) -> bool {
        RingBuffer::is_tx_closed(self)
    }
}

impl<T: Send> AsyncWriteBuf<T> for RingBuffer<T> {
    async fn write(&mut self, length: usize) -> Result<Vec<WriteSegment<T>>, RingError> {
        RingBuffer::write(self, length).await
    }

    fn is_rx_closed(&self) -> bool {
        RingBuffer::is_rx_closed(self)
    }
}

/// Producer half of a ring buffer. Owns the right to half-close the write
/// direction; a handle created by [`RingBuffer::split`] exercises it on drop.
pub struct RingTx<T> {
    shared: Arc<Shared<T>>,
    close_on_drop: bool,
}

impl<T> RingTx<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, close_on_drop: bool) -> Self {
        Self {
            shared,
            close_on_drop,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Borrow up to `length` free element slots as 1–2 [`WriteSegment`]s.
    pub async fn write(&mut self, length: usize) -> Result<Vec<WriteSegment<T>>, RingError> {
        Shared::borrow_write(&self.shared, length).await
    }

    /// Copy all of `src` into the buffer, borrowing and filling segments
    /// until every element is placed. On success the count equals
    /// `src.len()`. On failure, elements committed by segments released
    /// before the failing borrow stay committed.
    pub async fn write_bytes(&mut self, src: &[T]) -> Result<usize, IoError>
    where
        T: Copy,
    {
        let mut filled = 0;
        while filled < src.len() {
            let want = min(src.len() - filled, self.shared.capacity());
            let segments = Shared::borrow_write(&self.shared, want).await?;
            for mut segment in segments {
                filled += segment.copy_from(&src[filled..]);
            }
        }
        Ok(filled)
    }

    pub fn is_rx_closed(&self) -> bool {
        self.shared.is_rx_closed()
    }
}

impl<T> Drop for RingTx<T> {
    fn drop(&mut self) {
        if self.close_on_drop {
            self.shared.set_tx_closed();
        }
    }
}

impl<T: Send> AsyncWriteBuf<T> for RingTx<T> {
    async fn write(&mut self, length: usize) -> Result<Vec<WriteSegment<T>>, RingError> {
        RingTx::write(self, length).await
    }

    fn is_rx_closed(&self) -> bool {
        RingTx::is_rx_closed(self)
    }
}

/// Consumer half of a ring buffer. Owns the right to half-close the read
/// direction; a handle created by [`RingBuffer::split`] exercises it on drop.
pub struct RingRx<T> {
    shared: Arc<Shared<T>>,
    close_on_drop: bool,
}

impl<T> RingRx<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, close_on_drop: bool) -> Self {
        Self {
            shared,
            close_on_drop,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Borrow up to `length` buffered elements as 1–2 [`ReadSegment`]s.
    pub async fn read(&mut self, length: usize) -> Result<Vec<ReadSegment<T>>, RingError> {
        Shared::borrow_read(&self.shared, length).await
    }

    /// Borrow the buffered data past `offset` without consuming it.
    pub async fn peek(&mut self, offset: usize) -> Result<Vec<PeekSegment<T>>, RingError> {
        Shared::borrow_peek(&self.shared, offset).await
    }

    /// Discard up to `length` buffered elements, returning the count.
    pub async fn skip(&mut self, length: usize) -> Result<usize, RingError> {
        Shared::discard(&self.shared, length).await
    }

    /// Fill all of `dst` from the buffer, borrowing and draining segments
    /// until every element is placed. On success the count equals
    /// `dst.len()`. On failure, elements consumed by segments released
    /// before the failing borrow stay consumed.
    pub async fn read_bytes(&mut self, dst: &mut [T]) -> Result<usize, IoError>
    where
        T: Copy,
    {
        let mut filled = 0;
        while filled < dst.len() {
            let want = min(dst.len() - filled, self.shared.capacity());
            let segments = Shared::borrow_read(&self.shared, want).await?;
            for mut segment in segments {
                filled += segment.copy_to(&mut dst[filled..]);
            }
        }
        Ok(filled)
    }

    pub fn is_tx_closed(&self) -> bool {
        self.shared.is_tx_closed()
    }
}

impl<T> Drop for RingRx<T> {
    fn drop(&mut self) {
        if self.close_on_drop {
            self.shared.set_rx_closed();
        }
    }
}

impl<T: Send> AsyncReadBuf<T> for RingRx<T> {
    async fn read(&mut self, length: usize) -> Result<Vec<ReadSegment<T>>, RingError> {
        RingRx::read(self, length).await
    }

    async fn peek(&mut self, offset: usize) -> Result<Vec<PeekSegment<T>>, RingError> {
        RingRx::peek(self, offset).await
    }

    async fn skip(&mut self, length: usize) -> Result<usize, RingError> {
        RingRx::skip(self, length).await
    }

    fn is_tx_closed(&self) -> bool {
        RingRx::is_tx_closed(self)
    }
}
