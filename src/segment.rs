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

use std::{cmp::min, fmt, ops::Deref, ptr::NonNull, slice, sync::Arc};

use bytes::Bytes;

use crate::ring::{PeekPass, ReadPass, WritePass};

/// A disposable, exclusively-owned view over filled storage, borrowed from a
/// ring buffer by a read call.
///
/// Consuming from the front (via [`advance`], [`take`] or [`copy_to`]) marks
/// elements as read; dropping the segment reports the consumed length back to
/// the ring exactly once, which frees the space and wakes a blocked writer.
/// Elements left unconsumed stay buffered.
///
/// [`advance`]: ReadSegment::advance
/// [`take`]: ReadSegment::take
/// [`copy_to`]: ReadSegment::copy_to
pub struct ReadSegment<T> {
    ptr: NonNull<T>,
    len: usize,
    consumed: usize,
    owner: ReadOwner<T>,
}

enum ReadOwner<T> {
    /// borrowed out of a ring; releasing reports the consumed length back
    Ring(Arc<ReadPass<T>>),
    /// caller-provided backing with no owner to reclaim into
    Boxed { ptr: *mut T, cap: usize },
    /// zero-length view
    None,
}

// A segment is the only party touching its run of storage until it is
// dropped, so it moves across threads whenever the element type does.
unsafe impl<T: Send> Send for ReadSegment<T> {}

impl<T> ReadSegment<T> {
    pub(crate) fn from_ring(pass: Arc<ReadPass<T>>, ptr: NonNull<T>, len: usize) -> Self {
        Self {
            ptr,
            len,
            consumed: 0,
            owner: ReadOwner::Ring(pass),
        }
    }

    /// The zero-length segment. Releasing it is a no-op.
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            consumed: 0,
            owner: ReadOwner::None,
        }
    }

    /// Wrap caller-owned storage in a segment. There is no ring to reclaim
    /// into; releasing the segment just frees the backing.
    pub fn from_boxed(data: Box<[T]>) -> Self {
        let cap = data.len();
        let ptr = Box::into_raw(data) as *mut T;
        Self {
            // Box never hands out a null pointer, even for an empty slice
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len: cap,
            consumed: 0,
            owner: ReadOwner::Boxed { ptr, cap },
        }
    }

    /// Remaining unconsumed length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The remaining view.
    pub fn as_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Consume `n` elements from the front. The total consumed length is
    /// reported to the owner when the segment is released.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the remaining length.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len, "advance({}) past segment end({})", n, self.len);
        self.ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(n)) };
        self.len -= n;
        self.consumed += n;
    }

    /// Consume and return the whole remaining view.
    pub fn take(&mut self) -> &[T] {
        let view = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
        self.consumed += self.len;
        self.ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(self.len)) };
        self.len = 0;
        view
    }

    /// Copy up to `dst.len()` elements into `dst`, consuming them. Returns
    /// the copied count.
    pub fn copy_to(&mut self, dst: &mut [T]) -> usize
    where
        T: Copy,
    {
        let n = min(self.len, dst.len());
        dst[..n].copy_from_slice(&self.as_slice()[..n]);
        self.advance(n);
        n
    }

    /// Lend out a prefix of at most `length` elements. The parent is
    /// inaccessible until the returned slice is dropped, which forwards the
    /// slice's consumed length into the parent without touching the ring.
    pub fn slice_to(&mut self, length: usize) -> ReadSlice<'_, T> {
        let len = min(length, self.len);
        ReadSlice {
            ptr: self.ptr,
            len,
            consumed: 0,
            parent: self,
        }
    }
}

impl ReadSegment<u8> {
    /// Copy the remaining view out as [`Bytes`], consuming it.
    pub fn copy_to_bytes(&mut self) -> Bytes {
        let bytes = Bytes::copy_from_slice(self.as_slice());
        let len = self.len;
        self.advance(len);
        bytes
    }
}

impl<T> fmt::Debug for ReadSegment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSegment")
            .field("len", &self.len)
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl<T> Drop for ReadSegment<T> {
    fn drop(&mut self) {
        match &self.owner {
            ReadOwner::Ring(pass) => pass.reclaim(self.consumed),
            ReadOwner::Boxed { ptr, cap } => unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(*ptr, *cap)));
            },
            ReadOwner::None => {}
        }
    }
}

/// A prefix lent out of a [`ReadSegment`] by [`ReadSegment::slice_to`].
/// Dropping it advances the parent by exactly what was consumed from it.
pub struct ReadSlice<'a, T> {
    parent: &'a mut ReadSegment<T>,
    ptr: NonNull<T>,
    len: usize,
    consumed: usize,
}

impl<T> ReadSlice<'_, T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len, "advance({}) past slice end({})", n, self.len);
        self.ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(n)) };
        self.len -= n;
        self.consumed += n;
    }

    pub fn take(&mut self) -> &[T] {
        let view = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
        self.consumed += self.len;
        self.ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(self.len)) };
        self.len = 0;
        view
    }

    pub fn copy_to(&mut self, dst: &mut [T]) -> usize
    where
        T: Copy,
    {
        let n = min(self.len, dst.len());
        dst[..n].copy_from_slice(&self.as_slice()[..n]);
        self.advance(n);
        n
    }
}

impl<T> Drop for ReadSlice<'_, T> {
    fn drop(&mut self) {
        self.parent.advance(self.consumed);
    }
}

/// A disposable, exclusively-owned view over free storage, borrowed from a
/// ring buffer by a write call.
///
/// Filling from the front (via [`advance`], [`take`] or [`copy_from`]) marks
/// elements as written; dropping the segment commits the filled length to the
/// ring exactly once, which publishes the data and wakes a blocked reader.
///
/// [`advance`]: WriteSegment::advance
/// [`take`]: WriteSegment::take
/// [`copy_from`]: WriteSegment::copy_from
pub struct WriteSegment<T> {
    ptr: NonNull<T>,
    len: usize,
    consumed: usize,
    owner: WriteOwner<T>,
}

enum WriteOwner<T> {
    Ring(Arc<WritePass<T>>),
    Boxed { ptr: *mut T, cap: usize },
    None,
}

unsafe impl<T: Send> Send for WriteSegment<T> {}

impl<T> WriteSegment<T> {
    pub(crate) fn from_ring(pass: Arc<WritePass<T>>, ptr: NonNull<T>, len: usize) -> Self {
        Self {
            ptr,
            len,
            consumed: 0,
            owner: WriteOwner::Ring(pass),
        }
    }

    /// The zero-length segment. Releasing it is a no-op.
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            consumed: 0,
            owner: WriteOwner::None,
        }
    }

    /// Wrap caller-owned storage in a segment, so it can be filled through
    /// the segment interface. Recover the backing with
    /// [`WriteSegment::into_boxed`]; plain dropping frees it.
    pub fn from_boxed(data: Box<[T]>) -> Self {
        let cap = data.len();
        let ptr = Box::into_raw(data) as *mut T;
        Self {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len: cap,
            consumed: 0,
            owner: WriteOwner::Boxed { ptr, cap },
        }
    }

    /// Remaining unfilled length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The remaining view, for filling in place.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Mark `n` elements at the front as filled. The total filled length is
    /// committed to the owner when the segment is released.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the remaining length.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len, "advance({}) past segment end({})", n, self.len);
        self.ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(n)) };
        self.len -= n;
        self.consumed += n;
    }

    /// Mark the whole remaining view as filled and return it for writing.
    pub fn take(&mut self) -> &mut [T] {
        let view = unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
        self.consumed += self.len;
        self.ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(self.len)) };
        self.len = 0;
        view
    }

    /// Copy up to `self.len()` elements out of `src`, filling the front.
    /// Returns the copied count.
    pub fn copy_from(&mut self, src: &[T]) -> usize
    where
        T: Copy,
    {
        let n = min(self.len, src.len());
        self.as_mut_slice()[..n].copy_from_slice(&src[..n]);
        self.advance(n);
        n
    }

    /// Lend out a prefix of at most `length` elements. The parent is
    /// inaccessible until the returned slice is dropped, which forwards the
    /// slice's filled length into the parent without touching the ring.
    pub fn slice_to(&mut self, length: usize) -> WriteSlice<'_, T> {
        let len = min(length, self.len);
        WriteSlice {
            ptr: self.ptr,
            len,
            consumed: 0,
            parent: self,
        }
    }

    /// Recover the caller-owned backing handed in via
    /// [`WriteSegment::from_boxed`]. A segment borrowed from a ring is
    /// released normally instead and yields `None`.
    pub fn into_boxed(self) -> Option<Box<[T]>> {
        let mut this = std::mem::ManuallyDrop::new(self);
        match std::mem::replace(&mut this.owner, WriteOwner::None) {
            WriteOwner::Boxed { ptr, cap } => {
                Some(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, cap)) })
            }
            WriteOwner::Ring(pass) => {
                pass.reclaim(this.consumed);
                None
            }
            WriteOwner::None => None,
        }
    }
}

impl<T> fmt::Debug for WriteSegment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSegment")
            .field("len", &self.len)
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl<T> Drop for WriteSegment<T> {
    fn drop(&mut self) {
        match &self.owner {
            WriteOwner::Ring(pass) => pass.reclaim(self.consumed),
            WriteOwner::Boxed { ptr, cap } => unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(*ptr, *cap)));
            },
            WriteOwner::None => {}
        }
    }
}

/// A prefix lent out of a [`WriteSegment`] by [`WriteSegment::slice_to`].
/// Dropping it advances the parent by exactly what was filled into it.
pub struct WriteSlice<'a, T> {
    parent: &'a mut WriteSegment<T>,
    ptr: NonNull<T>,
    len: usize,
    consumed: usize,
}

impl<T> WriteSlice<'_, T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len, "advance({}) past slice end({})", n, self.len);
        self.ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(n)) };
        self.len -= n;
        self.consumed += n;
    }

    pub fn take(&mut self) -> &mut [T] {
        let view = unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
        self.consumed += self.len;
        self.ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(self.len)) };
        self.len = 0;
        view
    }

    pub fn copy_from(&mut self, src: &[T]) -> usize
    where
        T: Copy,
    {
        let n = min(self.len, src.len());
        self.as_mut_slice()[..n].copy_from_slice(&src[..n]);
        self.advance(n);
        n
    }
}

impl<T> Drop for WriteSlice<'_, T> {
    fn drop(&mut self) {
        self.parent.advance(self.consumed);
    }
}

/// A read-only, non-consuming view over buffered data, produced by a peek.
/// Releasing it returns the reader gate without advancing the read cursor.
pub struct PeekSegment<T> {
    ptr: NonNull<T>,
    len: usize,
    _pass: Arc<PeekPass<T>>,
}

unsafe impl<T: Send> Send for PeekSegment<T> {}

impl<T> PeekSegment<T> {
    pub(crate) fn from_ring(pass: Arc<PeekPass<T>>, ptr: NonNull<T>, len: usize) -> Self {
        debug_assert!(len <= pass.shared().capacity());
        Self {
            ptr,
            len,
            _pass: pass,
        }
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> fmt::Debug for PeekSegment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeekSegment").field("len", &self.len).finish()
    }
}

impl<T> Deref for PeekSegment<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}
