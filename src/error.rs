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

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Closed means that the peer direction is permanently closed and nothing
    /// is left to exchange. A reader still drains buffered data before
    /// observing this.
    #[error("ring buffer closed by peer")]
    Closed,

    /// Incapable means that the request lies outside the structural bounds of
    /// the buffer: a borrow longer than the total capacity, or a peek offset
    /// at or past the capacity. Retrying with the same arguments will never
    /// succeed.
    #[error("request exceeds ring buffer capacity")]
    Incapable,
}

/// Error surfaced by the bulk-copy helpers ([`RingTx::write_bytes`] and
/// [`RingRx::read_bytes`]), wrapping the borrow-level error that aborted the
/// copy loop. Elements committed by segments released before the failing
/// borrow stay committed.
///
/// [`RingTx::write_bytes`]: crate::RingTx::write_bytes
/// [`RingRx::read_bytes`]: crate::RingRx::read_bytes
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    #[error("segment borrow failed: {0}")]
    Borrow(#[from] RingError),
}
