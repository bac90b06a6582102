// Copyright (C) 2023 the airstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Consumer-owned reassembly storage.

use std::ops::{Deref, DerefMut};

/// Storage for an in-progress reassembly.
///
/// A buffer is logically owned by the consumer and loaned to a reader for
/// the span between one callback upcall and the next on that buffer. The
/// reader writes into it but never frees it: ownership always returns to the
/// consumer through a [`crate::frame::FrameEvent`] or
/// [`crate::stream::NaluEvent`], and the consumer decides whether to hand
/// the same buffer back or grant a different one.
///
/// The capacity is fixed at construction; readers track the written length
/// separately and report it alongside each upcall.
pub struct ReassemblyBuffer {
    data: Box<[u8]>,
}

impl ReassemblyBuffer {
    /// Allocates a zeroed buffer with the given usable capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// A zero-capacity buffer. A reader holding one stalls all writes until
    /// the consumer grants real storage.
    pub fn empty() -> Self {
        Self { data: Box::new([]) }
    }

    /// Usable length of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl From<Vec<u8>> for ReassemblyBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
        }
    }
}

impl Deref for ReassemblyBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for ReassemblyBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for ReassemblyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReassemblyBuffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}
