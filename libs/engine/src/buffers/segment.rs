//! Fixed-size slices of a registered buffer
//!
//! A `Segment` is the owned handle to one slice. It is deliberately not
//! `Clone`: whoever holds it is the only party allowed to touch the bytes.
//! Dropping a segment does not return it to its pool; ownership is handed
//! back explicitly through [`SegmentPool::release`](super::SegmentPool::release)
//! or into the facility through `hand_off`.

use super::pool::PoolBuffer;
use super::token::SegmentToken;
use crate::facility::BufferDescriptor;
use std::sync::Arc;

pub struct Segment {
    buffer: Arc<PoolBuffer>,
    token: SegmentToken,
    len: u32,
}

impl Segment {
    pub(crate) fn new(buffer: Arc<PoolBuffer>, token: SegmentToken) -> Self {
        Self {
            buffer,
            token,
            len: 0,
        }
    }

    #[inline]
    pub fn token(&self) -> SegmentToken {
        self.token
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.segment_length() as usize
    }

    /// Bytes currently in use
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len()
    }

    /// # Panics
    ///
    /// Panics if `len` exceeds the segment capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.capacity(),
            "segment length {} exceeds capacity {}",
            len,
            self.capacity()
        );
        self.len = len as u32;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Used bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the segment range lies inside the live buffer and this handle
        // is its only owner.
        unsafe { std::slice::from_raw_parts(self.buffer.segment_ptr(self.token), self.len()) }
    }

    /// Used bytes, mutable
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`, and `&mut self` makes the access exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.buffer.segment_ptr(self.token), self.len()) }
    }

    /// Unused tail of the segment, from `len` to capacity
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let len = self.len();
        let remaining = self.remaining();
        // SAFETY: `len..capacity` lies inside the segment range.
        unsafe {
            std::slice::from_raw_parts_mut(self.buffer.segment_ptr(self.token).add(len), remaining)
        }
    }

    /// Copy `bytes` after the used part; false if they do not fit
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.spare_mut()[..bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len() as u32;
        true
    }

    /// Descriptor of the used bytes, for sends
    pub fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor {
            buffer_id: self.buffer.registration(),
            offset: self.buffer.segment_offset(self.token),
            length: self.len,
        }
    }

    /// Descriptor of the whole segment, for receives
    pub fn receive_descriptor(&self) -> BufferDescriptor {
        BufferDescriptor {
            buffer_id: self.buffer.registration(),
            offset: self.buffer.segment_offset(self.token),
            length: self.buffer.segment_length(),
        }
    }

    pub(crate) fn buffer(&self) -> &Arc<PoolBuffer> {
        &self.buffer
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("token", &self.token)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
