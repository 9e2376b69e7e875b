//! Aligned byte storage used for host buffers and simulated device allocations.

use std::fmt;

use brainflow_foundation::Element;

/// Word size backing every buffer. Views of any [`Element`] stay aligned.
const WORD: usize = std::mem::size_of::<u64>();

/// A zero-initialised byte buffer aligned to 8 bytes.
///
/// Backed by a `Vec<u64>` so typed views can be cast in place with
/// `bytemuck` regardless of the element type.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AlignedBytes {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBytes {
    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD)],
            len,
        }
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }

    /// View the whole buffer as elements of `T`. Trailing bytes that do not
    /// form a full element are excluded.
    pub fn view<T: Element>(&self) -> &[T] {
        let whole = self.len - self.len % std::mem::size_of::<T>();
        bytemuck::cast_slice(&self.as_bytes()[..whole])
    }

    /// Mutable counterpart of [`AlignedBytes::view`].
    pub fn view_mut<T: Element>(&mut self) -> &mut [T] {
        let whole = self.len - self.len % std::mem::size_of::<T>();
        bytemuck::cast_slice_mut(&mut self.as_bytes_mut()[..whole])
    }
}

impl fmt::Debug for AlignedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBytes").field("len", &self.len).finish()
    }
}
