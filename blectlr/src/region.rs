//! Bump allocator over the caller-supplied memory region.
//!
//! The controller never allocates: at enable time the caller hands over a
//! single `&mut [u8]` whose size it learned from a configuration query, and
//! every pool and context is carved out of it here. Carving is strictly
//! monotonic, nothing is ever returned to the arena before disable.
use core::mem::{align_of, size_of, MaybeUninit};

use crate::error::Error;

/// A caller-supplied memory region being carved into pools and contexts.
pub struct Arena<'a> {
    mem: &'a mut [u8],
    offset: usize,
}

impl<'a> Arena<'a> {
    pub fn new(mem: &'a mut [u8]) -> Self {
        Arena { mem, offset: 0 }
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn used(&self) -> usize {
        self.offset
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.mem.len() - self.offset
    }

    /// Carve `len` bytes with the given alignment.
    ///
    /// Fails with [`Error::ENOMEM`] when the region cannot fit the carve.
    /// The returned slice is zeroed.
    pub fn alloc_bytes(&mut self, len: usize, align: usize) -> Result<&'a mut [u8], Error> {
        debug_assert!(align.is_power_of_two());
        let base = self.mem.as_ptr() as usize + self.offset;
        let pad = base.wrapping_neg() & (align - 1);
        let start = self.offset.checked_add(pad).ok_or(Error::ENOMEM)?;
        let end = start.checked_add(len).ok_or(Error::ENOMEM)?;
        if end > self.mem.len() {
            return Err(Error::ENOMEM);
        }
        self.offset = end;
        let slice = &mut self.mem[start..end];
        slice.fill(0);
        // The arena holds the region for 'a and never hands the same range
        // out twice, so detaching the borrow from &mut self is sound.
        Ok(unsafe { core::slice::from_raw_parts_mut(slice.as_mut_ptr(), len) })
    }

    /// Carve storage for a `[MaybeUninit<T>; count]`.
    pub fn alloc_array<T>(&mut self, count: usize) -> Result<&'a mut [MaybeUninit<T>], Error> {
        let len = size_of::<T>().checked_mul(count).ok_or(Error::ENOMEM)?;
        let bytes = self.alloc_bytes(len, align_of::<T>())?;
        Ok(unsafe { core::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut MaybeUninit<T>, count) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carves_are_disjoint_and_aligned() {
        let mut mem = [0xAAu8; 256];
        let mut arena = Arena::new(&mut mem);
        let a = arena.alloc_bytes(10, 1).unwrap();
        let b = arena.alloc_bytes(16, 8).unwrap();
        assert_eq!(b.as_ptr() as usize % 8, 0);
        let a_end = a.as_ptr() as usize + a.len();
        assert!(b.as_ptr() as usize >= a_end);
        assert!(a.iter().all(|&x| x == 0));
        assert!(b.iter().all(|&x| x == 0));
    }

    #[test]
    fn exhaustion_reports_enomem() {
        let mut mem = [0u8; 32];
        let mut arena = Arena::new(&mut mem);
        assert!(arena.alloc_bytes(24, 1).is_ok());
        assert_eq!(arena.alloc_bytes(16, 1).unwrap_err(), Error::ENOMEM);
        // A smaller carve that still fits must succeed afterwards.
        assert!(arena.alloc_bytes(8, 1).is_ok());
        assert_eq!(arena.remaining(), 0);
    }

    #[test]
    fn typed_array_carve() {
        let mut mem = [0u8; 128];
        let mut arena = Arena::new(&mut mem);
        let xs = arena.alloc_array::<u32>(8).unwrap();
        assert_eq!(xs.len(), 8);
        assert_eq!(xs.as_ptr() as usize % core::mem::align_of::<u32>(), 0);
    }
}
