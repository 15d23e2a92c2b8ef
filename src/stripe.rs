//! Fixed array of independently lockable shards.
//!
//! A hash is routed to shard `hash & (N - 1)`, so `N` must be a power of two. Contention on
//! any one lock is bounded to roughly `1/N` of all traffic regardless of how many series
//! the head holds.

use crate::error::HeadError;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default number of stripes.
pub const DEFAULT_STRIPE_SIZE: usize = 1 << 14;

#[derive(Debug)]
pub struct StripeSet<T> {
    stripes: Box<[RwLock<T>]>,
    mask: u64,
    bits: u32,
}

impl<T> StripeSet<T> {
    /// Creates `size` stripes, each initialised by `init(index)`.
    pub fn new(size: usize, mut init: impl FnMut(usize) -> T) -> Result<Self, HeadError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(HeadError::Config(format!(
                "stripe size must be a non-zero power of two, got {}",
                size
            )));
        }
        let stripes = (0..size).map(|i| RwLock::new(init(i))).collect();
        Ok(Self {
            stripes,
            mask: size as u64 - 1,
            bits: size.trailing_zeros(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }

    /// Number of low bits consumed by the stripe index.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    #[inline]
    pub fn index_for(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    pub fn read(&self, idx: usize) -> Result<RwLockReadGuard<'_, T>, HeadError> {
        Ok(self.stripes[idx].read()?)
    }

    pub fn write(&self, idx: usize) -> Result<RwLockWriteGuard<'_, T>, HeadError> {
        Ok(self.stripes[idx].write()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(matches!(StripeSet::new(0, |_| ()), Err(HeadError::Config(_))));
        assert!(matches!(StripeSet::new(12, |_| ()), Err(HeadError::Config(_))));
        assert!(StripeSet::new(1, |_| ()).is_ok());
    }

    #[test]
    fn routes_by_mask() {
        let s = StripeSet::new(8, |i| i).unwrap();
        assert_eq!(s.bits(), 3);
        assert_eq!(s.index_for(0), 0);
        assert_eq!(s.index_for(9), 1);
        assert_eq!(s.index_for(u64::MAX), 7);
        assert_eq!(*s.read(5).unwrap(), 5);
        *s.write(5).unwrap() = 50;
        assert_eq!(*s.read(5).unwrap(), 50);
    }
}
