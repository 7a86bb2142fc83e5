//! Strict-provenance helpers for stable toolchains.
//!
//! Older stable compilers lack the strict-provenance methods on `NonNull`;
//! this extension trait supplies the two this crate needs, built on the
//! raw-pointer methods from [`sptr`].

use core::{num::NonZeroUsize, ptr::NonNull};

pub use sptr::Strict;

pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: a `NonNull` never holds address zero.
        unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
    }

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized,
    {
        // SAFETY: `addr` is non-zero, so the rebuilt pointer is too.
        unsafe { NonNull::new_unchecked(self.as_ptr().with_addr(addr.get()) as *mut _) }
    }
}
