use std::mem;

use tracing::{debug, warn};

use crate::err::{Error, Result};
use crate::process::{AddressSpace, Protection};

/// Range of addresses from which a block of `size` bytes stays reachable by a
/// rel32 displacement from `init_addr`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bound {
    pub min: u64,
    pub max: u64,
}

#[cfg_attr(not(windows), allow(dead_code))]
impl Bound {
    pub fn new(init_addr: u64, size: u64) -> Self {
        Self {
            min: init_addr.saturating_sub(i32::MAX as u64),
            max: init_addr.saturating_add(i32::MAX as u64).saturating_sub(size),
        }
    }

    pub fn middle(&self) -> u64 {
        self.min / 2 + self.max / 2
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.min && addr <= self.max
    }
}

/// Memory allocated in an address space, released on drop.
pub struct RemoteAlloc<'a, S: AddressSpace + ?Sized> {
    space: &'a S,
    base: usize,
    size: usize,
}

impl<'a, S: AddressSpace + ?Sized> RemoteAlloc<'a, S> {
    /// Allocates `size` bytes with the given protection.
    pub fn new(space: &'a S, size: usize, protect: Protection) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidParameter);
        }
        let base = space.alloc(size, protect)?;
        debug!(base, size, ?protect, "allocated");
        Ok(Self { space, base, size })
    }

    /// Allocates `size` bytes within rel32 reach of `hint`, falling back to an
    /// allocation anywhere.
    pub fn near(space: &'a S, hint: usize, size: usize, protect: Protection) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidParameter);
        }
        match space.alloc_near(hint, size, protect) {
            Ok(base) => {
                debug!(hint, base, size, ?protect, "allocated near");
                Ok(Self { space, base, size })
            }
            Err(e) => {
                debug!(hint, error = %e, "no memory near hint");
                Self::new(space, size, protect)
            }
        }
    }

    /// Start address.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The owning address space.
    pub fn space(&self) -> &'a S {
        self.space
    }

    /// Gives up ownership without freeing, returning the base address.
    pub fn leak(self) -> usize {
        let base = self.base;
        mem::forget(self);
        base
    }
}

impl<S: AddressSpace + ?Sized> Drop for RemoteAlloc<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.space.free(self.base, self.size) {
            warn!(base = self.base, error = %e, "free failed");
        }
    }
}

impl<S: AddressSpace + ?Sized> std::fmt::Debug for RemoteAlloc<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAlloc")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .finish()
    }
}
