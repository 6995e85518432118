//! Protection-aware reads and writes.
//!
//! Pages that don't allow the access are switched to execute-read-write for
//! the duration of the operation, then switched back. Guard pages are refused.

use std::mem::{MaybeUninit, size_of};

use tracing::{trace, warn};

use crate::err::{Error, Result};
use crate::process::{AddressSpace, Protection, RegionInfo, RegionState};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Access {
    Read,
    Write,
}

/// Decides whether an access needs the protection to be changed first.
pub(crate) fn needs_unprotect(region: &RegionInfo, addr: usize, access: Access) -> Result<bool> {
    if region.protect.is_guard() {
        return Err(Error::GuardPage { addr });
    }
    if region.state != RegionState::Commit {
        return Err(Error::Unmapped { addr });
    }
    Ok(match access {
        Access::Read => !region.protect.is_readable(),
        Access::Write => !region.protect.is_writable(),
    })
}

/// Makes `addr..addr + len` accessible for the lifetime of the guard.
///
/// Every region the range touches is checked before anything is changed;
/// only the parts of regions lacking the access are flipped, and each one is
/// restored to its own protection.
pub(crate) struct ProtectGuard<'a, S: AddressSpace + ?Sized> {
    space: &'a S,
    flipped: Vec<(usize, usize, Protection)>,
}

impl<'a, S: AddressSpace + ?Sized> ProtectGuard<'a, S> {
    pub fn new(space: &'a S, addr: usize, len: usize, access: Access) -> Result<Self> {
        let end = addr.checked_add(len).ok_or(Error::InvalidParameter)?;
        let mut spans = vec![];
        let mut cur = addr;
        while cur < end {
            let region = space.query(cur)?;
            let unprotect = needs_unprotect(&region, cur, access)?;
            let stop = region.end().min(end);
            if stop <= cur {
                return Err(Error::Unmapped { addr: cur });
            }
            if unprotect {
                spans.push((cur, stop - cur));
            }
            cur = stop;
        }

        let mut guard = Self {
            space,
            flipped: Vec::with_capacity(spans.len()),
        };
        for (start, span) in spans {
            // earlier spans are restored by the guard's drop on failure
            let old = space.protect(start, span, Protection::EXECUTE_READWRITE)?;
            trace!(addr = start, len = span, ?old, ?access, "unprotected");
            guard.flipped.push((start, span, old));
        }
        Ok(guard)
    }
}

impl<S: AddressSpace + ?Sized> Drop for ProtectGuard<'_, S> {
    fn drop(&mut self) {
        for &(addr, len, old) in self.flipped.iter().rev() {
            if let Err(e) = self.space.protect(addr, len, old) {
                warn!(addr, error = %e, "restoring protection failed");
            }
        }
    }
}

/// Reads `buf.len()` bytes from `addr`.
pub fn read<S: AddressSpace + ?Sized>(space: &S, addr: usize, buf: &mut [u8]) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let _guard = ProtectGuard::new(space, addr, buf.len(), Access::Read)?;
    space.read_raw(addr, buf)
}

/// Reads `len` bytes from `addr` into a new vector.
pub fn read_vec<S: AddressSpace + ?Sized>(space: &S, addr: usize, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read(space, addr, &mut buf)?;
    Ok(buf)
}

/// Writes `data` to `addr`.
pub fn write<S: AddressSpace + ?Sized>(space: &S, addr: usize, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let _guard = ProtectGuard::new(space, addr, data.len(), Access::Write)?;
    space.write_raw(addr, data)
}

/// Plain-data types that can be copied to and from another address space.
///
/// # Safety
///
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid value and the
/// type must have no padding.
pub unsafe trait Pod: Copy + 'static {}

macro_rules! impl_pod {
    ($($t:ty),*) => {$(unsafe impl Pod for $t {})*};
}
impl_pod!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);
unsafe impl<T: Pod, const N: usize> Pod for [T; N] {}

/// Reads a value of type `T` from `addr`.
pub fn read_pod<T: Pod, S: AddressSpace + ?Sized>(space: &S, addr: usize) -> Result<T> {
    let mut value = MaybeUninit::<T>::zeroed();
    let buf =
        unsafe { std::slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), size_of::<T>()) };
    read(space, addr, buf)?;
    Ok(unsafe { value.assume_init() })
}

/// Writes `value` to `addr`.
pub fn write_pod<T: Pod, S: AddressSpace + ?Sized>(space: &S, addr: usize, value: &T) -> Result<()> {
    let bytes =
        unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), size_of::<T>()) };
    write(space, addr, bytes)
}
