//! Reversible code patches.
//!
//! A patch is created unapplied. [`Patch::apply`] and [`Patch::remove`] are
//! idempotent, and an applied patch removes itself when dropped.

use std::fmt;
use std::marker::PhantomData;

use tracing::{debug, warn};

use crate::arch::{Arch, Native};
use crate::err::{Error, Result};
use crate::memory;
use crate::process::AddressSpace;
use crate::trampoline::{Trampoline, disassemble};

/// Common interface of [`PatchRaw`] and [`PatchDetour`].
pub trait Patch {
    /// Writes the patch. Does nothing if it is already applied.
    fn apply(&mut self) -> Result<()>;

    /// Restores the original bytes. Does nothing if the patch isn't applied.
    fn remove(&mut self) -> Result<()>;

    /// Whether the patch is currently written.
    fn is_applied(&self) -> bool;

    /// The patched address.
    fn target(&self) -> usize;
}

fn restore<S: AddressSpace + ?Sized>(space: &S, target: usize, original: &[u8]) -> Result<()> {
    memory::write(space, target, original)?;
    space.flush_instruction_cache(target, original.len())
}

/// Replaces bytes at an address.
pub struct PatchRaw<'a, S: AddressSpace + ?Sized> {
    space: &'a S,
    target: usize,
    bytes: Vec<u8>,
    original: Option<Vec<u8>>,
}

impl<'a, S: AddressSpace + ?Sized> PatchRaw<'a, S> {
    /// Prepares writing `bytes` at `target`. Empty patches are rejected.
    pub fn new(space: &'a S, target: usize, bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::InvalidParameter);
        }
        Ok(Self {
            space,
            target,
            bytes,
            original: None,
        })
    }

    /// The replacement bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes saved when the patch was applied.
    pub fn original(&self) -> Option<&[u8]> {
        self.original.as_deref()
    }
}

impl<S: AddressSpace + ?Sized> Patch for PatchRaw<'_, S> {
    fn apply(&mut self) -> Result<()> {
        if self.original.is_some() {
            return Ok(());
        }
        let original = memory::read_vec(self.space, self.target, self.bytes.len())?;
        memory::write(self.space, self.target, &self.bytes)?;
        self.space
            .flush_instruction_cache(self.target, self.bytes.len())?;
        debug!(target = self.target, len = self.bytes.len(), "raw patch applied");
        self.original = Some(original);
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        let Some(original) = &self.original else {
            return Ok(());
        };
        restore(self.space, self.target, original)?;
        debug!(target = self.target, "raw patch removed");
        self.original = None;
        Ok(())
    }

    fn is_applied(&self) -> bool {
        self.original.is_some()
    }

    fn target(&self) -> usize {
        self.target
    }
}

impl<S: AddressSpace + ?Sized> Drop for PatchRaw<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(target = self.target, error = %e, "removing raw patch failed");
        }
    }
}

impl<S: AddressSpace + ?Sized> fmt::Debug for PatchRaw<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchRaw")
            .field("target", &format_args!("{:#x}", self.target))
            .field("len", &self.bytes.len())
            .field("applied", &self.is_applied())
            .finish()
    }
}

struct Applied<'a, S: AddressSpace + ?Sized> {
    trampoline: Trampoline<'a, S>,
    original: Vec<u8>,
}

/// Redirects a function to a replacement, keeping a trampoline that still
/// runs the original.
///
/// ```no_run
/// # #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
/// # fn demo() -> remotehook::Result<()> {
/// use remotehook::process::LocalProcess;
/// use remotehook::{Patch, PatchDetour};
///
/// extern "win64" fn answer() -> u32 { 1 }
/// extern "win64" fn better_answer() -> u32 { 2 }
///
/// let process = LocalProcess::new();
/// let mut detour = PatchDetour::new(&process, answer as *const () as usize, better_answer as *const () as usize);
/// detour.apply()?;
/// let original: extern "win64" fn() -> u32 =
///     unsafe { std::mem::transmute(detour.trampoline().unwrap()) };
/// assert_eq!(original(), 1);
/// # Ok(())
/// # }
/// ```
pub struct PatchDetour<'a, S: AddressSpace + ?Sized, A: Arch = Native> {
    space: &'a S,
    target: usize,
    replacement: usize,
    applied: Option<Applied<'a, S>>,
    _arch: PhantomData<A>,
}

impl<'a, S: AddressSpace + ?Sized> PatchDetour<'a, S> {
    /// Prepares redirecting `target` to `replacement`, with code generated for
    /// the build target.
    pub fn new(space: &'a S, target: usize, replacement: usize) -> Self {
        Self::with_arch(space, target, replacement)
    }
}

impl<'a, S: AddressSpace + ?Sized, A: Arch> PatchDetour<'a, S, A> {
    /// Prepares redirecting `target` to `replacement` with the code generator `A`.
    pub fn with_arch(space: &'a S, target: usize, replacement: usize) -> Self {
        Self {
            space,
            target,
            replacement,
            applied: None,
            _arch: PhantomData,
        }
    }

    /// Address of the replacement function.
    pub fn replacement(&self) -> usize {
        self.replacement
    }

    /// Entry of the trampoline calling the original function, while applied.
    pub fn trampoline(&self) -> Option<usize> {
        self.applied.as_ref().map(|a| a.trampoline.base())
    }
}

impl<S: AddressSpace + ?Sized, A: Arch> Patch for PatchDetour<'_, S, A> {
    fn apply(&mut self) -> Result<()> {
        if self.applied.is_some() {
            return Ok(());
        }
        let jump_size = A::jump_size(self.target as u64, self.replacement as u64);
        let insts = disassemble::<A, S>(self.space, self.target, jump_size)?;
        let trampoline = Trampoline::build::<A>(self.space, &insts)?;

        let original = memory::read_vec(self.space, self.target, jump_size)?;
        let jump = A::encode_jump(self.target as u64, self.replacement as u64);
        memory::write(self.space, self.target, &jump)?;
        self.space.flush_instruction_cache(self.target, jump.len())?;
        debug!(
            target = self.target,
            replacement = self.replacement,
            trampoline = trampoline.base(),
            resume = trampoline.resume(),
            jump_size,
            "detour applied"
        );
        self.applied = Some(Applied {
            trampoline,
            original,
        });
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        let Some(applied) = &self.applied else {
            return Ok(());
        };
        restore(self.space, self.target, &applied.original)?;
        debug!(target = self.target, "detour removed");
        // frees the trampoline
        self.applied = None;
        Ok(())
    }

    fn is_applied(&self) -> bool {
        self.applied.is_some()
    }

    fn target(&self) -> usize {
        self.target
    }
}

impl<S: AddressSpace + ?Sized, A: Arch> Drop for PatchDetour<'_, S, A> {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(target = self.target, error = %e, "removing detour failed");
        }
    }
}

impl<S: AddressSpace + ?Sized, A: Arch> fmt::Debug for PatchDetour<'_, S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchDetour")
            .field("target", &format_args!("{:#x}", self.target))
            .field("replacement", &format_args!("{:#x}", self.replacement))
            .field("trampoline", &self.trampoline())
            .finish()
    }
}
