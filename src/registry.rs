use std::fmt;

use tracing::warn;

use crate::err::{Error, Result};
use crate::patch::Patch;

/// Named patches applied and removed together.
///
/// Patches are applied in insertion order and removed in reverse order, so
/// patches stacked on the same code unwind correctly. Dropping the registry
/// removes every patch.
#[derive(Default)]
pub struct PatchRegistry<'a> {
    patches: Vec<(String, Box<dyn Patch + 'a>)>,
}

impl<'a> PatchRegistry<'a> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { patches: vec![] }
    }

    /// Adds a patch under `name`. Names must be unique.
    pub fn insert(&mut self, name: impl Into<String>, patch: impl Patch + 'a) -> Result<()> {
        let name = name.into();
        if self.position(&name).is_some() {
            return Err(Error::DuplicatePatch(name));
        }
        self.patches.push((name, Box::new(patch)));
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.patches.iter().position(|(n, _)| n == name)
    }

    /// The patch registered as `name`.
    pub fn get(&self, name: &str) -> Option<&(dyn Patch + 'a)> {
        self.patches
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.as_ref())
    }

    /// The patch registered as `name`, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Patch + 'a)> {
        self.patches
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.as_mut())
    }

    /// Unregisters a patch and hands it back, in whatever state it is.
    pub fn take(&mut self, name: &str) -> Option<Box<dyn Patch + 'a>> {
        let idx = self.position(name)?;
        Some(self.patches.remove(idx).1)
    }

    /// Names of the registered patches, in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.patches.iter().map(|(n, _)| n.as_str())
    }

    /// Number of registered patches.
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Whether no patch is registered.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Applies every patch in insertion order, stopping at the first failure.
    pub fn apply_all(&mut self) -> Result<()> {
        for (_, patch) in &mut self.patches {
            patch.apply()?;
        }
        Ok(())
    }

    /// Removes every patch in reverse order. All patches are attempted; the
    /// first error is returned.
    pub fn remove_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for (name, patch) in self.patches.iter_mut().rev() {
            if let Err(e) = patch.remove() {
                warn!(patch = %name, error = %e, "removing patch failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for PatchRegistry<'_> {
    fn drop(&mut self) {
        // failures are already logged per patch
        let _ = self.remove_all();
    }
}

impl fmt::Debug for PatchRegistry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.patches
                    .iter()
                    .map(|(n, p)| (n, format!("{:#x} applied:{}", p.target(), p.is_applied()))),
            )
            .finish()
    }
}
