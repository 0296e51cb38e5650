//! A before/after file pair that can be applied and reverted against
//! a container filesystem, and a per-container registry of such
//! patch lists guarded by a mutex each.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use trustproxy_fs::{ContainerFs, File, OpenOutcome, WriteOutcome};

/// A single before/after file pair. Additions and deletions are
/// unsupported: both sides must exist, at the same absolute path, and
/// agree on whether they're a symlink.
#[derive(Debug, Clone)]
pub struct Patch {
    before: File,
    after: File,
}

impl Patch {
    pub fn new(before: Option<File>, after: Option<File>) -> Result<Self> {
        let before = before.context("patch: before side is missing (additions are unsupported)")?;
        let after = after.context("patch: after side is missing (deletions are unsupported)")?;

        if !before.path.starts_with('/') || !after.path.starts_with('/') {
            bail!("patch: paths must be absolute: {} / {}", before.path, after.path);
        }
        if before.path != after.path {
            bail!(
                "patch: before/after path mismatch: {} vs {}",
                before.path,
                after.path
            );
        }
        if before.info.is_symlink() != after.info.is_symlink() {
            bail!("patch: before/after file types differ at {}", before.path);
        }

        Ok(Self { before, after })
    }

    pub fn path(&self) -> &str {
        &self.before.path
    }

    pub fn before(&self) -> &File {
        &self.before
    }

    pub fn after(&self) -> &File {
        &self.after
    }

    /// `apply` is just `fs.writeFile(after)`.
    pub fn apply(&self, fs: &ContainerFs) -> Result<()> {
        match fs.write_file(&self.after)? {
            WriteOutcome::Ok => Ok(()),
            WriteOutcome::NotExist => {
                bail!("patch: apply failed, container path vanished: {}", self.path())
            }
        }
    }

    /// Refuses to revert if the on-disk contents no longer match what
    /// this patch last wrote — an out-of-band change is treated as
    /// more dangerous than leaving the patch applied.
    pub fn revert(&self, fs: &ContainerFs) -> Result<()> {
        let current = match fs.open(self.path())? {
            OpenOutcome::File(f) => f,
            OpenOutcome::NotExist => bail!("patch: revert failed, file missing: {}", self.path()),
            OpenOutcome::Invalid => bail!("patch: revert failed, path invalid: {}", self.path()),
        };
        if current.contents != self.after.contents {
            bail!(
                "patch: out of band change detected at {}, refusing to revert",
                self.path()
            );
        }
        match fs.write_file(&self.before)? {
            WriteOutcome::Ok => Ok(()),
            WriteOutcome::NotExist => {
                bail!("patch: revert failed, container path vanished: {}", self.path())
            }
        }
    }
}

/// An ordered list of patches currently (or formerly) applied to one
/// container. Mutations only happen while the owning mutex (held by
/// the registry) is locked.
#[derive(Debug, Default)]
pub struct PatchSet {
    patches: Vec<Patch>,
}

impl PatchSet {
    fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn push(&mut self, patch: Patch) {
        self.patches.push(patch);
    }

    /// Revert every patch, in insertion order. Any failure here is
    /// fatal to the caller: silent drift between what's on disk and
    /// what the registry believes is worse than crashing.
    pub fn revert_all(&self, fs: &ContainerFs) -> Result<()> {
        for patch in &self.patches {
            patch
                .revert(fs)
                .context("patch: revert failed during transient unpatch (fatal)")?;
        }
        Ok(())
    }

    /// Re-apply every patch. If one fails partway through, roll back
    /// the ones that had already been re-applied (reverting them) so
    /// the set ends up empty rather than half-patched. If even that
    /// rollback fails, the condition is fatal.
    pub fn reapply_all(&mut self, fs: &ContainerFs) -> Result<()> {
        let pending = std::mem::take(&mut self.patches);
        let mut applied = Vec::with_capacity(pending.len());

        for patch in pending {
            match patch.apply(fs) {
                Ok(()) => applied.push(patch),
                Err(apply_err) => {
                    for already in applied.iter().rev() {
                        if let Err(rollback_err) = already.revert(fs) {
                            bail!(
                                "patch: re-apply failed ({apply_err}) and rollback also failed (fatal): {rollback_err}"
                            );
                        }
                    }
                    return Err(apply_err).context("patch: re-apply failed, rolled back to empty");
                }
            }
        }

        self.patches = applied;
        Ok(())
    }
}

/// Maps container id to its lazily-created, lock-guarded `PatchSet`.
/// Never garbage-collected within a proxy's lifetime.
#[derive(Default)]
pub struct PatchSetRegistry {
    sets: Mutex<HashMap<String, Arc<Mutex<PatchSet>>>>,
}

impl PatchSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease the `PatchSet` for `container_id`, creating an empty one
    /// on first use. The caller owns the returned lock and is
    /// responsible for dropping the guard.
    pub fn lease(&self, container_id: &str) -> Arc<Mutex<PatchSet>> {
        let mut sets = self.sets.lock().expect("patch set registry mutex poisoned");
        sets.entry(container_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PatchSet::new())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustproxy_fs::FileInfo;
    use chrono::Utc;

    fn file(path: &str, contents: &[u8], symlink: bool) -> File {
        File {
            path: path.to_string(),
            info: FileInfo {
                name: path.rsplit('/').next().unwrap().to_string(),
                size: contents.len() as u64,
                mode: if symlink { trustproxy_fs::MODE_SYMLINK } else { 0o644 },
                mtime: Utc::now(),
                link_target: None,
            },
            contents: contents.to_vec(),
        }
    }

    #[test]
    fn rejects_missing_sides() {
        let after = file("/etc/ssl/certs/ca-certificates.crt", b"after", false);
        assert!(Patch::new(None, Some(after)).is_err());
    }

    #[test]
    fn rejects_path_mismatch() {
        let before = file("/etc/ssl/certs/a.crt", b"a", false);
        let after = file("/etc/ssl/certs/b.crt", b"b", false);
        assert!(Patch::new(Some(before), Some(after)).is_err());
    }

    #[test]
    fn rejects_relative_path() {
        let before = file("etc/ssl/certs/a.crt", b"a", false);
        let after = file("etc/ssl/certs/a.crt", b"ab", false);
        assert!(Patch::new(Some(before), Some(after)).is_err());
    }

    #[test]
    fn rejects_type_mismatch() {
        let before = file("/etc/ssl/cert.pem", b"a", false);
        let after = file("/etc/ssl/cert.pem", b"a", true);
        assert!(Patch::new(Some(before), Some(after)).is_err());
    }

    #[test]
    fn accepts_matching_sides() {
        let before = file("/etc/ssl/cert.pem", b"a", false);
        let after = file("/etc/ssl/cert.pem", b"ab", false);
        let patch = Patch::new(Some(before), Some(after)).expect("valid patch");
        assert_eq!(patch.path(), "/etc/ssl/cert.pem");
    }

    #[test]
    fn registry_leases_are_stable_per_container() {
        let registry = PatchSetRegistry::new();
        let a = registry.lease("abc123");
        let b = registry.lease("abc123");
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.lease("other");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn patch_set_tracks_insertion_order() {
        let mut set = PatchSet::new();
        assert!(set.is_empty());
        let before = file("/etc/ssl/cert.pem", b"a", false);
        let after = file("/etc/ssl/cert.pem", b"ab", false);
        set.push(Patch::new(Some(before), Some(after)).unwrap());
        assert_eq!(set.patches().len(), 1);
    }
}
