use std::path::Path;

use berth_core::{Error, Result};

/// A thin wrapper around `gix::Repository` for the read operations the
/// provider performs constantly (open checks, HEAD resolution).
pub struct GitRepository {
    inner: gix::Repository,
}

impl GitRepository {
    /// Open an existing repository at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = gix::open(path).map_err(|e| {
            Error::Git(format!("failed to open repository at {}: {e}", path.display()))
        })?;
        Ok(Self { inner: repo })
    }

    /// Working-tree directory, falling back to the `.git` directory for
    /// bare repositories.
    pub fn path(&self) -> &Path {
        self.inner.workdir().unwrap_or_else(|| self.inner.git_dir())
    }

    /// HEAD commit as a hex SHA, or `None` for an unborn branch.
    pub fn head_hash(&self) -> Result<Option<String>> {
        let head = self
            .inner
            .head()
            .map_err(|e| Error::Git(format!("failed to get HEAD: {e}")))?;

        if head.is_unborn() {
            return Ok(None);
        }

        match head.into_peeled_id() {
            Ok(id) => Ok(Some(id.to_hex().to_string())),
            Err(e) => Err(Error::Git(format!("failed to peel HEAD: {e}"))),
        }
    }

    /// Whether `commit_hex` names a commit known to this repository.
    pub fn has_commit(&self, commit_hex: &str) -> bool {
        gix::ObjectId::from_hex(commit_hex.as_bytes())
            .ok()
            .and_then(|oid| self.inner.find_commit(oid).ok())
            .is_some()
    }
}
