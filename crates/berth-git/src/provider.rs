use std::path::{Path, PathBuf};

use berth_core::{Error, Result, SessionId, SourceType, WorkspaceId};
use tracing::{debug, warn};

use crate::cmd::{git, git_with_stdin};
use crate::repository::GitRepository;

/// Result of [`GitProvider::ensure_workspace`].
#[derive(Debug, Clone)]
pub struct WorkspaceCheckout {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branches: Vec<String>,
}

/// One `git status --porcelain` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Two-character XY state, e.g. `" M"`, `"??"`.
    pub state: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub sha: String,
    pub author_name: String,
    pub author_email: String,
    pub timestamp: i64,
    pub subject: String,
}

// Committer identity for commits the service itself creates (patch
// application, workspace commits). Authors come from the patches or the
// caller; the committer must not depend on ambient git config.
const COMMITTER_NAME: &str = "berth";
const COMMITTER_EMAIL: &str = "berth@localhost";

/// Filesystem layout and git operations for all workspaces under one root.
///
/// Shared clone: `<root>/<workspace>/repo`. Session worktrees:
/// `<root>/<workspace>/sessions/<session>`. The shared clone is the only
/// place patches are applied; sessions work through their own trees.
#[derive(Clone)]
pub struct GitProvider {
    root: PathBuf,
    sources: Option<std::sync::Arc<dyn crate::WorkspaceSource>>,
}

impl GitProvider {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            sources: None,
        }
    }

    /// Attach a source resolver so callers can ensure a workspace by id
    /// alone.
    pub fn with_sources(mut self, sources: std::sync::Arc<dyn crate::WorkspaceSource>) -> Self {
        self.sources = Some(sources);
        self
    }

    /// [`ensure_workspace`](Self::ensure_workspace) with the source looked
    /// up through the attached [`crate::WorkspaceSource`].
    pub async fn ensure_workspace_by_id(
        &self,
        workspace_id: WorkspaceId,
        commit: Option<&str>,
    ) -> Result<WorkspaceCheckout> {
        let sources = self
            .sources
            .as_ref()
            .ok_or_else(|| Error::Internal("no workspace source resolver attached".into()))?;
        let (source_type, source) = sources.resolve(workspace_id).await?;
        self.ensure_workspace(workspace_id, source_type, &source, commit)
            .await
    }

    pub fn workspace_dir(&self, workspace_id: WorkspaceId) -> PathBuf {
        self.root.join(workspace_id.to_string())
    }

    pub fn repo_dir(&self, workspace_id: WorkspaceId) -> PathBuf {
        self.workspace_dir(workspace_id).join("repo")
    }

    pub fn session_dir(&self, workspace_id: WorkspaceId, session_id: SessionId) -> PathBuf {
        self.workspace_dir(workspace_id)
            .join("sessions")
            .join(session_id.to_string())
    }

    /// Ensure the shared clone exists, is fetched, and is checked out at
    /// `commit` (or the source's HEAD when `None`).
    pub async fn ensure_workspace(
        &self,
        workspace_id: WorkspaceId,
        source_type: SourceType,
        source: &str,
        commit: Option<&str>,
    ) -> Result<WorkspaceCheckout> {
        let repo = self.repo_dir(workspace_id);

        if source_type == SourceType::Local && !Path::new(source).exists() {
            return Err(Error::NotFound(format!("local source {source}")));
        }

        if !repo.join(".git").exists() {
            tokio::fs::create_dir_all(&repo).await?;
            debug!(workspace = %workspace_id, %source, "cloning workspace");
            // git clone handles both URLs and host paths, which covers
            // `Git` and `Local` sources alike.
            let parent = repo
                .parent()
                .ok_or_else(|| Error::Git("workspace dir has no parent".into()))?;
            git(parent, &["clone", source, "repo"]).await?;
        } else {
            if let Err(e) = git(&repo, &["fetch", "--all", "--prune"]).await {
                // A fetch failure on an existing clone is worth retrying the
                // job for, unless we're pinned to a commit we already have.
                if commit.is_none() {
                    return Err(e);
                }
                warn!(workspace = %workspace_id, error = %e, "fetch failed, using cached clone");
            }
        }

        match commit {
            Some(sha) if !sha.is_empty() => {
                git(&repo, &["checkout", sha]).await?;
            }
            _ => {
                // Track the source's tip when no commit is pinned. A clone
                // sitting on a detached HEAD (from an earlier pinned
                // checkout) can't fast-forward; leave it where it is.
                if let Err(e) = git(&repo, &["pull", "--ff-only"]).await {
                    debug!(workspace = %workspace_id, error = %e, "pull skipped");
                }
            }
        }

        let head = GitRepository::open(&repo)?.head_hash()?;
        let branches = self.branches_in(&repo).await?;

        Ok(WorkspaceCheckout {
            path: repo,
            head,
            branches,
        })
    }

    /// HEAD of the shared clone.
    pub async fn head(&self, workspace_id: WorkspaceId) -> Result<Option<String>> {
        let repo = self.repo_dir(workspace_id);
        if !repo.exists() {
            return Err(Error::NotFound(format!("workspace clone {workspace_id}")));
        }
        GitRepository::open(&repo)?.head_hash()
    }

    pub async fn branches(&self, workspace_id: WorkspaceId) -> Result<Vec<String>> {
        self.branches_in(&self.repo_dir(workspace_id)).await
    }

    async fn branches_in(&self, repo: &Path) -> Result<Vec<String>> {
        let out = git(repo, &["branch", "--format=%(refname:short)"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    pub async fn status(&self, workspace_id: WorkspaceId) -> Result<Vec<StatusEntry>> {
        let out = git(&self.repo_dir(workspace_id), &["status", "--porcelain"]).await?;
        Ok(out
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| StatusEntry {
                state: l[..2].to_string(),
                path: l[3..].to_string(),
            })
            .collect())
    }

    pub async fn diff(&self, workspace_id: WorkspaceId, path: Option<&str>) -> Result<String> {
        let repo = self.repo_dir(workspace_id);
        match path {
            Some(p) => git(&repo, &["diff", "--", p]).await,
            None => git(&repo, &["diff"]).await,
        }
    }

    pub async fn read_file(&self, workspace_id: WorkspaceId, rel_path: &str) -> Result<Vec<u8>> {
        let path = self.repo_dir(workspace_id).join(rel_path);
        Ok(tokio::fs::read(path).await?)
    }

    pub async fn write_file(
        &self,
        workspace_id: WorkspaceId,
        rel_path: &str,
        content: &[u8],
    ) -> Result<()> {
        let path = self.repo_dir(workspace_id).join(rel_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(path, content).await?)
    }

    /// Stage the given paths, or everything when empty.
    pub async fn stage(&self, workspace_id: WorkspaceId, paths: &[&str]) -> Result<()> {
        let repo = self.repo_dir(workspace_id);
        if paths.is_empty() {
            git(&repo, &["add", "-A"]).await?;
        } else {
            let mut args = vec!["add", "--"];
            args.extend_from_slice(paths);
            git(&repo, &args).await?;
        }
        Ok(())
    }

    /// Commit staged changes. Returns the current HEAD when there was
    /// nothing to commit.
    pub async fn commit(
        &self,
        workspace_id: WorkspaceId,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<String> {
        let repo = self.repo_dir(workspace_id);
        let author = format!("{author_name} <{author_email}>");
        let name_cfg = format!("user.name={COMMITTER_NAME}");
        let email_cfg = format!("user.email={COMMITTER_EMAIL}");
        let result = git(
            &repo,
            &[
                "-c", &name_cfg, "-c", &email_cfg, "commit", "-m", message, "--author", &author,
            ],
        )
        .await;

        match result {
            Ok(_) => {}
            Err(Error::Git(msg)) if msg.contains("nothing to commit") => {}
            Err(e) => return Err(e),
        }

        GitRepository::open(&repo)?
            .head_hash()?
            .ok_or_else(|| Error::Git("no HEAD after commit".into()))
    }

    pub async fn log(&self, workspace_id: WorkspaceId, limit: usize) -> Result<Vec<CommitInfo>> {
        let repo = self.repo_dir(workspace_id);
        let count = limit.to_string();
        let out = git(
            &repo,
            &[
                "log",
                "--format=%H%x1f%an%x1f%ae%x1f%at%x1f%s",
                "-n",
                &count,
            ],
        )
        .await?;

        out.lines()
            .filter(|l| !l.is_empty())
            .map(|line| {
                let mut fields = line.split('\u{1f}');
                let sha = fields.next().unwrap_or_default().to_string();
                let author_name = fields.next().unwrap_or_default().to_string();
                let author_email = fields.next().unwrap_or_default().to_string();
                let timestamp: i64 = fields
                    .next()
                    .unwrap_or("0")
                    .parse()
                    .map_err(|e| Error::Git(format!("bad log timestamp: {e}")))?;
                let subject = fields.next().unwrap_or_default().to_string();
                Ok(CommitInfo {
                    sha,
                    author_name,
                    author_email,
                    timestamp,
                    subject,
                })
            })
            .collect()
    }

    pub async fn checkout(&self, workspace_id: WorkspaceId, reference: &str) -> Result<()> {
        git(&self.repo_dir(workspace_id), &["checkout", reference]).await?;
        Ok(())
    }

    // ── Session working directories ──

    /// Create (or reuse) the session's private worktree, detached at the
    /// shared clone's current HEAD.
    pub async fn acquire_session_dir(
        &self,
        workspace_id: WorkspaceId,
        session_id: SessionId,
    ) -> Result<PathBuf> {
        let dir = self.session_dir(workspace_id, session_id);
        if dir.exists() {
            return Ok(dir);
        }

        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let repo = self.repo_dir(workspace_id);
        let dir_str = dir.to_string_lossy().to_string();
        git(&repo, &["worktree", "add", "--detach", &dir_str]).await?;
        Ok(dir)
    }

    /// Remove the session worktree. Idempotent: a missing worktree is fine.
    pub async fn release_session_dir(
        &self,
        workspace_id: WorkspaceId,
        session_id: SessionId,
    ) -> Result<()> {
        let dir = self.session_dir(workspace_id, session_id);
        if !dir.exists() {
            return Ok(());
        }

        let repo = self.repo_dir(workspace_id);
        let dir_str = dir.to_string_lossy().to_string();
        if let Err(e) = git(&repo, &["worktree", "remove", "--force", &dir_str]).await {
            warn!(session = %session_id, error = %e, "worktree remove failed, pruning");
            let _ = tokio::fs::remove_dir_all(&dir).await;
            let _ = git(&repo, &["worktree", "prune"]).await;
        }
        Ok(())
    }

    // ── Patch application ──

    /// Apply an mbox of patches on a session branch rooted at `base_commit`
    /// in the shared clone. Returns the new branch HEAD.
    ///
    /// The branch (`session/<id>`) is created or reset first, so re-running
    /// after a partial failure starts clean. A conflict aborts the `am` and
    /// surfaces as [`Error::PatchConflict`].
    pub async fn apply_mbox(
        &self,
        workspace_id: WorkspaceId,
        session_id: SessionId,
        base_commit: &str,
        mbox: &[u8],
    ) -> Result<String> {
        let repo = self.repo_dir(workspace_id);
        let branch = format!("session/{session_id}");

        git(&repo, &["checkout", "-B", &branch, base_commit]).await?;

        let name_cfg = format!("user.name={COMMITTER_NAME}");
        let email_cfg = format!("user.email={COMMITTER_EMAIL}");
        if let Err(e) =
            git_with_stdin(&repo, &["-c", &name_cfg, "-c", &email_cfg, "am", "--3way"], mbox)
                .await
        {
            let _ = git(&repo, &["am", "--abort"]).await;
            return Err(Error::PatchConflict(format!(
                "git am failed on branch {branch}: {e}"
            )));
        }

        git(&repo, &["rev-parse", "HEAD"]).await
    }
}
