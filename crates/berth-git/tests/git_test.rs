use std::path::Path;
use std::process::Command;

use berth_core::{Error, SourceType};
use berth_git::GitProvider;
use uuid::Uuid;

fn sh(dir: &Path, args: &[&str]) -> String {
    let output = Command::new(args[0])
        .args(&args[1..])
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("spawn {args:?}: {e}"));
    assert!(
        output.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Create an origin repository with one commit and return its HEAD.
fn init_origin(dir: &Path) -> String {
    sh(dir, &["git", "init", "-b", "main"]);
    sh(dir, &["git", "config", "user.email", "dev@example.com"]);
    sh(dir, &["git", "config", "user.name", "Dev"]);
    std::fs::write(dir.join("README.md"), "# origin\n").unwrap();
    sh(dir, &["git", "add", "-A"]);
    sh(dir, &["git", "commit", "-m", "initial"]);
    sh(dir, &["git", "rev-parse", "HEAD"])
}

#[tokio::test]
async fn ensure_workspace_clones_and_reports_head() {
    let origin = tempfile::tempdir().unwrap();
    let head = init_origin(origin.path());

    let root = tempfile::tempdir().unwrap();
    let provider = GitProvider::new(root.path().to_path_buf());
    let wsid = Uuid::new_v4();

    let checkout = provider
        .ensure_workspace(
            wsid,
            SourceType::Local,
            &origin.path().to_string_lossy(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(checkout.head.as_deref(), Some(head.as_str()));
    assert!(checkout.path.join("README.md").exists());
    assert!(checkout.branches.contains(&"main".to_string()));

    // Second call fetches instead of recloning and still reports HEAD.
    let again = provider
        .ensure_workspace(
            wsid,
            SourceType::Local,
            &origin.path().to_string_lossy(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(again.head, checkout.head);
}

#[tokio::test]
async fn ensure_workspace_checks_out_pinned_commit() {
    let origin = tempfile::tempdir().unwrap();
    let first = init_origin(origin.path());
    std::fs::write(origin.path().join("second.txt"), "two\n").unwrap();
    sh(origin.path(), &["git", "add", "-A"]);
    sh(origin.path(), &["git", "commit", "-m", "second"]);

    let root = tempfile::tempdir().unwrap();
    let provider = GitProvider::new(root.path().to_path_buf());
    let wsid = Uuid::new_v4();

    let checkout = provider
        .ensure_workspace(
            wsid,
            SourceType::Local,
            &origin.path().to_string_lossy(),
            Some(&first),
        )
        .await
        .unwrap();

    assert_eq!(checkout.head.as_deref(), Some(first.as_str()));
    assert!(!checkout.path.join("second.txt").exists());
}

#[tokio::test]
async fn missing_local_source_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let provider = GitProvider::new(root.path().to_path_buf());

    let err = provider
        .ensure_workspace(Uuid::new_v4(), SourceType::Local, "/does/not/exist", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn session_worktrees_are_isolated() {
    let origin = tempfile::tempdir().unwrap();
    init_origin(origin.path());

    let root = tempfile::tempdir().unwrap();
    let provider = GitProvider::new(root.path().to_path_buf());
    let wsid = Uuid::new_v4();
    provider
        .ensure_workspace(
            wsid,
            SourceType::Local,
            &origin.path().to_string_lossy(),
            None,
        )
        .await
        .unwrap();

    let s1 = Uuid::new_v4();
    let s2 = Uuid::new_v4();
    let dir1 = provider.acquire_session_dir(wsid, s1).await.unwrap();
    let dir2 = provider.acquire_session_dir(wsid, s2).await.unwrap();
    assert_ne!(dir1, dir2);

    // An uncommitted edit in one session is invisible to the other.
    std::fs::write(dir1.join("scratch.txt"), "wip\n").unwrap();
    assert!(!dir2.join("scratch.txt").exists());

    // Acquire is idempotent.
    assert_eq!(provider.acquire_session_dir(wsid, s1).await.unwrap(), dir1);

    provider.release_session_dir(wsid, s1).await.unwrap();
    assert!(!dir1.exists());
    // Releasing again is a no-op.
    provider.release_session_dir(wsid, s1).await.unwrap();
}

#[tokio::test]
async fn apply_mbox_lands_patches_on_session_branch() {
    let origin = tempfile::tempdir().unwrap();
    let base = init_origin(origin.path());

    // Build a patch in a scratch clone of the origin.
    let scratch = tempfile::tempdir().unwrap();
    sh(
        scratch.path(),
        &["git", "clone", &origin.path().to_string_lossy(), "work"],
    );
    let work = scratch.path().join("work");
    sh(&work, &["git", "config", "user.email", "agent@example.com"]);
    sh(&work, &["git", "config", "user.name", "Agent"]);
    std::fs::write(work.join("feature.txt"), "new feature\n").unwrap();
    sh(&work, &["git", "add", "-A"]);
    sh(&work, &["git", "commit", "-m", "add feature"]);
    let mbox = sh(&work, &["git", "format-patch", "--stdout", "HEAD~1"]);

    let root = tempfile::tempdir().unwrap();
    let provider = GitProvider::new(root.path().to_path_buf());
    let wsid = Uuid::new_v4();
    provider
        .ensure_workspace(
            wsid,
            SourceType::Local,
            &origin.path().to_string_lossy(),
            None,
        )
        .await
        .unwrap();

    let sid = Uuid::new_v4();
    let applied = provider
        .apply_mbox(wsid, sid, &base, mbox.as_bytes())
        .await
        .unwrap();

    assert_ne!(applied, base);
    let repo = provider.repo_dir(wsid);
    assert!(repo.join("feature.txt").exists());
    let branch = sh(&repo, &["git", "rev-parse", "--abbrev-ref", "HEAD"]);
    assert_eq!(branch, format!("session/{sid}"));
    // The applied commit is reachable from the session branch.
    let tip = sh(&repo, &["git", "rev-parse", &format!("session/{sid}")]);
    assert_eq!(tip, applied);
}

#[tokio::test]
async fn conflicting_mbox_reports_patch_conflict() {
    let origin = tempfile::tempdir().unwrap();
    let base = init_origin(origin.path());

    // Patch rewrites README from content the base never had.
    let scratch = tempfile::tempdir().unwrap();
    sh(
        scratch.path(),
        &["git", "clone", &origin.path().to_string_lossy(), "work"],
    );
    let work = scratch.path().join("work");
    sh(&work, &["git", "config", "user.email", "agent@example.com"]);
    sh(&work, &["git", "config", "user.name", "Agent"]);
    std::fs::write(work.join("README.md"), "# rewritten base\n").unwrap();
    sh(&work, &["git", "add", "-A"]);
    sh(&work, &["git", "commit", "-m", "divergent base"]);
    std::fs::write(work.join("README.md"), "# conflicting change\n").unwrap();
    sh(&work, &["git", "add", "-A"]);
    sh(&work, &["git", "commit", "-m", "conflicting"]);
    let mbox = sh(&work, &["git", "format-patch", "--stdout", "HEAD~1"]);

    let root = tempfile::tempdir().unwrap();
    let provider = GitProvider::new(root.path().to_path_buf());
    let wsid = Uuid::new_v4();
    provider
        .ensure_workspace(
            wsid,
            SourceType::Local,
            &origin.path().to_string_lossy(),
            None,
        )
        .await
        .unwrap();

    let err = provider
        .apply_mbox(wsid, Uuid::new_v4(), &base, mbox.as_bytes())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PatchConflict(_)));

    // The shared clone is left clean for the next attempt.
    let status = provider.status(wsid).await.unwrap();
    assert!(status.is_empty());
}

#[tokio::test]
async fn stage_commit_and_log() {
    let origin = tempfile::tempdir().unwrap();
    init_origin(origin.path());

    let root = tempfile::tempdir().unwrap();
    let provider = GitProvider::new(root.path().to_path_buf());
    let wsid = Uuid::new_v4();
    provider
        .ensure_workspace(
            wsid,
            SourceType::Local,
            &origin.path().to_string_lossy(),
            None,
        )
        .await
        .unwrap();
    let repo = provider.repo_dir(wsid);
    sh(&repo, &["git", "config", "user.email", "dev@example.com"]);
    sh(&repo, &["git", "config", "user.name", "Dev"]);

    provider
        .write_file(wsid, "notes/todo.txt", b"ship it\n")
        .await
        .unwrap();
    let status = provider.status(wsid).await.unwrap();
    assert!(status.iter().any(|e| e.path.contains("todo.txt")));

    provider.stage(wsid, &[]).await.unwrap();
    let sha = provider
        .commit(wsid, "add todo", "Dev", "dev@example.com")
        .await
        .unwrap();

    let log = provider.log(wsid, 5).await.unwrap();
    assert_eq!(log[0].sha, sha);
    assert_eq!(log[0].subject, "add todo");
    assert_eq!(log[0].author_name, "Dev");

    let content = provider.read_file(wsid, "notes/todo.txt").await.unwrap();
    assert_eq!(content, b"ship it\n");
}

#[tokio::test]
async fn ensure_by_id_resolves_through_the_source_trait() {
    struct FixedSource(String);

    #[async_trait::async_trait]
    impl berth_git::WorkspaceSource for FixedSource {
        async fn resolve(
            &self,
            _workspace_id: uuid::Uuid,
        ) -> berth_core::Result<(SourceType, String)> {
            Ok((SourceType::Local, self.0.clone()))
        }
    }

    let origin = tempfile::tempdir().unwrap();
    let head = init_origin(origin.path());

    let root = tempfile::tempdir().unwrap();
    let provider = GitProvider::new(root.path().to_path_buf()).with_sources(
        std::sync::Arc::new(FixedSource(origin.path().to_string_lossy().to_string())),
    );

    let checkout = provider
        .ensure_workspace_by_id(Uuid::new_v4(), None)
        .await
        .unwrap();
    assert_eq!(checkout.head.as_deref(), Some(head.as_str()));
}
