//! Command-line git invocation. gix covers repository open and HEAD reads;
//! everything workflow-shaped (clone, fetch, worktree, am) shells out, which
//! keeps behaviour identical to what an operator would run by hand.

use std::path::Path;
use std::process::Stdio;

use berth_core::{Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Run `git <args>` in `dir`, returning trimmed stdout.
pub(crate) async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| Error::Git(format!("failed to spawn git {}: {e}", args.join(" "))))?;

    if !output.status.success() {
        return Err(Error::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run `git <args>` with `input` piped to stdin. Used for `git am`.
pub(crate) async fn git_with_stdin(dir: &Path, args: &[&str], input: &[u8]) -> Result<String> {
    let mut child = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Git(format!("failed to spawn git {}: {e}", args.join(" "))))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .await
            .map_err(|e| Error::Git(format!("failed to write git stdin: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::Git(format!("git {} failed: {e}", args.join(" "))))?;

    if !output.status.success() {
        return Err(Error::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
