use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {args:?} failed: {stderr}")]
    CommandFailed { args: Vec<String>, stderr: String },
    #[error("git output is not valid UTF-8")]
    InvalidOutput,
}

fn run_git(project_dir: &Path, args: &[&str]) -> Result<String, VcsError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(project_dir)
        .output()?;
    if !output.status.success() {
        return Err(VcsError::CommandFailed {
            args: args.iter().map(|a| a.to_string()).collect(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    let stdout = String::from_utf8(output.stdout).map_err(|_| VcsError::InvalidOutput)?;
    Ok(stdout.trim().to_string())
}

/// Returns the HEAD commit hash of the repository at `project_dir`.
pub fn git_commit(project_dir: &Path) -> Result<String, VcsError> {
    run_git(project_dir, &["rev-parse", "HEAD"])
}

/// Returns the currently checked out branch name.
pub fn git_branch(project_dir: &Path) -> Result<String, VcsError> {
    run_git(project_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// Returns true if the working tree has uncommitted changes. Any git
/// failure is treated as "not dirty"; this is a best-effort signal only.
pub fn git_is_dirty(project_dir: &Path) -> bool {
    match run_git(project_dir, &["status", "--porcelain"]) {
        Ok(output) => !output.is_empty(),
        Err(_) => false,
    }
}
