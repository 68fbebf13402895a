//! Local checkout state and the git commands that change it

use std::io::ErrorKind;
use std::path::Path;

use crate::error::{DeployError, Result};
use crate::process::{CommandError, CommandRunner, CommandSpec};

/// Observed state of a local checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutStatus {
    /// Nothing exists at the path.
    Absent,
    /// The path exists but is not a directory.
    OccupiedByFile,
    /// A git checkout on another branch than the expected one.
    WrongBranch { actual: String },
    /// A git checkout on the expected branch.
    Valid,
}

/// Inspect `path` and compare its branch to `expected_branch`.
///
/// An empty `expected_branch` accepts any branch. Filesystem errors other than
/// "not found", non-git directories and detached HEADs are errors.
pub async fn validate(
    runner: &dyn CommandRunner,
    path: &Path,
    expected_branch: &str,
) -> Result<CheckoutStatus> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CheckoutStatus::Absent),
        Err(e) => return Err(e.into()),
    };

    if !metadata.is_dir() {
        return Ok(CheckoutStatus::OccupiedByFile);
    }

    ensure_toplevel(runner, path).await?;
    let actual = current_branch(runner, path).await?;
    if expected_branch.is_empty() || actual == expected_branch {
        Ok(CheckoutStatus::Valid)
    } else {
        Ok(CheckoutStatus::WrongBranch { actual })
    }
}

fn rev_parse(path: &Path, args: &[&str]) -> CommandSpec {
    let mut full = vec!["-C".to_string(), path.display().to_string(), "rev-parse".to_string()];
    full.extend(args.iter().map(|arg| arg.to_string()));
    CommandSpec::exec("git", full, path)
}

async fn run_rev_parse(runner: &dyn CommandRunner, path: &Path, args: &[&str]) -> Result<String> {
    match runner.run(&rev_parse(path, args)).await {
        Ok(output) => Ok(output.trim().to_string()),
        Err(CommandError::NonZeroExit { output, .. }) => Err(DeployError::NotACheckout {
            path: path.to_path_buf(),
            message: output,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Fails unless `path` is the top level of its own work tree.
///
/// git resolves a plain directory to the nearest enclosing repository, so a
/// directory nested in another checkout would otherwise look valid.
pub async fn ensure_toplevel(runner: &dyn CommandRunner, path: &Path) -> Result<()> {
    let reported = run_rev_parse(runner, path, &["--show-toplevel"]).await?;
    let expected = tokio::fs::canonicalize(path).await?;

    match tokio::fs::canonicalize(&reported).await {
        Ok(toplevel) if toplevel == expected => Ok(()),
        _ => Err(DeployError::NotACheckout {
            path: path.to_path_buf(),
            message: format!("work tree starts at '{}'", reported),
        }),
    }
}

/// Name of the branch HEAD points to.
pub async fn current_branch(runner: &dyn CommandRunner, path: &Path) -> Result<String> {
    let branch = run_rev_parse(runner, path, &["--abbrev-ref", "HEAD"]).await?;

    // rev-parse prints a literal HEAD when not on a branch
    match branch.as_str() {
        "HEAD" => Err(DeployError::DetachedHead(path.to_path_buf())),
        "" => Err(DeployError::NotACheckout {
            path: path.to_path_buf(),
            message: "no branch reported".to_string(),
        }),
        _ => Ok(branch),
    }
}

/// `git clone [--branch B --single-branch] URL PATH`, run from the parent of `path`.
pub fn clone_command(url: &str, path: &Path, branch: &str) -> CommandSpec {
    let mut args = vec!["clone".to_string()];
    if !branch.is_empty() {
        args.extend(["--branch".to_string(), branch.to_string(), "--single-branch".to_string()]);
    }
    args.push(url.to_string());
    args.push(path.display().to_string());

    let dir = path.parent().unwrap_or(path);
    CommandSpec::exec("git", args, dir)
}

/// Fast-forward only `git pull` in the checkout.
pub fn pull_command(path: &Path) -> CommandSpec {
    CommandSpec::exec("git", ["pull", "--ff-only"], path)
}
