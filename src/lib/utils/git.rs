/// all utility functions git-related
use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use log::{debug, error};
use regex::Regex;
use tokio::process::Command;

lazy_static! {
    static ref REF_PATTERN: Regex = Regex::new(r"^([0-9a-fA-F]+)[ \t]+refs/heads/(\S+)$")
        .expect("could not compile pattern");
}


/// Branch name → commit hash, from `git ls-remote --heads` output
pub(crate) fn parse_heads(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter_map(|line| REF_PATTERN.captures(line.trim()))
        .map(|capture| (capture[2].to_string(), capture[1].to_string()))
        .collect()
}

/// Lists the heads of a remote: branch name → commit hash
pub async fn fetch(uri: &str) -> Result<HashMap<String, String>> {
    debug!("Running git ls-remote --heads {}", uri);
    let o = Command::new("git")
        .arg("ls-remote")
        .arg("--heads")
        .arg(uri)
        .output()
        .await?;
    if !o.status.success() {
        error!("failed to run git ls-remote --heads {}", uri);
        return Err(anyhow!("failed to run git ls-remote --heads {}", uri));
    }
    Ok(parse_heads(&String::from_utf8(o.stdout)?))
}

/// Clones `repo_url` into `to` and checks out `branch`
pub async fn clone_branch(repo_url: &str, branch: &str, to: &Path) -> Result<()> {
    debug!("Running git clone --branch {} {} {}", branch, repo_url, to.display());
    let output = Command::new("git")
        .args(["clone", "--quiet", "--branch", branch, repo_url])
        .arg(to)
        .output()
        .await?;
    if !output.status.success() {
        error!("could not git clone {}!", repo_url);
        return Err(anyhow!(
            "Could not git clone {}#{}: {}",
            repo_url,
            branch,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Checks out `commit` in the repository at `dir`
pub async fn checkout(dir: &Path, commit: &str) -> Result<()> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["checkout", "--quiet", commit])
        .output()
        .await?;
    if !output.status.success() {
        error!("Could not checkout {}", commit);
        return Err(anyhow!("Could not checkout {}!", commit));
    }
    Ok(())
}
