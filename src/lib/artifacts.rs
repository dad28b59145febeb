//! The artifact sink: files jobs leave behind for their dependents and for
//! deployments, stored under `<sink>/<run id>/<job>/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use glob::MatchOptions;
use log::{debug, warn};

use crate::run::ArtifactRef;


/// Copies the workspace files matching `patterns` into `sink_dir`
pub fn collect(
    job: &str,
    workspace: &Path,
    patterns: &[String],
    sink_dir: &Path,
) -> io::Result<Vec<ArtifactRef>> {
    let options = MatchOptions {
        require_literal_separator: true,
        ..Default::default()
    };
    let mut refs: Vec<ArtifactRef> = Vec::new();
    for pattern in patterns {
        let full = workspace.join(pattern);
        let paths = glob::glob_with(&full.to_string_lossy(), options)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut matched = false;
        for entry in paths {
            let path = entry.map_err(|e| e.into_error())?;
            if !path.is_file() {
                continue;
            }
            matched = true;
            let relative = path
                .strip_prefix(workspace)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| PathBuf::from(path.file_name().unwrap_or_default()));
            if refs.iter().any(|r| r.relative == relative) {
                continue;
            }
            let dest = sink_dir.join(&relative);
            copy_creating_dirs(&path, &dest)?;
            debug!("job \"{}\": collected {}", job, relative.display());
            refs.push(ArtifactRef {
                job: job.to_string(),
                relative,
                path: dest,
            });
        }
        if !matched {
            warn!("job \"{}\": artifact pattern \"{}\" matched nothing", job, pattern);
        }
    }
    Ok(refs)
}

/// Copies artifacts back into a fresh workspace, at their original paths
pub fn restore(refs: &[ArtifactRef], workspace: &Path) -> io::Result<()> {
    for r in refs {
        copy_creating_dirs(&r.path, &workspace.join(&r.relative))?;
    }
    Ok(())
}

fn copy_creating_dirs(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to)?;
    Ok(())
}
