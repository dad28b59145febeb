//! Running job steps inside throwaway containers.

use std::path::Path;

use anyhow::{anyhow, Result};
use log::debug;
use tokio::process::Command;

use crate::conf::Env;
use crate::utils::random_suffix;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use crate::utils::docker::{container_name, docker_remove_container, run_args};

    #[test]
    fn container_names_are_valid() {
        let name = container_name("shopsmart", "Backend Tests!");
        assert!(name.starts_with("relayci-shopsmart-backend-tests-"));
        assert!(name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_'));
    }

    #[test]
    fn env_values_stay_off_the_command_line() {
        let mut env = HashMap::new();
        env.insert("VERCEL_TOKEN".to_string(), "s3cr3t".to_string());
        let args = run_args("node:20", "c1", Path::new("/tmp/ws"), &env, "npm test");
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "--name=c1",
                "--volume=/tmp/ws:/code",
                "--workdir=/code",
                "-e",
                "VERCEL_TOKEN",
                "node:20",
                "sh",
                "-c",
                "npm test"
            ]
        );
        assert!(!args.iter().any(|a| a.contains("s3cr3t")));
    }

    #[tokio::test]
    #[ignore]
    async fn remove_missing_container() {
        assert!(docker_remove_container("relayci-does-not-exist").await.is_err());
    }
}

const DOCKER_NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz-_0123456789";

/// Generates a random, valid, container name for a pipeline's job
pub fn container_name(pipeline: &str, job: &str) -> String {
    let sanitize = |s: &str| {
        let valid_bytes = s
            .to_lowercase()
            .bytes()
            .map(|b| match b {
                b' ' => b'-',
                _ => b,
            })
            .filter(|b| DOCKER_NAME_CHARSET.contains(b))
            .collect::<Vec<u8>>();
        String::from_utf8_lossy(&valid_bytes).to_string()
    };
    format!(
        "relayci-{}-{}-{}",
        sanitize(pipeline),
        sanitize(job),
        random_suffix(6)
    )
}

/// Arguments for `docker run`, executing `command` with the workspace
/// mounted as `/code`. Environment values are not part of the arguments:
/// `-e NAME` makes docker read them from its own environment.
pub fn run_args(
    image: &str,
    container: &str,
    workspace: &Path,
    env: &Env,
    command: &str,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        format!("--name={}", container),
        format!("--volume={}:/code", workspace.display()),
        "--workdir=/code".to_string(),
    ];
    let mut names: Vec<&String> = env.keys().collect();
    names.sort();
    for name in names {
        args.push("-e".to_string());
        args.push(name.clone());
    }
    args.push(image.to_string());
    args.extend(["sh".to_string(), "-c".to_string(), command.to_string()]);
    args
}

/// A `docker run` command for one step. The caller sets stdio.
pub fn run_command(
    image: &str,
    container: &str,
    workspace: &Path,
    env: &Env,
    command: &str,
) -> Command {
    let args = run_args(image, container, workspace, env, command);
    debug!("Running docker {}", args.join(" "));
    let mut cmd = Command::new("docker");
    cmd.args(args).envs(env);
    cmd
}

/// Force-removes a container, killing it if it still runs
pub async fn docker_remove_container(container: &str) -> Result<()> {
    debug!("Running docker rm -f {}", container);
    let output = Command::new("docker")
        .args(["rm", "-f", container])
        .output()
        .await?;
    if !output.status.success() {
        return Err(anyhow!("Could not remove docker container {}", container));
    }
    Ok(())
}
