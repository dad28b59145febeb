//! Polling mode: turns new commits on watched branches into push events.

use std::collections::{BTreeMap, HashMap};
use std::fs;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, trace};

use crate::conf::RepositoryConfig;
use crate::event::Event;
use crate::trigger::BranchMatcher;
use crate::utils::git;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use crate::conf::RepositoryConfig;
    use crate::event::Event;
    use crate::trigger::BranchMatcher;
    use crate::watch::{changed_heads, RepositoryWatcher};

    fn heads(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(b, c)| (b.to_string(), c.to_string()))
            .collect()
    }

    fn repo(state_file: Option<std::path::PathBuf>) -> RepositoryConfig {
        RepositoryConfig {
            name: "shopsmart".into(),
            uri: "https://example.invalid/shopsmart.git".into(),
            branches: vec!["main".into(), "release/*".into()],
            state_file,
        }
    }

    #[test]
    fn new_and_moved_heads_are_events() {
        let matcher = BranchMatcher::new(&["main".into(), "release/*".into()]).unwrap();
        let before = heads(&[("main", "aaa"), ("release/1.0", "bbb"), ("wip", "ccc")]);
        let after = heads(&[
            ("main", "ddd"),
            ("release/1.0", "bbb"),
            ("release/1.1", "eee"),
            ("wip", "fff"),
        ]);
        assert_eq!(
            changed_heads(&before, &after, &matcher),
            vec![Event::push("main", "ddd"), Event::push("release/1.1", "eee")]
        );
    }

    #[test]
    fn first_poll_only_seeds() {
        let mut w = RepositoryWatcher::new(repo(None)).unwrap();
        assert!(w.observe(heads(&[("main", "aaa")])).unwrap().is_empty());
        assert_eq!(
            w.observe(heads(&[("main", "bbb")])).unwrap(),
            vec![Event::push("main", "bbb")]
        );
        assert!(w.observe(heads(&[("main", "bbb")])).unwrap().is_empty());
    }

    #[test]
    fn state_survives_restarts() {
        let tmp = TempDir::new().unwrap();
        let state = tmp.path().join("shopsmart.state.yml");
        let mut w = RepositoryWatcher::new(repo(Some(state.clone()))).unwrap();
        w.observe(heads(&[("main", "aaa")])).unwrap();
        assert!(state.exists());

        let mut restarted = RepositoryWatcher::new(repo(Some(state))).unwrap();
        assert_eq!(
            restarted.observe(heads(&[("main", "bbb")])).unwrap(),
            vec![Event::push("main", "bbb")]
        );
    }

    #[test]
    fn unwritable_state_still_yields_events() {
        let tmp = TempDir::new().unwrap();
        let state = tmp.path().join("state.yml");
        let mut w = RepositoryWatcher::new(repo(Some(state.clone()))).unwrap();
        w.observe(heads(&[("main", "aaaaaaa")])).unwrap();
        std::fs::remove_file(&state).unwrap();
        std::fs::create_dir(&state).unwrap();
        assert_eq!(
            w.observe(heads(&[("main", "bbbbbbb")])).unwrap(),
            vec![Event::push("main", "bbbbbbb")]
        );
    }

    #[test]
    fn invalid_branch_pattern() {
        let mut r = repo(None);
        r.branches = vec!["[main".into()];
        assert!(RepositoryWatcher::new(r).is_err());
    }
}

/// Branches whose head is new or moved, as push events, sorted by branch
pub fn changed_heads(
    previous: &HashMap<String, String>,
    current: &HashMap<String, String>,
    branches: &BranchMatcher,
) -> Vec<Event> {
    let mut events: Vec<Event> = current
        .iter()
        .filter(|(branch, commit)| previous.get(*branch) != Some(*commit))
        .filter(|(branch, _)| branches.matches(branch))
        .map(|(branch, commit)| Event::push(branch.as_str(), commit.as_str()))
        .collect();
    events.sort_by(|a, b| a.branch.cmp(&b.branch));
    events
}

#[derive(Debug)]
/// Remembers the heads of one repository between polls
pub struct RepositoryWatcher {
    config: RepositoryConfig,
    branches: BranchMatcher,
    heads: Option<HashMap<String, String>>,
}

impl RepositoryWatcher {
    /// Restores the last seen heads from the state file, when there is one
    pub fn new(config: RepositoryConfig) -> Result<Self> {
        let branches = BranchMatcher::new(&config.branches).map_err(|(pattern, e)| {
            anyhow!(
                "repository \"{}\": invalid branch pattern \"{}\": {}",
                config.name,
                pattern,
                e
            )
        })?;
        let heads = match &config.state_file {
            Some(path) if path.exists() => {
                let s = fs::read_to_string(path)
                    .with_context(|| format!("could not read {}", path.display()))?;
                let saved: HashMap<String, String> = serde_yaml::from_str(&s)
                    .with_context(|| format!("could not parse {}", path.display()))?;
                debug!("repository \"{}\": restored {} heads", config.name, saved.len());
                Some(saved)
            }
            _ => None,
        };
        Ok(RepositoryWatcher {
            config,
            branches,
            heads,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn uri(&self) -> &str {
        &self.config.uri
    }

    /// Fetches the remote heads and returns the resulting events
    pub async fn poll(&mut self) -> Result<Vec<Event>> {
        debug!("Checking repo {}", self.config.name);
        let current = git::fetch(&self.config.uri).await?;
        self.observe(current)
    }

    /// Records `current` as the latest heads. The very first observation,
    /// without saved state, only seeds the watcher.
    pub fn observe(&mut self, current: HashMap<String, String>) -> Result<Vec<Event>> {
        trace!("repo {} heads: {:?}", self.config.name, current);
        let events = match &self.heads {
            Some(previous) => changed_heads(previous, &current, &self.branches),
            None => {
                info!(
                    "Watching {} ({} branches)",
                    self.config.name,
                    current.len()
                );
                vec![]
            }
        };
        self.heads = Some(current);
        // events are returned even when the state cannot be saved
        if let Err(e) = self.persist() {
            error!("repository \"{}\": {:#}", self.config.name, e);
        }
        Ok(events)
    }

    fn persist(&self) -> Result<()> {
        let (path, heads) = match (&self.config.state_file, &self.heads) {
            (Some(p), Some(h)) => (p, h),
            _ => return Ok(()),
        };
        let sorted: BTreeMap<&String, &String> = heads.iter().collect();
        fs::write(path, serde_yaml::to_string(&sorted)?)
            .with_context(|| format!("could not write {}", path.display()))?;
        trace!("persisted heads of {} to {}", self.config.name, path.display());
        Ok(())
    }
}
