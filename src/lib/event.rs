use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::event::{Event, EventKind};

    #[test]
    fn parse_event_kinds() {
        assert_eq!("push".parse::<EventKind>().unwrap(), EventKind::Push);
        assert_eq!(
            "pull_request".parse::<EventKind>().unwrap(),
            EventKind::PullRequest
        );
        assert_eq!("pr".parse::<EventKind>().unwrap(), EventKind::PullRequest);
        assert!("tag".parse::<EventKind>().is_err());
    }

    #[test]
    fn display_event() {
        let e = Event::pull_request("main", "abc1234");
        assert_eq!(format!("{}", e), "pull_request on main@abc1234");
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// What happened upstream to make us run
pub enum EventKind {
    Push,
    PullRequest,
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            other => Err(format!(
                "unknown event \"{}\", expected push or pull_request",
                other
            )),
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// An incoming event. For pull requests, `branch` is the target branch.
pub struct Event {
    pub kind: EventKind,
    pub branch: String,
    pub commit: String,
}

impl Event {
    pub fn new(kind: EventKind, branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Event {
            kind,
            branch: branch.into(),
            commit: commit.into(),
        }
    }

    pub fn push(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self::new(EventKind::Push, branch, commit)
    }

    pub fn pull_request(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self::new(EventKind::PullRequest, branch, commit)
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on {}@{}", self.kind, self.branch, self.commit)
    }
}
