//! Decides whether a job runs once all of its dependencies are terminal.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::conf::{Predicate, RunCondition, UpstreamRequirement};
use crate::event::Event;
use crate::run::{JobStatus, RunStatus};
use crate::trigger::BranchMatcher;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::conf::{Predicate, RunCondition, UpstreamRequirement};
    use crate::event::{Event, EventKind};
    use crate::gating::{evaluate, Upstream, Verdict};
    use crate::run::{JobStatus, RunStatus};

    fn upstream(statuses: &[(&str, JobStatus)]) -> Upstream {
        Upstream::new(statuses.iter().map(|(n, s)| (n.to_string(), *s)))
    }

    fn main_push() -> Event {
        Event::push("main", "abc")
    }

    #[test]
    fn default_condition_needs_every_dependency() {
        let ok = upstream(&[("a", JobStatus::Succeeded), ("b", JobStatus::Succeeded)]);
        assert_eq!(evaluate(&RunCondition::Success, &ok, &main_push()), Verdict::Run);

        let failed = upstream(&[("a", JobStatus::Failed), ("b", JobStatus::Succeeded)]);
        assert_eq!(
            evaluate(&RunCondition::Success, &failed, &main_push()),
            Verdict::Skip("dependency \"a\" failed".to_string())
        );

        let skipped = upstream(&[("a", JobStatus::Skipped)]);
        assert!(matches!(
            evaluate(&RunCondition::Success, &skipped, &main_push()),
            Verdict::Skip(_)
        ));
    }

    #[test]
    fn no_dependencies_runs() {
        let none = upstream(&[]);
        assert_eq!(evaluate(&RunCondition::Success, &none, &main_push()), Verdict::Run);
        assert_eq!(none.aggregate(), RunStatus::Succeeded);
    }

    #[test]
    fn always_runs_and_sees_the_failure() {
        let failed = upstream(&[("a", JobStatus::Failed)]);
        assert_eq!(evaluate(&RunCondition::Always, &failed, &main_push()), Verdict::Run);
        assert_eq!(failed.aggregate(), RunStatus::Failed);
    }

    #[test]
    fn custom_branch_filter() {
        let deploy = RunCondition::Custom(Predicate {
            upstream: UpstreamRequirement::Success,
            branches: vec!["main".into()],
            events: vec![EventKind::Push],
        });
        let ok = upstream(&[("build", JobStatus::Succeeded)]);
        assert_eq!(evaluate(&deploy, &ok, &main_push()), Verdict::Run);
        assert!(matches!(
            evaluate(&deploy, &ok, &Event::push("develop", "abc")),
            Verdict::Skip(_)
        ));
        assert!(matches!(
            evaluate(&deploy, &ok, &Event::pull_request("main", "abc")),
            Verdict::Skip(_)
        ));
        let failed = upstream(&[("build", JobStatus::Failed)]);
        assert!(matches!(evaluate(&deploy, &failed, &main_push()), Verdict::Skip(_)));
    }

    #[test]
    fn custom_failure_requirement() {
        let on_failure = RunCondition::Custom(Predicate {
            upstream: UpstreamRequirement::Failure,
            ..Default::default()
        });
        let cancelled = upstream(&[("a", JobStatus::Cancelled)]);
        assert_eq!(evaluate(&on_failure, &cancelled, &main_push()), Verdict::Run);
        let ok = upstream(&[("a", JobStatus::Succeeded)]);
        assert!(matches!(evaluate(&on_failure, &ok, &main_push()), Verdict::Skip(_)));

        let any = RunCondition::Custom(Predicate {
            upstream: UpstreamRequirement::Any,
            ..Default::default()
        });
        assert_eq!(evaluate(&any, &ok, &main_push()), Verdict::Run);
        assert_eq!(evaluate(&any, &cancelled, &main_push()), Verdict::Run);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Run,
    Skip(String),
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
/// Read-only snapshot of a job's direct dependencies' terminal statuses
pub struct Upstream {
    statuses: BTreeMap<String, JobStatus>,
}

impl Upstream {
    pub fn new(statuses: impl IntoIterator<Item = (String, JobStatus)>) -> Self {
        Upstream {
            statuses: statuses.into_iter().collect(),
        }
    }

    pub fn statuses(&self) -> &BTreeMap<String, JobStatus> {
        &self.statuses
    }

    /// Cancelled if any dependency was, failed if any failed, succeeded otherwise
    pub fn aggregate(&self) -> RunStatus {
        if self.statuses.values().any(|s| *s == JobStatus::Cancelled) {
            RunStatus::Cancelled
        } else if self.statuses.values().any(|s| *s == JobStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    fn first_not_succeeded(&self) -> Option<(&String, &JobStatus)> {
        self.statuses
            .iter()
            .find(|(_, s)| **s != JobStatus::Succeeded)
    }
}

/// Evaluates `condition` against terminal upstream statuses and the event
pub fn evaluate(condition: &RunCondition, upstream: &Upstream, event: &Event) -> Verdict {
    match condition {
        RunCondition::Always => Verdict::Run,
        RunCondition::Success => all_succeeded(upstream),
        RunCondition::Custom(predicate) => evaluate_predicate(predicate, upstream, event),
    }
}

fn all_succeeded(upstream: &Upstream) -> Verdict {
    match upstream.first_not_succeeded() {
        None => Verdict::Run,
        Some((name, status)) => Verdict::Skip(format!("dependency \"{}\" {}", name, status)),
    }
}

fn evaluate_predicate(predicate: &Predicate, upstream: &Upstream, event: &Event) -> Verdict {
    let verdict = match predicate.upstream {
        UpstreamRequirement::Success => all_succeeded(upstream),
        UpstreamRequirement::Failure => {
            if upstream.statuses.values().any(JobStatus::is_failure) {
                Verdict::Run
            } else {
                Verdict::Skip("no dependency failed".to_string())
            }
        }
        UpstreamRequirement::Any => Verdict::Run,
    };
    if verdict != Verdict::Run {
        return verdict;
    }
    if !predicate.events.is_empty() && !predicate.events.contains(&event.kind) {
        return Verdict::Skip(format!("event {} is filtered out", event.kind));
    }
    // patterns were validated when the pipeline was loaded
    let branch_ok = BranchMatcher::new(&predicate.branches)
        .map(|m| m.matches(&event.branch))
        .unwrap_or(false);
    if !branch_ok {
        return Verdict::Skip(format!("branch \"{}\" is filtered out", event.branch));
    }
    Verdict::Run
}
