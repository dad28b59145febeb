//! Decides which pipelines an event starts.

use std::path::{Component, Path};

use glob::Pattern;
use log::trace;

use crate::conf::{PipelineDefinition, RunCondition};
use crate::error::ConfigError;
use crate::event::{Event, EventKind};


#[derive(Debug, Clone, Default)]
/// A set of branch globs. An empty set matches every branch.
pub struct BranchMatcher {
    patterns: Vec<Pattern>,
}

impl BranchMatcher {
    pub fn new(patterns: &[String]) -> Result<Self, (String, glob::PatternError)> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| (p.clone(), e)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BranchMatcher { patterns })
    }

    pub fn matches(&self, branch: &str) -> bool {
        self.patterns.is_empty()
            || self.patterns.iter().any(|p| {
                trace!("pattern: {}, branch: {}", p, branch);
                p.matches(branch)
            })
    }
}

#[derive(Debug, Clone)]
struct CompiledTrigger {
    event: EventKind,
    branches: BranchMatcher,
}

#[derive(Debug, Clone)]
/// A validated pipeline definition, with its trigger rules compiled
pub struct Pipeline {
    pub definition: PipelineDefinition,
    triggers: Vec<CompiledTrigger>,
}

impl Pipeline {
    /// Compiles trigger rules and checks every other glob of the definition
    pub fn compile(definition: PipelineDefinition) -> Result<Self, ConfigError> {
        let mut triggers = Vec::with_capacity(definition.triggers.len());
        for rule in &definition.triggers {
            let branches = BranchMatcher::new(&rule.branches).map_err(|(pattern, source)| {
                ConfigError::InvalidTrigger {
                    pipeline: definition.name.clone(),
                    pattern,
                    source,
                }
            })?;
            triggers.push(CompiledTrigger {
                event: rule.event,
                branches,
            });
        }
        for job in &definition.jobs {
            let invalid = |(pattern, source): (String, glob::PatternError)| {
                ConfigError::InvalidPattern {
                    pipeline: definition.name.clone(),
                    job: job.name.clone(),
                    pattern,
                    source,
                }
            };
            let escaping = |path: &str| ConfigError::EscapingPath {
                pipeline: definition.name.clone(),
                job: job.name.clone(),
                path: path.to_string(),
            };
            // job names become directories of the artifact sink
            if !is_plain_component(&job.name) {
                return Err(escaping(&job.name));
            }
            if let Some(p) = job.artifacts.iter().find(|p| !stays_inside(p)) {
                return Err(escaping(p));
            }
            BranchMatcher::new(&job.artifacts).map_err(invalid)?;
            if let RunCondition::Custom(predicate) = &job.condition {
                BranchMatcher::new(&predicate.branches).map_err(invalid)?;
            }
        }
        Ok(Pipeline {
            definition,
            triggers,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn is_triggered_by(&self, event: &Event) -> bool {
        self.triggers
            .iter()
            .any(|t| t.event == event.kind && t.branches.matches(&event.branch))
    }
}

fn is_plain_component(name: &str) -> bool {
    matches!(
        Path::new(name).components().collect::<Vec<_>>().as_slice(),
        [Component::Normal(_)]
    ) && !name.contains('\\')
}

/// Relative, and never climbing with `..`
fn stays_inside(pattern: &str) -> bool {
    Path::new(pattern)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Returns the pipelines `event` starts, in the order they were given
pub fn select<'a>(pipelines: &'a [Pipeline], event: &Event) -> Vec<&'a Pipeline> {
    pipelines
        .iter()
        .filter(|p| p.is_triggered_by(event))
        .collect()
}
