//! Validated job dependency graph.
//!
//! Jobs are nodes indexed by declaration order; an edge goes from a job to
//! each of its `depends_on` entries. Topological order comes from Kahn's
//! algorithm, picking the earliest declared ready job first so the order is
//! deterministic.

use std::collections::{BTreeSet, HashMap};

use crate::conf::{JobDefinition, PipelineDefinition};
use crate::error::GraphError;


#[derive(Debug, Clone)]
pub struct JobGraph {
    jobs: Vec<JobDefinition>,
    index: HashMap<String, usize>,
    /// `job → its dependencies`, in `depends_on` order
    upstream: Vec<Vec<usize>>,
    /// `job → jobs depending on it`, in declaration order
    downstream: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl JobGraph {
    pub fn build(definition: &PipelineDefinition) -> Result<Self, GraphError> {
        let jobs = definition.jobs.clone();
        let mut index = HashMap::with_capacity(jobs.len());
        for (i, job) in jobs.iter().enumerate() {
            if index.insert(job.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateJob {
                    job: job.name.clone(),
                });
            }
        }

        let mut upstream = vec![Vec::new(); jobs.len()];
        let mut downstream = vec![Vec::new(); jobs.len()];
        for (i, job) in jobs.iter().enumerate() {
            for dep in &job.depends_on {
                let d = *index.get(dep).ok_or_else(|| GraphError::UnknownJob {
                    job: job.name.clone(),
                    dependency: dep.clone(),
                })?;
                if !upstream[i].contains(&d) {
                    upstream[i].push(d);
                    downstream[d].push(i);
                }
            }
            for target in &job.actions {
                if !definition.targets.contains_key(target) {
                    return Err(GraphError::UnknownTarget {
                        job: job.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        let mut graph = JobGraph {
            jobs,
            index,
            upstream,
            downstream,
            order: vec![],
        };
        graph.order = graph.kahn()?;
        Ok(graph)
    }

    fn kahn(&self) -> Result<Vec<usize>, GraphError> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.jobs.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.jobs.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &d in &self.downstream[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.insert(d);
                }
            }
        }
        if order.len() < self.jobs.len() {
            let stuck: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
            return Err(GraphError::CyclicDependency {
                cycle: self.find_cycle(&stuck),
            });
        }
        Ok(order)
    }

    /// DFS over the jobs Kahn could not order, following `depends_on` edges.
    /// Every such job either sits on a cycle or depends on one, so a walk from
    /// any of them ends on a job already on the stack.
    fn find_cycle(&self, stuck: &[bool]) -> Vec<String> {
        let start = stuck.iter().position(|&s| s).unwrap_or(0);
        let mut stack = vec![start];
        let mut on_stack = vec![false; self.jobs.len()];
        on_stack[start] = true;
        while let Some(&current) = stack.last() {
            let next = self.upstream[current].iter().copied().find(|&u| stuck[u]);
            match next {
                Some(n) if on_stack[n] => {
                    let from = stack.iter().position(|&s| s == n).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[from..]
                        .iter()
                        .map(|&i| self.jobs[i].name.clone())
                        .collect();
                    cycle.push(self.jobs[n].name.clone());
                    return cycle;
                }
                Some(n) => {
                    on_stack[n] = true;
                    stack.push(n);
                }
                None => break,
            }
        }
        vec![self.jobs[start].name.clone()]
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs in declaration order
    pub fn jobs(&self) -> &[JobDefinition] {
        &self.jobs
    }

    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.index.get(name).map(|&i| &self.jobs[i])
    }

    pub fn topological_order(&self) -> Vec<&JobDefinition> {
        self.order.iter().map(|&i| &self.jobs[i]).collect()
    }

    /// Jobs without dependencies, in declaration order
    pub fn roots(&self) -> Vec<&str> {
        self.upstream
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_empty())
            .map(|(i, _)| self.jobs[i].name.as_str())
            .collect()
    }

    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.names_of(self.index.get(name).map(|&i| &self.upstream[i]))
    }

    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.names_of(self.index.get(name).map(|&i| &self.downstream[i]))
    }

    fn names_of(&self, indices: Option<&Vec<usize>>) -> Vec<&str> {
        indices
            .map(|v| v.iter().map(|&i| self.jobs[i].name.as_str()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn upstream_of(&self, i: usize) -> &[usize] {
        &self.upstream[i]
    }

    pub(crate) fn downstream_of(&self, i: usize) -> &[usize] {
        &self.downstream[i]
    }
}
