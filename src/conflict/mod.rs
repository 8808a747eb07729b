//! Conflict detection for parallel agent groups.
//!
//! Two groups conflict when their `conflict_paths` could touch a common
//! file. Conflicts are transitive for scheduling purposes: groups are
//! clustered into connected components, and each component runs as one
//! serial lane while distinct lanes run side by side.

mod glob_overlap;
mod union_find;

pub use glob_overlap::PathGlob;

use crate::config::BroadPolicy;
use crate::errors::{PhaseGateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use union_find::UnionFind;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub group_id: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub agents: Vec<String>,
    pub conflict_paths: Vec<String>,
    #[serde(default = "default_true")]
    pub can_parallel: bool,
    /// Lower runs first within a lane; ties keep input order.
    #[serde(default)]
    pub priority: i32,
}

/// A direct overlap between two groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEdge {
    pub first: String,
    pub second: String,
    pub first_pattern: String,
    pub second_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadDeclaration {
    pub group_id: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Lanes that may run concurrently; each lane runs its groups in order.
    pub parallel_batches: Vec<Vec<String>>,
    /// Groups run one at a time after every lane finished.
    pub exclusive: Vec<String>,
    pub overly_broad: Vec<BroadDeclaration>,
    pub conflicts: Vec<ConflictEdge>,
}

impl ExecutionPlan {
    /// Every scheduled group id, lanes first.
    pub fn scheduled(&self) -> impl Iterator<Item = &str> {
        self.parallel_batches
            .iter()
            .flatten()
            .chain(self.exclusive.iter())
            .map(String::as_str)
    }
}

struct CompiledGroup<'a> {
    group: &'a ParallelGroup,
    index: usize,
    globs: Vec<PathGlob>,
    broad: Option<String>,
}

impl CompiledGroup<'_> {
    /// The first pair of patterns through which the two groups overlap.
    fn overlap_with(&self, other: &CompiledGroup<'_>) -> Option<(String, String)> {
        self.globs.iter().find_map(|a| {
            other
                .globs
                .iter()
                .find(|b| a.overlaps(b))
                .map(|b| (a.as_str().to_string(), b.as_str().to_string()))
        })
    }

    fn lane_eligible(&self) -> bool {
        self.group.can_parallel && self.broad.is_none()
    }

    fn order_key(&self) -> (i32, usize) {
        (self.group.priority, self.index)
    }
}

fn compile(index: usize, group: &ParallelGroup) -> Result<CompiledGroup<'_>> {
    let globs = group
        .conflict_paths
        .iter()
        .map(|p| PathGlob::parse(p))
        .collect::<Result<Vec<_>>>()?;
    let broad = globs
        .iter()
        .find(|g| g.is_overly_broad())
        .map(|g| g.as_str().to_string());
    Ok(CompiledGroup {
        group,
        index,
        globs,
        broad,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictPlanner {
    broad_policy: BroadPolicy,
}

impl ConflictPlanner {
    pub fn new(broad_policy: BroadPolicy) -> Self {
        Self { broad_policy }
    }

    pub fn plan(&self, groups: &[ParallelGroup]) -> Result<ExecutionPlan> {
        let mut seen = HashSet::new();
        for group in groups {
            if !seen.insert(group.group_id.as_str()) {
                return Err(PhaseGateError::DuplicateGroup {
                    group_id: group.group_id.clone(),
                });
            }
        }

        let compiled = groups
            .iter()
            .enumerate()
            .map(|(index, group)| compile(index, group))
            .collect::<Result<Vec<_>>>()?;

        let mut plan = ExecutionPlan::default();
        for c in &compiled {
            if let Some(pattern) = &c.broad {
                if self.broad_policy == BroadPolicy::Reject {
                    return Err(PhaseGateError::OverlyBroadDeclaration {
                        group_id: c.group.group_id.clone(),
                        pattern: pattern.clone(),
                    });
                }
                tracing::warn!(
                    "Group {} declares overly broad path {}; running it exclusively",
                    c.group.group_id,
                    pattern
                );
                plan.overly_broad.push(BroadDeclaration {
                    group_id: c.group.group_id.clone(),
                    pattern: pattern.clone(),
                });
            }
        }

        let mut components = UnionFind::new(compiled.len());
        for (i, a) in compiled.iter().enumerate() {
            for b in compiled.iter().skip(i + 1) {
                let Some((first_pattern, second_pattern)) = a.overlap_with(b) else {
                    continue;
                };
                plan.conflicts.push(ConflictEdge {
                    first: a.group.group_id.clone(),
                    second: b.group.group_id.clone(),
                    first_pattern,
                    second_pattern,
                });
                if a.lane_eligible() && b.lane_eligible() {
                    components.union(a.index, b.index);
                }
            }
        }

        // Lanes keyed by root, ordered by their first member's input position
        let mut lanes: BTreeMap<usize, Vec<&CompiledGroup<'_>>> = BTreeMap::new();
        let mut lane_order: Vec<usize> = Vec::new();
        let mut exclusive: Vec<&CompiledGroup<'_>> = Vec::new();
        for c in &compiled {
            if !c.lane_eligible() {
                exclusive.push(c);
                continue;
            }
            let root = components.find(c.index);
            let lane = lanes.entry(root).or_default();
            if lane.is_empty() {
                lane_order.push(root);
            }
            lane.push(c);
        }

        for root in lane_order {
            if let Some(mut lane) = lanes.remove(&root) {
                lane.sort_by_key(|c| c.order_key());
                plan.parallel_batches
                    .push(lane.iter().map(|c| c.group.group_id.clone()).collect());
            }
        }
        exclusive.sort_by_key(|c| c.order_key());
        plan.exclusive = exclusive
            .iter()
            .map(|c| c.group.group_id.clone())
            .collect();

        tracing::debug!(
            "Planned {} groups into {} lanes and {} exclusive",
            groups.len(),
            plan.parallel_batches.len(),
            plan.exclusive.len()
        );
        Ok(plan)
    }

    /// Whether `candidate` may start while `running` groups are in flight.
    pub fn check_admission(
        &self,
        running: &[ParallelGroup],
        candidate: &ParallelGroup,
    ) -> Result<()> {
        if running.iter().any(|r| r.group_id == candidate.group_id) {
            return Err(PhaseGateError::DuplicateGroup {
                group_id: candidate.group_id.clone(),
            });
        }

        let candidate_compiled = compile(0, candidate)?;
        if let (Some(pattern), BroadPolicy::Reject) =
            (&candidate_compiled.broad, self.broad_policy)
        {
            return Err(PhaseGateError::OverlyBroadDeclaration {
                group_id: candidate.group_id.clone(),
                pattern: pattern.clone(),
            });
        }

        let mut blocking = Vec::new();
        for (index, group) in running.iter().enumerate() {
            let other = compile(index + 1, group)?;
            let conflicts = !candidate_compiled.lane_eligible()
                || !other.lane_eligible()
                || candidate_compiled.overlap_with(&other).is_some();
            if conflicts {
                blocking.push(group.group_id.clone());
            }
        }

        if blocking.is_empty() {
            Ok(())
        } else {
            Err(PhaseGateError::ConflictDetected {
                candidate: candidate.group_id.clone(),
                running: blocking,
            })
        }
    }
}

#[cfg(test)]
mod tests;
