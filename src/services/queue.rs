//! Priority queue: the read-side view over pending tasks.
//!
//! Ordering is `(priority, manual_rank nulls-last, created_at, id)`,
//! ascending and stable. A task is returnable only when every task it
//! depends on is DONE. `reorder` rewrites `manual_rank` only.

use std::sync::Arc;

use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Task, TaskStatus};
use crate::domain::ports::TaskRepository;

/// How far into the ordered pending set the dependency scan looks per call.
const SCAN_LIMIT: usize = 256;

/// Where to move a task within its priority bucket.
#[derive(Debug, Clone)]
pub enum ReorderAnchor {
    /// Ahead of everything in the bucket
    Top,
    Before(Uuid),
    After(Uuid),
}

#[derive(Clone)]
pub struct PriorityQueue {
    repo: Arc<dyn TaskRepository>,
}

impl PriorityQueue {
    pub fn new(repo: Arc<dyn TaskRepository>) -> Self {
        Self { repo }
    }

    /// The single highest-priority pending task (optionally of one type)
    /// whose dependencies are all DONE. Tasks with unsatisfied or missing
    /// dependencies are skipped, not errors.
    pub async fn next(&self, task_type: Option<&str>) -> DomainResult<Option<Task>> {
        let candidates = self.repo.list_pending_ordered(task_type, SCAN_LIMIT).await?;
        for task in candidates {
            if self.dependencies_satisfied(&task).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Like [`next`](Self::next), but for the dispatcher's `default` WIP
    /// bucket: skips task types that have their own configured bucket.
    pub async fn next_excluding_types(&self, excluded: &[String]) -> DomainResult<Option<Task>> {
        let candidates = self.repo.list_pending_ordered(None, SCAN_LIMIT).await?;
        for task in candidates {
            if excluded.contains(&task.task_type) {
                continue;
            }
            if self.dependencies_satisfied(&task).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Strict variant used by submitters: surfaces why a specific task is
    /// not runnable.
    pub async fn check_dependencies(&self, task: &Task) -> DomainResult<()> {
        let statuses = self.repo.statuses_of(&task.depends_on).await?;
        for dep in &task.depends_on {
            match statuses.get(dep) {
                Some(TaskStatus::Done) => {}
                _ => {
                    return Err(DomainError::Dependency {
                        task_id: task.id,
                        missing: *dep,
                    })
                }
            }
        }
        Ok(())
    }

    async fn dependencies_satisfied(&self, task: &Task) -> DomainResult<bool> {
        if task.depends_on.is_empty() {
            return Ok(true);
        }
        let statuses = self.repo.statuses_of(&task.depends_on).await?;
        Ok(task
            .depends_on
            .iter()
            .all(|dep| statuses.get(dep) == Some(&TaskStatus::Done)))
    }

    /// Move a pending task within its priority bucket by rewriting
    /// `manual_rank`. Priorities are never changed here.
    pub async fn reorder(&self, id: Uuid, anchor: ReorderAnchor) -> DomainResult<()> {
        let task = self
            .repo
            .get(id)
            .await?
            .ok_or(DomainError::TaskNotFound(id))?;
        let bucket = self.repo.pending_bucket(task.priority).await?;

        match anchor {
            ReorderAnchor::Top => {
                let min_rank = bucket.iter().filter_map(|t| t.manual_rank).min();
                let rank = min_rank.map_or(0, |min| min - 1);
                self.repo.set_manual_rank(id, Some(rank)).await
            }
            ReorderAnchor::Before(anchor_id) => {
                self.place_relative(&bucket, id, anchor_id, true).await
            }
            ReorderAnchor::After(anchor_id) => {
                self.place_relative(&bucket, id, anchor_id, false).await
            }
        }
    }

    async fn place_relative(
        &self,
        bucket: &[Task],
        id: Uuid,
        anchor_id: Uuid,
        before: bool,
    ) -> DomainResult<()> {
        let anchor_pos = bucket
            .iter()
            .position(|t| t.id == anchor_id)
            .ok_or(DomainError::TaskNotFound(anchor_id))?;

        // Neighbor on the side we are inserting toward, ignoring the task
        // being moved.
        let neighbor_rank = if before {
            bucket[..anchor_pos]
                .iter()
                .rev()
                .find(|t| t.id != id)
                .and_then(|t| t.manual_rank)
        } else {
            bucket[anchor_pos + 1..]
                .iter()
                .find(|t| t.id != id)
                .and_then(|t| t.manual_rank)
        };
        let anchor_rank = bucket[anchor_pos].manual_rank;

        let target = match (anchor_rank, neighbor_rank) {
            (Some(anchor), Some(neighbor)) => {
                let (lo, hi) = if before { (neighbor, anchor) } else { (anchor, neighbor) };
                if hi - lo >= 2 {
                    Some(lo + (hi - lo) / 2)
                } else {
                    None // no integer midpoint, renumber below
                }
            }
            (Some(anchor), None) => Some(if before { anchor - 1 } else { anchor + 1 }),
            // Anchor is unranked: renumber the bucket to make room.
            (None, _) => None,
        };

        if let Some(rank) = target {
            return self.repo.set_manual_rank(id, Some(rank)).await;
        }

        self.renumber_with_placement(bucket, id, anchor_id, before).await
    }

    /// Rewrite the whole bucket in tens, inserting the moved task next to
    /// its anchor.
    async fn renumber_with_placement(
        &self,
        bucket: &[Task],
        id: Uuid,
        anchor_id: Uuid,
        before: bool,
    ) -> DomainResult<()> {
        let mut order: Vec<Uuid> = bucket.iter().map(|t| t.id).filter(|t| *t != id).collect();
        let anchor_pos = order
            .iter()
            .position(|t| *t == anchor_id)
            .ok_or(DomainError::TaskNotFound(anchor_id))?;
        let insert_at = if before { anchor_pos } else { anchor_pos + 1 };
        order.insert(insert_at, id);

        for (idx, task_id) in order.iter().enumerate() {
            self.repo
                .set_manual_rank(*task_id, Some((idx as i64 + 1) * 10))
                .await?;
        }
        Ok(())
    }
}
