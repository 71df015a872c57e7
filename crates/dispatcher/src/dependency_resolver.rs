use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use qtask_core::{models::ChildResolution, traits::TaskRepository, QueueResult};

const DEFAULT_BATCH_SIZE: i64 = 100;

/// 父子依赖的补偿处理
///
/// 正常情况下父任务进入终态时，存储已在同一事务内处理了子任务；
/// 这里只处理仍然遗留的 `blocked` 子任务，例如由外部直接修改过的记录。
pub struct DependencyResolver {
    tasks: Arc<dyn TaskRepository>,
    batch_size: i64,
}

impl DependencyResolver {
    pub fn new(tasks: Arc<dyn TaskRepository>) -> Self {
        Self {
            tasks,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// 处理一批已结束但仍有阻塞子任务的父任务
    pub async fn reconcile(&self) -> QueueResult<ChildResolution> {
        let parents = self.tasks.find_unresolved_parents(self.batch_size).await?;
        let mut merged = ChildResolution::default();

        for parent_id in parents {
            match self.tasks.resolve_children(parent_id).await {
                Ok(resolution) => {
                    debug!(
                        parent_id,
                        "补偿处理子任务: 解除阻塞 {:?}, 取消 {:?}",
                        resolution.unblocked,
                        resolution.cancelled
                    );
                    merged.unblocked.extend(resolution.unblocked);
                    merged.cancelled.extend(resolution.cancelled);
                }
                Err(e) => warn!(parent_id, "处理子任务失败: {}", e),
            }
        }

        Ok(merged)
    }

    /// 深度优先列出任务的全部后代ID
    pub async fn descendants(&self, root: i64) -> QueueResult<Vec<i64>> {
        let mut visited = HashSet::from([root]);
        let mut ordered = Vec::new();
        let mut stack: Vec<i64> = self.child_ids(root).await?.into_iter().rev().collect();

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            ordered.push(id);
            stack.extend(self.child_ids(id).await?.into_iter().rev());
        }

        Ok(ordered)
    }

    async fn child_ids(&self, parent_id: i64) -> QueueResult<Vec<i64>> {
        Ok(self
            .tasks
            .list_children(parent_id)
            .await?
            .into_iter()
            .map(|task| task.id)
            .collect())
    }
}
