//! 父子任务依赖规则
//!
//! 这里只有纯函数，存储实现在各自的事务内调用它们(或等价的SQL)来决定子任务的状态。

use std::collections::HashSet;

use crate::models::TaskState;

/// 根据父任务状态决定新任务的初始状态
pub fn initial_state(parent_state: Option<TaskState>) -> TaskState {
    match parent_state {
        None | Some(TaskState::Done) => TaskState::Pending,
        Some(state) if state.cascades_cancellation() => TaskState::Cancelled,
        Some(_) => TaskState::Blocked,
    }
}

/// 父任务进入 `parent_state` 后，`blocked` 子任务应转换到的状态
pub fn blocked_child_transition(parent_state: TaskState) -> Option<TaskState> {
    match parent_state {
        TaskState::Done => Some(TaskState::Pending),
        TaskState::Failed | TaskState::Cancelled => Some(TaskState::Cancelled),
        _ => None,
    }
}

/// 深度优先收集 `root` 的全部后代(不含 `root`)
///
/// `children_of` 返回某个任务的直接子任务ID。出现环时每个节点只访问一次。
pub fn collect_descendants<F>(root: i64, mut children_of: F) -> Vec<i64>
where
    F: FnMut(i64) -> Vec<i64>,
{
    let mut visited = HashSet::from([root]);
    let mut ordered = Vec::new();
    let mut stack: Vec<i64> = children_of(root).into_iter().rev().collect();

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        ordered.push(id);
        stack.extend(children_of(id).into_iter().rev());
    }

    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_initial_state_follows_parent() {
        assert_eq!(initial_state(None), TaskState::Pending);
        assert_eq!(initial_state(Some(TaskState::Done)), TaskState::Pending);
        assert_eq!(initial_state(Some(TaskState::Pending)), TaskState::Blocked);
        assert_eq!(initial_state(Some(TaskState::Running)), TaskState::Blocked);
        assert_eq!(initial_state(Some(TaskState::Blocked)), TaskState::Blocked);
        assert_eq!(initial_state(Some(TaskState::Failed)), TaskState::Cancelled);
        assert_eq!(initial_state(Some(TaskState::Cancelled)), TaskState::Cancelled);
    }

    #[test]
    fn test_blocked_child_transition() {
        assert_eq!(blocked_child_transition(TaskState::Done), Some(TaskState::Pending));
        assert_eq!(blocked_child_transition(TaskState::Failed), Some(TaskState::Cancelled));
        assert_eq!(blocked_child_transition(TaskState::Running), None);
    }

    #[test]
    fn test_collect_descendants_depth_first() {
        // 1 -> (2, 3), 2 -> (4), 4 -> (5)
        let tree: HashMap<i64, Vec<i64>> =
            HashMap::from([(1, vec![2, 3]), (2, vec![4]), (4, vec![5])]);
        let descendants =
            collect_descendants(1, |id| tree.get(&id).cloned().unwrap_or_default());
        assert_eq!(descendants, vec![2, 4, 5, 3]);
    }

    #[test]
    fn test_collect_descendants_tolerates_cycles() {
        let tree: HashMap<i64, Vec<i64>> = HashMap::from([(1, vec![2]), (2, vec![1, 3])]);
        let descendants =
            collect_descendants(1, |id| tree.get(&id).cloned().unwrap_or_default());
        assert_eq!(descendants, vec![2, 3]);
    }
}
