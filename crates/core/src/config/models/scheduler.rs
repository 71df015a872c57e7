use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 周期任务调度配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub scheduled_tasks: Vec<ScheduledTaskConfig>,
}

/// 单个周期任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTaskConfig {
    /// 任务名称，同名任务未结束时不会重复创建
    pub name: String,
    /// CRON表达式(秒 分 时 日 月 周 [年])
    pub cron: String,
    /// 执行器注册表中的导入路径
    pub executable: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = std::collections::HashSet::new();
        for task in &self.scheduled_tasks {
            if task.name.trim().is_empty() {
                return Err(anyhow::anyhow!("周期任务名称不能为空"));
            }
            if task.executable.trim().is_empty() {
                return Err(anyhow::anyhow!("周期任务 {} 缺少可执行体", task.name));
            }
            if task.cron.trim().is_empty() {
                return Err(anyhow::anyhow!("周期任务 {} 缺少CRON表达式", task.name));
            }
            if !names.insert(task.name.as_str()) {
                return Err(anyhow::anyhow!("周期任务名称重复: {}", task.name));
            }
        }
        Ok(())
    }

    pub fn enabled_tasks(&self) -> impl Iterator<Item = &ScheduledTaskConfig> {
        self.scheduled_tasks.iter().filter(|task| task.enabled)
    }
}
