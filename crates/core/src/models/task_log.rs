use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 任务日志条目，插入后不再修改
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLogEntry {
    pub id: i64,
    pub task_id: i64,
    pub log_type: TaskLogLevel,
    pub logged_at: DateTime<Utc>,
    /// 产生日志的 logger(tracing target)
    pub name: String,
    pub message: String,
    /// 事件附带的结构化字段
    pub info: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTaskLogEntry {
    pub task_id: i64,
    pub log_type: TaskLogLevel,
    pub logged_at: DateTime<Utc>,
    pub name: String,
    pub message: String,
    pub info: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskLogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl TaskLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskLogLevel::Debug => "debug",
            TaskLogLevel::Info => "info",
            TaskLogLevel::Warning => "warning",
            TaskLogLevel::Error => "error",
            TaskLogLevel::Critical => "critical",
        }
    }
}

impl From<&tracing::Level> for TaskLogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => TaskLogLevel::Error,
            tracing::Level::WARN => TaskLogLevel::Warning,
            tracing::Level::INFO => TaskLogLevel::Info,
            _ => TaskLogLevel::Debug,
        }
    }
}

impl fmt::Display for TaskLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(TaskLogLevel::Debug),
            "info" => Ok(TaskLogLevel::Info),
            "warning" => Ok(TaskLogLevel::Warning),
            "error" => Ok(TaskLogLevel::Error),
            "critical" => Ok(TaskLogLevel::Critical),
            _ => Err(format!("Invalid task log level: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskLogLevel {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskLogLevel {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(s.parse::<TaskLogLevel>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskLogLevel {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_level_mapping() {
        assert_eq!(TaskLogLevel::from(&tracing::Level::ERROR), TaskLogLevel::Error);
        assert_eq!(TaskLogLevel::from(&tracing::Level::WARN), TaskLogLevel::Warning);
        assert_eq!(TaskLogLevel::from(&tracing::Level::INFO), TaskLogLevel::Info);
        assert_eq!(TaskLogLevel::from(&tracing::Level::TRACE), TaskLogLevel::Debug);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("critical".parse::<TaskLogLevel>().unwrap(), TaskLogLevel::Critical);
        assert!("fatal".parse::<TaskLogLevel>().is_err());
    }
}
