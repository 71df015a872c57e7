pub mod app_config;
pub mod database;
pub mod observability;
pub mod queue;
pub mod scheduler;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use observability::ObservabilityConfig;
pub use queue::QueueConfig;
pub use scheduler::{ScheduledTaskConfig, SchedulerConfig};
