pub mod in_memory_notifier;
pub mod pg_notifier;

pub use in_memory_notifier::InMemoryNotifier;
pub use pg_notifier::PgNotifier;
