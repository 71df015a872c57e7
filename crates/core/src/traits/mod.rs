pub mod notifier;
pub mod repository;

pub use notifier::*;
pub use repository::*;
