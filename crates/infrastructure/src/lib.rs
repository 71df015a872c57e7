pub mod database;
pub mod memory;
pub mod notifier;

pub use database::*;
pub use memory::*;
pub use notifier::*;
