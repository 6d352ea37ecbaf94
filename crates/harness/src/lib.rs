pub mod fixtures;
pub mod store;

pub use store::{test_builder, test_config, EventLog, TestStore};
