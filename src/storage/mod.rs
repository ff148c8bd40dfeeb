pub mod memory;

pub use memory::{InMemoryStorage, LockAttempt, RowKey, Write};
