pub mod memory;

pub use memory::{MemoryStoreSink, StoreLoad};
