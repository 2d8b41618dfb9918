pub mod memory;
pub mod redis;
pub mod store;

pub use memory::{MemoryStore, UnavailableStore};
pub use redis::RedisManager;
pub use store::{CounterStore, SessionStore};
