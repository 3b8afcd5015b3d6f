//! LM request broker: Redis stream transport and the worker pool.

pub mod stream;
pub mod worker;

pub use stream::{RedisLmBroker, StreamConfig};
pub use worker::{LmWorkerConfig, LmWorkerPool};
