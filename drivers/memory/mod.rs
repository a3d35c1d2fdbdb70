//! In-memory driver (`mem://`) / 内存驱动
//!
//! Objects live in a sorted map behind a lock. Each opened bucket gets its own
//! empty store; clones of one [`MemoryDriver`] share it.

pub mod driver;
pub mod factory;

pub use driver::MemoryDriver;
pub use factory::MemoryDriverFactory;
