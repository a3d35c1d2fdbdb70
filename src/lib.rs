//! Provider-agnostic blob storage / 通用对象存储
//!
//! Open a [`storage::Bucket`] from a URL through a [`storage::UrlOpenerRegistry`],
//! then read, write, list, copy and sign objects without caring which backend
//! holds them.

pub mod config;
pub mod context;
pub mod environment;
pub mod logging;
pub mod storage;
pub mod utils;

// Driver modules (point to project root drivers via path attribute) / 驱动模块
#[path = "../drivers/mod.rs"]
pub mod drivers;

pub use context::Context;
pub use drivers::default_registry;
pub use environment::Environment;
