//! Local filesystem driver (`file://`) / 本地文件系统驱动
//!
//! Keys map to files under the root directory. Writes land in a temp file
//! next to the target and are renamed over it on commit, so readers never
//! see partial content. Attributes are kept in a `<file>.attrs` JSON sidecar.

pub mod driver;
pub mod factory;

pub use driver::LocalDriver;
pub use factory::LocalDriverFactory;
