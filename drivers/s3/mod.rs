//! S3 driver (`s3blob://bucket`) / S3对象存储驱动
//!
//! Works with AWS and S3-compatible stores (MinIO, OSS, R2) through rust-s3.
//! Large objects go up as multipart uploads from a background task.

pub mod config;
pub mod driver;
pub mod factory;

pub use config::S3Config;
pub use driver::S3Driver;
pub use factory::S3DriverFactory;
