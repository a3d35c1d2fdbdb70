use anyhow::Result;
use url::Url;

use super::driver::MemoryDriver;
use crate::environment::Environment;
use crate::storage::{ConfigItem, DriverBox, DriverConfig, DriverFactory};

/// Memory driver factory / 内存驱动工厂
pub struct MemoryDriverFactory;

impl DriverFactory for MemoryDriverFactory {
    fn driver_type(&self) -> &'static str {
        "mem"
    }

    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            name: "Memory".to_string(),
            description: "Process-local store, emptied when the bucket is dropped".to_string(),
            requires_bucket: false,
        }
    }

    fn additional_items(&self) -> Vec<ConfigItem> {
        Vec::new()
    }

    fn create_driver(&self, _url: &Url, _env: &Environment) -> Result<DriverBox> {
        tracing::debug!("Memory driver initialized");
        Ok(Box::new(MemoryDriver::new()))
    }
}
