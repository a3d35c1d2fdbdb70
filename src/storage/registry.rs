//! URL opener registry: maps URL schemes to driver factories / URL驱动注册表
//!
//! Factories are registered on a [`RegistryBuilder`] at startup; `build()`
//! freezes the set so lookups never need a lock. Tests swap a single scheme
//! with [`UrlOpenerRegistry::with_override`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use url::Url;

use super::{
    get_common_items, Bucket, ConfigItem, DriverConfig, DriverInfo, Error, PrefixedDriver, Result,
    StorageDriver,
};
use super::error::{classify, from_driver};
use crate::context::Context;
use crate::environment::Environment;

pub type DriverBox = Box<dyn StorageDriver>;

/// Driver factory trait / 驱动工厂 trait
pub trait DriverFactory: Send + Sync {
    /// URL scheme served by this factory / URL协议
    fn driver_type(&self) -> &'static str;

    /// Create a driver from an already validated URL. The common `prefix`
    /// parameter has been removed by the time the factory sees the URL.
    /// 创建驱动实例
    fn create_driver(&self, url: &Url, env: &Environment) -> anyhow::Result<DriverBox>;

    /// Return driver basic config / 返回驱动基本配置
    fn driver_config(&self) -> DriverConfig;

    /// Return driver specific query parameters / 返回驱动特有配置项
    fn additional_items(&self) -> Vec<ConfigItem>;

    /// Generate complete driver info (auto merge common + additional) / 生成完整的驱动信息
    fn driver_info(&self) -> DriverInfo {
        DriverInfo {
            scheme: self.driver_type().to_string(),
            common: get_common_items(),
            additional: self.additional_items(),
            config: self.driver_config(),
        }
    }
}

type FactoryMap = BTreeMap<String, Arc<dyn DriverFactory>>;

/// Mutable registration phase / 注册阶段
#[derive(Default)]
pub struct RegistryBuilder {
    factories: FactoryMap,
    env: Option<Environment>,
}

impl RegistryBuilder {
    /// Register driver factory; a later registration for the same scheme wins
    /// 注册驱动工厂
    pub fn register_factory(&mut self, factory: Box<dyn DriverFactory>) -> &mut Self {
        let scheme = factory.driver_type().to_string();
        if self.factories.insert(scheme.clone(), Arc::from(factory)).is_some() {
            tracing::warn!("Driver factory replaced: {}", scheme);
        } else {
            tracing::info!("Driver factory registered: {}", scheme);
        }
        self
    }

    /// Environment handed to factories; defaults to the process environment
    pub fn environment(&mut self, env: Environment) -> &mut Self {
        self.env = Some(env);
        self
    }

    /// Freeze the registry / 冻结注册表
    pub fn build(self) -> UrlOpenerRegistry {
        UrlOpenerRegistry {
            factories: Arc::new(self.factories),
            env: Arc::new(self.env.unwrap_or_else(Environment::from_process)),
        }
    }
}

/// Immutable scheme → factory map, cheap to clone and share / URL驱动注册表
#[derive(Clone)]
pub struct UrlOpenerRegistry {
    factories: Arc<FactoryMap>,
    env: Arc<Environment>,
}

impl UrlOpenerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Copy of this registry with `factory` serving its scheme / 替换单个协议
    pub fn with_override(&self, factory: Box<dyn DriverFactory>) -> Self {
        let mut factories = (*self.factories).clone();
        let scheme = factory.driver_type().to_string();
        tracing::debug!("Driver factory overridden: {}", scheme);
        factories.insert(scheme, Arc::from(factory));
        Self {
            factories: Arc::new(factories),
            env: self.env.clone(),
        }
    }

    /// Registered schemes, sorted / 已注册协议
    pub fn schemes(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn driver_infos(&self) -> Vec<DriverInfo> {
        self.factories.values().map(|f| f.driver_info()).collect()
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Open a bucket from a URL such as `file:///srv/blobs?create_dir=true`
    /// 根据URL打开存储桶
    pub async fn open_bucket(&self, ctx: &Context, url: &str) -> Result<Bucket> {
        ctx.check()?;
        let parsed = Url::parse(url)
            .map_err(|e| Error::invalid_argument(format!("open bucket {:?}: {}", url, e)))?;
        let scheme = parsed.scheme();
        let factory = self.factories.get(scheme).ok_or_else(|| {
            Error::invalid_argument(format!(
                "open bucket {:?}: no driver registered for scheme {:?}; known schemes: {}",
                url,
                scheme,
                self.schemes().join(", ")
            ))
        })?;

        let info = factory.driver_info();
        let mut seen = HashSet::new();
        let mut prefix = None;
        let mut passed = Vec::new();
        for (name, value) in parsed.query_pairs() {
            if !info.accepts_param(&name) {
                return Err(Error::invalid_argument(format!(
                    "open bucket {:?}: unknown query parameter {:?} for scheme {:?}",
                    url, name, scheme
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(Error::invalid_argument(format!(
                    "open bucket {:?}: query parameter {:?} given more than once",
                    url, name
                )));
            }
            if name == "prefix" {
                prefix = Some(value.into_owned());
            } else {
                passed.push((name.into_owned(), value.into_owned()));
            }
        }
        if let Some(missing) = info
            .additional
            .iter()
            .find(|item| item.required && !seen.contains(&item.name))
        {
            return Err(Error::invalid_argument(format!(
                "open bucket {:?}: missing required query parameter {:?}",
                url, missing.name
            )));
        }
        if info.config.requires_bucket && parsed.host_str().map_or(true, str::is_empty) {
            return Err(Error::invalid_argument(format!(
                "open bucket {:?}: {} URLs need a bucket name",
                url, scheme
            )));
        }

        let mut driver_url = parsed.clone();
        driver_url.set_query(None);
        if !passed.is_empty() {
            driver_url.query_pairs_mut().extend_pairs(passed.iter());
        }

        let driver = factory.create_driver(&driver_url, &self.env).map_err(|e| {
            let kind = classify(&e);
            from_driver(e, kind).context(format!("open bucket {:?}", url))
        })?;
        let driver: DriverBox = match prefix {
            Some(prefix) if !prefix.is_empty() => Box::new(PrefixedDriver::new(prefix, driver)),
            _ => driver,
        };
        tracing::info!("Bucket opened: {} ({})", scheme, driver_url.path());
        Ok(Bucket::new(driver))
    }
}
