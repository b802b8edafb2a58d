//! Connection factory routing each scheme to a compiled-in driver.

use std::sync::Arc;

#[cfg(feature = "mysql")]
use dbsentinel_core::connection::mysql::MySqlConnectionFactory;
use dbsentinel_core::connection::{ConnectionFactory, ConnectionSource, PoolTarget};
use dbsentinel_core::{EngineType, MonitorError};

/// Factory over the drivers enabled in this build.
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverFactory {
    #[cfg(feature = "mysql")]
    mysql: MySqlConnectionFactory,
}

impl DriverFactory {
    /// Creates the factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when a driver for `engine` is compiled in.
    pub const fn supports(engine: EngineType) -> bool {
        match engine {
            EngineType::MySql => cfg!(feature = "mysql"),
            EngineType::Vertica => false,
        }
    }
}

impl ConnectionFactory for DriverFactory {
    fn create(&self, target: &PoolTarget) -> dbsentinel_core::Result<Arc<dyn ConnectionSource>> {
        let scheme = target.uri.scheme();
        match EngineType::from_scheme(scheme) {
            #[cfg(feature = "mysql")]
            Some(EngineType::MySql) => self.mysql.create(target),
            _ => Err(MonitorError::configuration(format!(
                "no driver for scheme '{scheme}' in this build"
            ))),
        }
    }
}
