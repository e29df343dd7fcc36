//! Built-in drivers and the catalog that starts them by configured type name.

pub mod dummy_detector;
pub mod dummy_motor;

pub use dummy_detector::DummyDetector;
pub use dummy_motor::DummyMotor;

use crate::config::DriverDefinition;
use crate::driver::Driver;
use crate::error::{AppResult, ProxyError};
use crate::server::{ProxyServer, ServerOptions};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Type-erased proxy server, so the launcher can run any catalog entry.
pub trait ProxyService: Send + Sync {
    /// Serve on `listener` until shutdown.
    fn serve(&self, listener: TcpListener) -> BoxFuture<'static, AppResult<()>>;

    /// Stop serving; see [`ProxyServer::shutdown`].
    fn shutdown(&self);

    /// Fingerprint of the served manifest.
    fn fingerprint(&self) -> String;
}

impl<D: Driver> ProxyService for ProxyServer<D> {
    fn serve(&self, listener: TcpListener) -> BoxFuture<'static, AppResult<()>> {
        let server = self.clone();
        Box::pin(async move { server.serve(listener).await })
    }

    fn shutdown(&self) {
        ProxyServer::shutdown(self);
    }

    fn fingerprint(&self) -> String {
        ProxyServer::fingerprint(self).to_string()
    }
}

type ServiceFactory =
    Arc<dyn Fn(&DriverDefinition, ServerOptions) -> AppResult<Box<dyn ProxyService>> + Send + Sync>;

/// Maps configured driver type names to server constructors.
#[derive(Clone)]
pub struct DriverCatalog {
    factories: HashMap<String, ServiceFactory>,
}

impl DriverCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Catalog with `DummyMotor` and `DummyDetector`.
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register_driver("DummyMotor", |_| DummyMotor::new());
        catalog.register_driver("DummyDetector", |_| DummyDetector::new());
        catalog
    }

    /// Register a constructor for `driver_type`, replacing any previous one.
    pub fn register_factory(&mut self, driver_type: &str, factory: ServiceFactory) {
        self.factories.insert(driver_type.to_string(), factory);
    }

    /// Register a driver type built by `make`.
    pub fn register_driver<D, F>(&mut self, driver_type: &str, make: F)
    where
        D: Driver,
        F: Fn(&DriverDefinition) -> D + Send + Sync + 'static,
    {
        self.register_factory(
            driver_type,
            Arc::new(move |definition: &DriverDefinition, options: ServerOptions| {
                let server = ProxyServer::new(make(definition), options)?;
                Ok(Box::new(server) as Box<dyn ProxyService>)
            }),
        );
    }

    /// Whether `driver_type` can be built.
    pub fn contains(&self, driver_type: &str) -> bool {
        self.factories.contains_key(driver_type)
    }

    /// Build the proxy server for `definition`.
    pub fn build(
        &self,
        definition: &DriverDefinition,
        options: ServerOptions,
    ) -> AppResult<Box<dyn ProxyService>> {
        let factory = self.factories.get(&definition.r#type).ok_or_else(|| {
            ProxyError::ConfigValidation(format!(
                "no driver registered for type '{}'",
                definition.r#type
            ))
        })?;
        factory(definition, options)
    }
}

impl Default for DriverCatalog {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KNOWN_DRIVER_TYPES;

    fn definition(kind: &str) -> DriverDefinition {
        DriverDefinition {
            name: "dev".into(),
            r#type: kind.into(),
            address: "127.0.0.1:0".into(),
            enabled: true,
        }
    }

    #[test]
    fn test_builtin_catalog_covers_known_types() {
        let catalog = DriverCatalog::with_builtin();
        for kind in KNOWN_DRIVER_TYPES {
            assert!(catalog.contains(kind), "{kind} missing from catalog");
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let catalog = DriverCatalog::with_builtin();
        assert!(catalog
            .build(&definition("MaiTai"), ServerOptions::default())
            .is_err());
    }

    #[test]
    fn test_services_have_distinct_fingerprints() {
        let catalog = DriverCatalog::with_builtin();
        let motor = catalog
            .build(&definition("DummyMotor"), ServerOptions::default())
            .unwrap();
        let detector = catalog
            .build(&definition("DummyDetector"), ServerOptions::default())
            .unwrap();
        assert_ne!(motor.fingerprint(), detector.fingerprint());
    }
}
