//! Event bus selection.
//!
//! [`EventBusFactory`] builds the bus matching the configured deployment mode
//! and hands out the same instance until it is shut down. Applications create
//! one factory at startup and pass it (or the bus) to the components that
//! publish or subscribe.

use crate::bus::{EventBus, EventBusError, EventBusResult};
use crate::config::{DeploymentMode, EventBusConfig};
use crate::in_process::InProcessBus;
use std::sync::Arc;
use tokio::sync::Mutex;

#[cfg(feature = "distributed")]
use crate::broker::Broker;
#[cfg(feature = "distributed")]
use crate::distributed::DistributedBus;

/// Creates and owns the process-wide event bus.
pub struct EventBusFactory {
    config: EventBusConfig,
    #[cfg(feature = "distributed")]
    broker: Option<Arc<dyn Broker>>,
    instance: Mutex<Option<Arc<dyn EventBus>>>,
}

impl std::fmt::Debug for EventBusFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusFactory")
            .field("mode", &self.config.mode)
            .finish()
    }
}

impl EventBusFactory {
    /// Create a factory for `config`.
    ///
    /// In microservices mode the broker client is built from the broker
    /// settings, which requires the `kafka` feature.
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config,
            #[cfg(feature = "distributed")]
            broker: None,
            instance: Mutex::new(None),
        }
    }

    /// Create a factory whose distributed bus uses `broker`.
    #[cfg(feature = "distributed")]
    pub fn with_broker(config: EventBusConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            config,
            broker: Some(broker),
            instance: Mutex::new(None),
        }
    }

    /// Configuration the factory builds from.
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// The event bus, created on first use.
    ///
    /// Every call returns the same instance until [`shutdown`](Self::shutdown).
    /// The configuration is validated before the first bus is built.
    ///
    /// # Returns
    ///
    /// The shared bus: [`InProcessBus`] in monolith mode, `DistributedBus` in
    /// microservices mode. `EventBusError::Configuration` when the settings are
    /// invalid or no broker is available.
    pub async fn get(&self) -> EventBusResult<Arc<dyn EventBus>> {
        let mut instance = self.instance.lock().await;
        if let Some(bus) = instance.as_ref() {
            return Ok(bus.clone());
        }

        self.config
            .validate()
            .map_err(|e| EventBusError::Configuration(e.to_string()))?;

        let bus = self.build()?;
        tracing::info!(
            mode = %self.config.mode,
            transport = bus.transport(),
            "Event bus created"
        );

        *instance = Some(bus.clone());
        Ok(bus)
    }

    /// Close the current bus, if any. A later [`get`](Self::get) builds a new one.
    pub async fn shutdown(&self) -> EventBusResult<()> {
        let bus = self.instance.lock().await.take();
        match bus {
            Some(bus) => bus.close().await,
            None => Ok(()),
        }
    }

    fn build(&self) -> EventBusResult<Arc<dyn EventBus>> {
        match self.config.mode {
            DeploymentMode::Monolith => Ok(Arc::new(InProcessBus::new())),
            DeploymentMode::Microservices => self.build_distributed(),
        }
    }

    #[cfg(feature = "distributed")]
    fn build_distributed(&self) -> EventBusResult<Arc<dyn EventBus>> {
        let broker = match &self.broker {
            Some(broker) => broker.clone(),
            None => self.default_broker()?,
        };
        Ok(Arc::new(DistributedBus::new(self.config.clone(), broker)))
    }

    #[cfg(not(feature = "distributed"))]
    fn build_distributed(&self) -> EventBusResult<Arc<dyn EventBus>> {
        Err(EventBusError::Configuration(
            "microservices mode requires the `distributed` feature".to_string(),
        ))
    }

    #[cfg(feature = "kafka")]
    fn default_broker(&self) -> EventBusResult<Arc<dyn Broker>> {
        let broker = crate::broker::KafkaBroker::new(self.config.broker.clone())?;
        Ok(Arc::new(broker))
    }

    #[cfg(all(feature = "distributed", not(feature = "kafka")))]
    fn default_broker(&self) -> EventBusResult<Arc<dyn Broker>> {
        Err(EventBusError::Configuration(
            "microservices mode needs a broker: enable the `kafka` feature or use EventBusFactory::with_broker".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monolith_returns_same_instance() {
        let factory = EventBusFactory::new(EventBusConfig::default());

        let first = factory.get().await.unwrap();
        let second = factory.get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.transport(), "in-process");
    }

    #[tokio::test]
    async fn test_shutdown_allows_fresh_instance() {
        let factory = EventBusFactory::new(EventBusConfig::default());
        let first = factory.get().await.unwrap();

        factory.shutdown().await.unwrap();
        factory.shutdown().await.unwrap();
        assert!(matches!(
            first.publish("file.uploaded", serde_json::json!({})).await,
            Err(EventBusError::Closed)
        ));

        let second = factory.get().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[cfg(feature = "distributed")]
    #[tokio::test]
    async fn test_microservices_uses_injected_broker() {
        let broker = Arc::new(crate::broker::MemoryBroker::new());
        let config = EventBusConfig::default().with_mode(DeploymentMode::Microservices);
        let factory = EventBusFactory::with_broker(config, broker);

        let bus = factory.get().await.unwrap();
        assert_eq!(bus.transport(), "distributed");
    }

    #[cfg(all(feature = "distributed", not(feature = "kafka")))]
    #[tokio::test]
    async fn test_microservices_without_broker_is_a_configuration_error() {
        let config = EventBusConfig::default().with_mode(DeploymentMode::Microservices);
        let factory = EventBusFactory::new(config);

        assert!(matches!(
            factory.get().await,
            Err(EventBusError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = EventBusConfig::default().with_mode(DeploymentMode::Microservices);
        config.broker.brokers.clear();
        let factory = EventBusFactory::new(config);

        assert!(matches!(
            factory.get().await,
            Err(EventBusError::Configuration(_))
        ));
    }
}
