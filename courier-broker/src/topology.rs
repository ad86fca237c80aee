use std::future::Future;
use std::time::Duration;

use courier_models::AddressableUnit;
use log::{error, info};

use crate::connection::ConnectionStrategy;
use crate::errors::{BrokerError, TopologyError, TopologyStep};
use crate::BrokerAdapter;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Declares, lists and deletes the units a broker needs before traffic
/// flows. Declaring is idempotent; deleting is only ever done on request.
///
/// Every broker round trip is bounded. A command that outlives the timeout
/// fails with a [`TopologyError`] naming the first step of that command;
/// adapters that bound each step report the exact one sooner.
pub struct TopologyService {
    adapter: Box<dyn BrokerAdapter>,
    timeout: Duration,
}

impl TopologyService {
    pub fn new<A>(adapter: A) -> Self
    where
        A: BrokerAdapter,
    {
        Self::from_boxed(Box::new(adapter))
    }

    pub fn from_boxed(adapter: Box<dyn BrokerAdapter>) -> Self {
        Self {
            adapter,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn declare_unit(&self, unit: &AddressableUnit) -> Result<(), BrokerError> {
        let result = match self.adapter.connect().await {
            Ok(()) => self.declare_bounded(unit).await,
            Err(err) => Err(err.into()),
        };
        self.release().await;

        match &result {
            Ok(()) => info!("Declared {}", unit),
            Err(err) => error!("Failed to declare {}: {}", unit, err),
        }
        result
    }

    /// Declare several units over one connection, stopping at the first
    /// failure.
    pub async fn declare_units(&self, units: &[AddressableUnit]) -> Result<(), BrokerError> {
        let result = self.declare_each(units).await;
        self.release().await;
        result
    }

    async fn declare_each(&self, units: &[AddressableUnit]) -> Result<(), BrokerError> {
        self.adapter.connect().await?;
        for unit in units {
            if let Err(err) = self.declare_bounded(unit).await {
                error!("Failed to declare {}: {}", unit, err);
                return Err(err);
            }
            info!("Declared {}", unit);
        }
        Ok(())
    }

    async fn declare_bounded(&self, unit: &AddressableUnit) -> Result<(), BrokerError> {
        let step = match unit {
            AddressableUnit::Topic(_) => TopologyStep::CreateTopic,
            AddressableUnit::Queue(binding) if binding.exchange.is_empty() => {
                TopologyStep::DeclareQueue
            }
            AddressableUnit::Queue(_) => TopologyStep::DeclareExchange,
        };
        self.bounded(step, unit, self.adapter.declare_unit(unit)).await
    }

    pub async fn list_units(&self) -> Result<Vec<String>, BrokerError> {
        let result = match self.adapter.connect().await {
            Ok(()) => match tokio::time::timeout(self.timeout, self.adapter.list_units()).await {
                Ok(listed) => listed,
                Err(_) => Err(BrokerError::BrokerUnavailable(format!(
                    "listing units got no answer within {:?}",
                    self.timeout
                ))),
            },
            Err(err) => Err(err.into()),
        };
        self.release().await;

        result.map_err(|err| match err {
            BrokerError::BrokerUnavailable(_) => err,
            other => BrokerError::BrokerUnavailable(other.to_string()),
        })
    }

    /// Remove a unit and anything queued in it.
    pub async fn delete_unit(&self, unit: &AddressableUnit) -> Result<(), BrokerError> {
        let step = match unit {
            AddressableUnit::Topic(_) => TopologyStep::DeleteTopic,
            AddressableUnit::Queue(_) => TopologyStep::DeleteQueue,
        };
        let result = match self.adapter.connect().await {
            Ok(()) => self.bounded(step, unit, self.adapter.delete_unit(unit)).await,
            Err(err) => Err(err.into()),
        };
        self.release().await;

        match &result {
            Ok(()) => info!("Deleted {}", unit),
            Err(err) => error!("Failed to delete {}: {}", unit, err),
        }
        result
    }

    /// Release a connection kept open by the persistent strategy.
    pub async fn close(&self) {
        self.adapter.close().await;
    }

    async fn bounded<F>(
        &self,
        step: TopologyStep,
        unit: &AddressableUnit,
        command: F,
    ) -> Result<(), BrokerError>
    where
        F: Future<Output = Result<(), BrokerError>>,
    {
        match tokio::time::timeout(self.timeout, command).await {
            Ok(result) => result,
            Err(_) => Err(TopologyError::new(
                step,
                unit.name(),
                format!("no answer from the broker within {:?}", self.timeout),
            )
            .into()),
        }
    }

    async fn release(&self) {
        if self.adapter.connection_strategy() == ConnectionStrategy::PerCall {
            self.adapter.close().await;
        }
    }
}
