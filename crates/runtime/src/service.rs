//! Wires the pieces of the runtime together for the operators hosted by one
//! process.

use crate::aggregator::RegionAggregator;
use crate::control::{ControlPlane, LocalControlPlane, Notification, NotificationHub};
use crate::coordinator::RegionCoordinator;
use crate::dispatcher::Dispatcher;
use crate::error::RegionError;
use crate::handler::{MarkerSink, StateHandler};
use crate::metrics::describe_region_metrics;
use crate::topology::OperatorRegionInfo;
use cregion_store::{io_runtime, CheckpointStore, MemoryStore, QuorumStore, StoreError};
use cregion_types::config::RuntimeConfig;
use cregion_types::error::ConfigError;
use cregion_types::{OperatorIndex, RegionIndex};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{info, warn};

/// The consistent-region runtime of one process.
///
/// Operators are added with [`add_operator`](Self::add_operator) before
/// [`start`](Self::start) is called.
pub struct RegionService {
    config: RuntimeConfig,
    store: Arc<dyn CheckpointStore>,
    dispatcher: Arc<Dispatcher>,
    hub: NotificationHub,
    control: Arc<dyn ControlPlane>,
    aggregators: BTreeMap<RegionIndex, Arc<RegionAggregator>>,
    coordinators: Vec<Arc<RegionCoordinator>>,

    /// Drives the replica connections of a [`QuorumStore`].  Declared last
    /// so that it outlives the store.
    io_runtime: Option<Runtime>,
}

impl RegionService {
    /// A runtime whose regions are controlled by a [`LocalControlPlane`].
    pub fn new(config: RuntimeConfig, store: Arc<dyn CheckpointStore>) -> Result<Self, RegionError> {
        let hub = NotificationHub::new();
        let control = LocalControlPlane::new(&config.regions, hub.clone());
        Self::with_control_plane(config, store, hub, control)
    }

    /// A runtime whose regions are controlled by `control`.  `hub` must be
    /// the hub `control` publishes its notifications to.
    pub fn with_control_plane(
        config: RuntimeConfig,
        store: Arc<dyn CheckpointStore>,
        hub: NotificationHub,
        control: Arc<dyn ControlPlane>,
    ) -> Result<Self, RegionError> {
        config.validate()?;
        describe_region_metrics();
        let dispatcher = Arc::new(Dispatcher::new(&config.dispatcher, store.clone())?);
        let aggregators = config
            .regions
            .iter()
            .map(|region| {
                let aggregator = RegionAggregator::new(
                    region.clone(),
                    dispatcher.clone(),
                    control.clone(),
                    hub.clone(),
                );
                (region.index, Arc::new(aggregator))
            })
            .collect();
        info!(
            regions = config.regions.len(),
            workers = config.dispatcher.num_threads,
            "consistent-region runtime created"
        );
        Ok(Self {
            config,
            store,
            dispatcher,
            hub,
            control,
            aggregators,
            coordinators: Vec::new(),
            io_runtime: None,
        })
    }

    /// Builds the store described by `config`: a [`QuorumStore`] if one is
    /// configured, otherwise a [`MemoryStore`].
    pub fn from_config(config: RuntimeConfig) -> Result<Self, RegionError> {
        config.validate()?;
        let Some(store_config) = config.store.clone() else {
            return Self::new(config, Arc::new(MemoryStore::new()));
        };
        let runtime = io_runtime(store_config.servers.len()).map_err(|error| StoreError::Io {
            server: store_config.store_name.clone(),
            kind: error.kind(),
            message: error.to_string(),
        })?;
        let store = QuorumStore::new(store_config, runtime.handle().clone())?;
        let mut service = Self::new(config, Arc::new(store))?;
        service.io_runtime = Some(runtime);
        Ok(service)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn control_plane(&self) -> &Arc<dyn ControlPlane> {
        &self.control
    }

    /// Makes `info.operator` a member of its region.
    pub fn add_operator(
        &mut self,
        info: OperatorRegionInfo,
        handler: Arc<dyn StateHandler>,
        sink: Arc<dyn MarkerSink>,
    ) -> Result<Arc<RegionCoordinator>, RegionError> {
        let aggregator = self
            .aggregators
            .get(&info.region)
            .ok_or_else(|| ConfigError::UnknownRegion {
                operator: info.name.clone(),
                region: info.region,
            })?
            .clone();
        aggregator.register_operator(info.operator, &info.name, info.non_blocking);
        let coordinator =
            RegionCoordinator::new(info, handler, sink, aggregator, self.dispatcher.clone());
        self.coordinators.push(coordinator.clone());
        Ok(coordinator)
    }

    pub fn coordinator(&self, operator: OperatorIndex) -> Option<&Arc<RegionCoordinator>> {
        self.coordinators
            .iter()
            .find(|coordinator| coordinator.operator() == operator)
    }

    pub fn aggregator(&self, region: RegionIndex) -> Option<&Arc<RegionAggregator>> {
        self.aggregators.get(&region)
    }

    /// Starts the event loops of start operators and tells the control
    /// plane that every region is listening.
    pub fn start(&self) -> Result<(), RegionError> {
        for coordinator in &self.coordinators {
            coordinator.start()?;
        }
        for aggregator in self.aggregators.values() {
            aggregator
                .start_operator_subscribed()
                .map_err(|error| RegionError::Handler {
                    operator: 0,
                    region: aggregator.index(),
                    seq: aggregator.latest_checkpoint_id(),
                    error: error.context("control plane rejected subscription"),
                })?;
        }
        info!(operators = self.coordinators.len(), "consistent-region runtime started");
        Ok(())
    }

    /// Hands a notification from an external controller to the start
    /// operators of `region`.  Returns how many received it.
    pub fn deliver(&self, region: RegionIndex, notification: Notification) -> usize {
        let delivered = self.hub.publish(region, notification);
        if delivered == 0 {
            warn!(region, "no start operator received {notification}");
        }
        delivered
    }

    /// Releases every waiting thread, stops the event loops and the
    /// dispatcher.
    pub fn shutdown(&self) {
        for coordinator in &self.coordinators {
            coordinator.prepare_to_shutdown();
        }
        for coordinator in &self.coordinators {
            coordinator.join();
        }
        self.dispatcher.shutdown();
        info!("consistent-region runtime stopped");
    }
}

impl Drop for RegionService {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(runtime) = self.io_runtime.take() {
            runtime.shutdown_background();
        }
    }
}
