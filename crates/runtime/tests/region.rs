//! End-to-end cycles of a small region hosted by a [`RegionService`].
//!
//! The graph is `source -> map -> sink`, or a trigger fanning out to two
//! sinks.  Markers are routed synchronously: an operator's [`MarkerSink`]
//! calls `receive` on the downstream coordinators.

use anyhow::{bail, Result as AnyResult};
use cregion::{
    ControlPlane, DrainResult, LocalControlPlane, Marker, MarkerSink, NotificationHub,
    OperatorRegionInfo, PortInfo, RegionCoordinator, RegionService, StateHandler,
};
use cregion_store::{checkpoint_key, MemoryStore};
use cregion_types::config::{DispatcherConfig, RegionConfig, RuntimeConfig, TriggerConfig};
use cregion_types::{RegionIndex, ResetAttempt, SequenceId};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_test_logger() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap(),
        )
        .try_init();
}

/// Remembers what the runtime asked of it.
#[derive(Default)]
struct Recorder {
    checkpoints: Mutex<Vec<SequenceId>>,
    restores: Mutex<Vec<SequenceId>>,
    region_checkpoints: Mutex<Vec<SequenceId>>,
    fail_next_checkpoint: AtomicBool,
}

impl Recorder {
    fn checkpoints(&self) -> Vec<SequenceId> {
        self.checkpoints.lock().unwrap().clone()
    }

    fn restores(&self) -> Vec<SequenceId> {
        self.restores.lock().unwrap().clone()
    }
}

impl StateHandler for Recorder {
    fn checkpoint(&self, seq: SequenceId) -> AnyResult<Vec<u8>> {
        if self.fail_next_checkpoint.swap(false, Ordering::AcqRel) {
            bail!("disk full");
        }
        self.checkpoints.lock().unwrap().push(seq);
        Ok(seq.to_le_bytes().to_vec())
    }

    fn reset(&self, seq: SequenceId, checkpoint: &[u8]) -> AnyResult<()> {
        assert_eq!(checkpoint, &seq.to_le_bytes()[..]);
        self.restores.lock().unwrap().push(seq);
        Ok(())
    }

    fn reset_to_initial_state(&self) -> AnyResult<()> {
        self.restores.lock().unwrap().push(0);
        Ok(())
    }

    fn region_checkpointed(&self, seq: SequenceId) -> AnyResult<()> {
        self.region_checkpoints.lock().unwrap().push(seq);
        Ok(())
    }
}

/// Delivers markers to the downstream operator, if there is one.
struct Route(Option<Arc<RegionCoordinator>>);

impl MarkerSink for Route {
    fn submit_marker(&self, _port: usize, marker: &Marker) -> AnyResult<()> {
        if let Some(downstream) = &self.0 {
            downstream.receive(0, 0, *marker)?;
        }
        Ok(())
    }
}

/// Delivers markers to several downstream operators and remembers them.
struct FanOut {
    downstream: Vec<Arc<RegionCoordinator>>,
    emitted: Mutex<Vec<Marker>>,
}

impl MarkerSink for FanOut {
    fn submit_marker(&self, _port: usize, marker: &Marker) -> AnyResult<()> {
        self.emitted.lock().unwrap().push(*marker);
        for downstream in &self.downstream {
            downstream.receive(0, 0, *marker)?;
        }
        Ok(())
    }
}

/// Counts checkpoint and reset completions on their way to the local
/// controller.
struct Counting {
    inner: Arc<LocalControlPlane>,
    completed: Mutex<Vec<SequenceId>>,
    resets: Mutex<Vec<(SequenceId, ResetAttempt)>>,
}

impl ControlPlane for Counting {
    fn drain(&self, region: RegionIndex, operator: &str, seq: SequenceId) -> AnyResult<()> {
        self.inner.drain(region, operator, seq)
    }

    fn reset(&self, region: RegionIndex, operator: &str) -> AnyResult<()> {
        self.inner.reset(region, operator)
    }

    fn checkpoint_completed(&self, region: RegionIndex, seq: SequenceId) -> AnyResult<()> {
        self.completed.lock().unwrap().push(seq);
        self.inner.checkpoint_completed(region, seq)
    }

    fn blocking_checkpoint_completed(&self, region: RegionIndex, seq: SequenceId) -> AnyResult<()> {
        self.inner.blocking_checkpoint_completed(region, seq)
    }

    fn reset_completed(
        &self,
        region: RegionIndex,
        seq: SequenceId,
        attempt: ResetAttempt,
    ) -> AnyResult<()> {
        self.resets.lock().unwrap().push((seq, attempt));
        self.inner.reset_completed(region, seq, attempt)
    }

    fn start_operator_subscribed(&self, region: RegionIndex) -> AnyResult<()> {
        self.inner.start_operator_subscribed(region)
    }
}

struct Pipeline {
    service: RegionService,
    control: Arc<Counting>,
    store: MemoryStore,
    source: Arc<RegionCoordinator>,
    handlers: [Arc<Recorder>; 3],
}

fn service(region: &RegionConfig) -> (RegionService, Arc<Counting>, MemoryStore) {
    let config = RuntimeConfig {
        dispatcher: DispatcherConfig {
            num_threads: 2,
            queue_capacity: 64,
        },
        store: None,
        regions: vec![region.clone()],
    };
    let store = MemoryStore::new();
    let hub = NotificationHub::new();
    let control = Arc::new(Counting {
        inner: LocalControlPlane::new(&config.regions, hub.clone()),
        completed: Mutex::new(Vec::new()),
        resets: Mutex::new(Vec::new()),
    });
    let service =
        RegionService::with_control_plane(config, Arc::new(store.clone()), hub, control.clone())
            .unwrap();
    (service, control, store)
}

fn pipeline(region: RegionConfig) -> Pipeline {
    let (mut service, control, store) = service(&region);

    let handlers: [Arc<Recorder>; 3] = Default::default();
    let trigger = region.trigger == TriggerConfig::OperatorDriven;
    let sink = service
        .add_operator(
            OperatorRegionInfo::new(2, "sink", &region)
                .with_inputs(vec![PortInfo::consistent(1)])
                .end(),
            handlers[2].clone(),
            Arc::new(Route(None)),
        )
        .unwrap();
    let map = service
        .add_operator(
            OperatorRegionInfo::new(1, "map", &region)
                .with_inputs(vec![PortInfo::consistent(1)])
                .with_outputs(1),
            handlers[1].clone(),
            Arc::new(Route(Some(sink))),
        )
        .unwrap();
    let source = service
        .add_operator(
            OperatorRegionInfo::new(0, "source", &region)
                .start(trigger)
                .with_outputs(1),
            handlers[0].clone(),
            Arc::new(Route(Some(map))),
        )
        .unwrap();
    service.start().unwrap();

    Pipeline {
        service,
        control,
        store,
        source,
        handlers,
    }
}

#[test]
fn operator_driven_cycles() {
    init_test_logger();
    let Pipeline {
        service,
        control,
        store,
        source,
        handlers,
    } = pipeline(RegionConfig::new(0));

    for _ in 0..5 {
        assert_eq!(source.make_consistent().unwrap(), DrainResult::Completed);
    }

    for handler in &handlers {
        assert_eq!(handler.checkpoints(), vec![1, 2, 3, 4, 5]);
    }
    // Only start operators learn that the whole region checkpointed.
    assert_eq!(
        *handlers[0].region_checkpoints.lock().unwrap(),
        vec![1, 2, 3, 4, 5]
    );
    assert!(handlers[1].region_checkpoints.lock().unwrap().is_empty());
    assert_eq!(*control.completed.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    let progress = control.inner.progress(0).unwrap();
    assert_eq!(progress.last_completed_seq, 5);
    assert_eq!(progress.current_seq, 6);
    assert_eq!(source.sequence_id(), 6);
    for operator in 0..3 {
        assert!(store.contains(&checkpoint_key(0, operator, 5)));
    }
    assert_eq!(service.aggregator(0).unwrap().latest_checkpoint_id(), 5);
    service.shutdown();
}

#[test]
fn failed_checkpoint_rolls_the_region_back() {
    init_test_logger();
    let Pipeline {
        service,
        control,
        source,
        handlers,
        ..
    } = pipeline(RegionConfig::new(0));

    assert_eq!(source.make_consistent().unwrap(), DrainResult::Completed);
    handlers[1].fail_next_checkpoint.store(true, Ordering::Release);
    assert_eq!(source.make_consistent().unwrap(), DrainResult::Failed);
    assert_eq!(*control.resets.lock().unwrap(), vec![(1, 0)]);
    for handler in &handlers {
        assert_eq!(handler.restores(), vec![1]);
    }
    let failure = service.aggregator(0).unwrap().last_failure().unwrap();
    assert_eq!(failure.error_code, "OperatorFailed");
    assert_eq!(failure.details, json!({"operator": "map", "seq": 2}));
    assert!(failure.message.contains("disk full"));

    // The cycle after the reset uses a fresh sequence id.
    assert_eq!(source.make_consistent().unwrap(), DrainResult::Completed);
    assert_eq!(*control.completed.lock().unwrap(), vec![1, 3]);
    assert_eq!(handlers[1].checkpoints(), vec![1, 3]);
    assert_eq!(control.inner.progress(0).unwrap().reset_attempt, 0);
    service.shutdown();
}

#[test]
fn periodic_cycles() {
    init_test_logger();
    let mut region = RegionConfig::new(0);
    region.trigger = TriggerConfig::Periodic { period_ms: 20 };
    let Pipeline {
        service,
        control,
        source,
        handlers,
        ..
    } = pipeline(region);

    for _ in 0..2 {
        assert_eq!(source.make_consistent().unwrap(), DrainResult::Completed);
    }
    let completed = control.completed.lock().unwrap().clone();
    assert!(completed.len() >= 2);
    assert_eq!(completed[..2].to_vec(), vec![1, 2]);
    assert!(handlers[2].checkpoints().starts_with(&[1, 2]));
    service.shutdown();
}

#[test]
fn trigger_fans_out_one_checkpoint_per_operator() {
    init_test_logger();
    let region = RegionConfig::new(0);
    let (mut service, control, store) = service(&region);
    let handlers: [Arc<Recorder>; 3] = Default::default();
    let sinks = (1..3)
        .map(|operator| {
            service
                .add_operator(
                    OperatorRegionInfo::new(operator, &format!("sink{operator}"), &region)
                        .with_inputs(vec![PortInfo::consistent(1)])
                        .end(),
                    handlers[operator].clone(),
                    Arc::new(Route(None)),
                )
                .unwrap()
        })
        .collect();
    let fan_out = Arc::new(FanOut {
        downstream: sinks,
        emitted: Mutex::new(Vec::new()),
    });
    let trigger = service
        .add_operator(
            OperatorRegionInfo::new(0, "trigger", &region)
                .start(true)
                .with_outputs(1),
            handlers[0].clone(),
            fan_out.clone(),
        )
        .unwrap();
    service.start().unwrap();

    for _ in 0..4 {
        assert_eq!(trigger.make_consistent().unwrap(), DrainResult::Completed);
    }
    fan_out.emitted.lock().unwrap().clear();
    control.completed.lock().unwrap().clear();

    assert_eq!(trigger.make_consistent().unwrap(), DrainResult::Completed);
    let drains: Vec<Marker> = fan_out
        .emitted
        .lock()
        .unwrap()
        .iter()
        .filter(|marker| matches!(marker, Marker::Drain { .. }))
        .copied()
        .collect();
    assert_eq!(drains, vec![Marker::Drain { seq: 5 }]);
    for (operator, handler) in handlers.iter().enumerate() {
        let fifth: Vec<SequenceId> = handler
            .checkpoints()
            .into_iter()
            .filter(|seq| *seq == 5)
            .collect();
        assert_eq!(fifth, vec![5], "operator {operator}");
        assert!(store.contains(&checkpoint_key(0, operator, 5)));
    }
    assert_eq!(*control.completed.lock().unwrap(), vec![5]);
    assert_eq!(*handlers[0].region_checkpoints.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    service.shutdown();
}
