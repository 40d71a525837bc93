//! # Query Lifecycle Integration Tests
//!
//! Register/start/stop/unregister flows, end-of-stream semantics per
//! termination kind, error isolation between queries, and the buffer-pool
//! accounting across a full query cycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::{
    input_schema, record, test_engine, wait_until, FailingStage, PassthroughStage, RecordingSink,
};

use tidal::infrastructure::runtime::executable_plan::{
    ExecutableQueryPlan, OperatorHandler, SinkId, SuccessorTarget,
};
use tidal::infrastructure::sources::data_source::{DataSource, SourceKind};
use tidal::infrastructure::sources::generator_source::GeneratorSource;
use tidal::infrastructure::sources::ingest_source::{IngestHandle, IngestSource};
use tidal::infrastructure::sources::managed_source::{ManagedSource, StopToken};
use tidal::{
    EngineError, ExecutionStatus, NodeEngine, OriginId, PipelineId, QueryId, TerminationKind,
};
use tidal_domain::ReconfigurationType;

/// A passthrough plan `ingest -> pipeline -> sink` on `engine`.
fn deploy_passthrough(
    engine: &Arc<NodeEngine>,
    query_raw: u64,
) -> (QueryId, IngestHandle, Arc<RecordingSink>, Arc<ExecutableQueryPlan>) {
    let schema = input_schema();
    let buffer_size = engine.config().buffer_size_bytes;
    let query_id = QueryId::new(query_raw).unwrap();
    let origin = OriginId::new(query_raw * 10).unwrap();
    let pipeline = PipelineId::new(1).unwrap();
    let sink = RecordingSink::new(&schema, buffer_size);

    let plan = engine
        .plan_builder(query_id)
        .add_source(origin, vec![SuccessorTarget::Pipeline(pipeline)])
        .add_pipeline(pipeline, Arc::new(PassthroughStage), vec![SuccessorTarget::Sink(SinkId(1))], vec![])
        .add_sink(SinkId(1), sink.clone())
        .build()
        .unwrap();

    let (source, handle) = IngestSource::create(&schema, buffer_size, 2).unwrap();
    let runner = engine
        .create_source_runner(origin, Box::new(source), &plan, 0)
        .unwrap();
    engine
        .register_query(Arc::clone(&plan), vec![runner as Arc<dyn ManagedSource>])
        .unwrap();
    (query_id, handle, sink, plan)
}

/// Tests the full graceful cycle: data flows, the stream ends, the query
/// reaches `Stopped`, and no further work is dispatched.
#[test]
fn test_graceful_lifecycle_end_to_end() {
    let engine = test_engine(2);
    let (query_id, handle, sink, _plan) = deploy_passthrough(&engine, 1);
    engine.start_query(query_id).unwrap();

    handle.push(vec![record(1, 10, 1), record(2, 20, 2)]).unwrap();
    handle.push(vec![record(1, 30, 3)]).unwrap();
    handle.finish();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query_id) == Some(ExecutionStatus::Stopped)
    }));
    // In dynamic mode the sink's last write may race its termination across
    // workers; rows settle right after.
    assert!(wait_until(Duration::from_secs(2), || sink.rows().len() == 3));
    assert_eq!(sink.eos_calls(), 1);
    assert_eq!(sink.eos_kinds(), vec![TerminationKind::Graceful]);

    // Explicit stop after natural completion stays a no-op.
    engine.stop_query(query_id, TerminationKind::Graceful).unwrap();
    engine.unregister_query(query_id).unwrap();
    engine.shutdown();
}

/// Registering and unregistering a never-started plan restores prior state.
#[test]
fn test_register_unregister_round_trip() {
    let engine = test_engine(1);
    let available_before = engine.buffer_manager().available_buffers();
    let (query_id, _handle, sink, _plan) = deploy_passthrough(&engine, 1);

    assert_eq!(engine.query_status(query_id), Some(ExecutionStatus::Registered));
    engine.unregister_query(query_id).unwrap();
    assert_eq!(engine.query_status(query_id), None);
    assert!(sink.rows().is_empty());

    // The origin is free again: the same plan registers a second time.
    let (query_id, _handle, _sink, _plan) = deploy_passthrough(&engine, 1);
    engine.unregister_query(query_id).unwrap();

    // Runner pools were never created (no start), the global pool is whole.
    assert!(wait_until(Duration::from_secs(2), || {
        engine.buffer_manager().available_buffers() == available_before
    }));
    engine.shutdown();
}

/// Double stop is a no-op returning success.
#[test]
fn test_double_stop_is_noop() {
    let engine = test_engine(1);
    let (query_id, handle, _sink, _plan) = deploy_passthrough(&engine, 1);
    engine.start_query(query_id).unwrap();
    handle.finish();

    engine.stop_query(query_id, TerminationKind::Graceful).unwrap();
    assert_eq!(engine.query_status(query_id), Some(ExecutionStatus::Stopped));
    engine.stop_query(query_id, TerminationKind::Graceful).unwrap();
    engine.stop_query(query_id, TerminationKind::Hard).unwrap();
    engine.shutdown();
}

/// Hard stop during production: returns promptly, exactly one hard EoS per
/// successor, status `Stopped`.
#[test]
fn test_hard_stop_during_production() {
    let engine = test_engine(2);
    let schema = input_schema();
    let buffer_size = engine.config().buffer_size_bytes;
    let query_id = QueryId::new(4).unwrap();
    let origin = OriginId::new(40).unwrap();
    let pipeline = PipelineId::new(1).unwrap();
    let sink = RecordingSink::new(&schema, buffer_size);

    let plan = engine
        .plan_builder(query_id)
        .add_source(origin, vec![SuccessorTarget::Pipeline(pipeline)])
        .add_pipeline(pipeline, Arc::new(PassthroughStage), vec![SuccessorTarget::Sink(SinkId(1))], vec![])
        .add_sink(SinkId(1), sink.clone())
        .build()
        .unwrap();

    // One buffer per millisecond, unbounded.
    let generator = GeneratorSource::new(
        &schema,
        buffer_size,
        4,
        2,
        Duration::from_millis(1),
        Box::new(|i| record(i % 2, 1, i)),
    )
    .unwrap();
    let runner = engine.create_source_runner(origin, Box::new(generator), &plan, 0).unwrap();
    engine
        .register_query(Arc::clone(&plan), vec![runner as Arc<dyn ManagedSource>])
        .unwrap();
    engine.start_query(query_id).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let begin = Instant::now();
    engine.stop_query(query_id, TerminationKind::Hard).unwrap();
    let stop_latency = begin.elapsed();

    assert!(stop_latency < Duration::from_secs(2), "hard stop took {stop_latency:?}");
    assert_eq!(engine.query_status(query_id), Some(ExecutionStatus::Stopped));
    assert_eq!(sink.eos_calls(), 1, "exactly one hard EoS per successor");
    assert_eq!(sink.eos_kinds(), vec![TerminationKind::Hard]);
    engine.unregister_query(query_id).unwrap();
    engine.shutdown();
}

/// A source whose `open` fails: one error, query `Failed`, the other query
/// on the engine keeps running.
#[test]
fn test_source_open_failure_is_isolated() {
    struct BrokenSource;
    impl DataSource for BrokenSource {
        fn open(&mut self) -> Result<(), EngineError> {
            Err(EngineError::source_open("backing store unavailable"))
        }
        fn fill_buffer(
            &mut self,
            _buffer: &tidal::infrastructure::memory::tuple_buffer::TupleBuffer,
            _stop: &StopToken,
        ) -> Result<bool, EngineError> {
            Ok(false)
        }
        fn kind(&self) -> SourceKind {
            SourceKind::Ingest
        }
    }

    let engine = test_engine(2);
    let schema = input_schema();
    let buffer_size = engine.config().buffer_size_bytes;

    // The healthy query.
    let (healthy_id, healthy_handle, healthy_sink, _plan) = deploy_passthrough(&engine, 1);
    engine.start_query(healthy_id).unwrap();

    // The failing query.
    let query_id = QueryId::new(5).unwrap();
    let origin = OriginId::new(50).unwrap();
    let pipeline = PipelineId::new(1).unwrap();
    let sink = RecordingSink::new(&schema, buffer_size);
    let plan = engine
        .plan_builder(query_id)
        .add_source(origin, vec![SuccessorTarget::Pipeline(pipeline)])
        .add_pipeline(pipeline, Arc::new(PassthroughStage), vec![SuccessorTarget::Sink(SinkId(1))], vec![])
        .add_sink(SinkId(1), sink.clone())
        .build()
        .unwrap();
    let runner = engine
        .create_source_runner(origin, Box::new(BrokenSource), &plan, 0)
        .unwrap();
    engine
        .register_query(Arc::clone(&plan), vec![runner as Arc<dyn ManagedSource>])
        .unwrap();
    engine.start_query(query_id).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query_id) == Some(ExecutionStatus::Failed)
    }));
    // The recorded error carries the original message.
    assert!(plan.error().unwrap().contains("backing store unavailable"));
    assert!(sink.rows().is_empty(), "a failed open produces no data");

    // The healthy query is untouched and still processes data.
    healthy_handle.push(vec![record(9, 9, 9)]).unwrap();
    assert!(wait_until(Duration::from_secs(5), || healthy_sink.rows().len() == 1));
    assert_eq!(engine.query_status(healthy_id), Some(ExecutionStatus::Running));

    healthy_handle.finish();
    engine.shutdown();
}

/// A failing stage converts into a failure end-of-stream for its query.
#[test]
fn test_stage_error_fails_query() {
    let engine = test_engine(1);
    let schema = input_schema();
    let buffer_size = engine.config().buffer_size_bytes;
    let query_id = QueryId::new(6).unwrap();
    let origin = OriginId::new(60).unwrap();
    let pipeline = PipelineId::new(1).unwrap();
    let sink = RecordingSink::new(&schema, buffer_size);
    let plan = engine
        .plan_builder(query_id)
        .add_source(origin, vec![SuccessorTarget::Pipeline(pipeline)])
        .add_pipeline(pipeline, Arc::new(FailingStage), vec![SuccessorTarget::Sink(SinkId(1))], vec![])
        .add_sink(SinkId(1), sink.clone())
        .build()
        .unwrap();
    let (source, handle) = IngestSource::create(&schema, buffer_size, 2).unwrap();
    let runner = engine.create_source_runner(origin, Box::new(source), &plan, 0).unwrap();
    engine
        .register_query(Arc::clone(&plan), vec![runner as Arc<dyn ManagedSource>])
        .unwrap();
    engine.start_query(query_id).unwrap();

    handle.push(vec![record(1, 1, 1)]).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query_id) == Some(ExecutionStatus::Failed)
    }));
    assert!(plan.error().unwrap().contains("deliberate stage failure"));
    engine.shutdown();
}

/// Duplicate origin ids across queries are rejected at registration.
#[test]
fn test_duplicate_origin_rejected() {
    let engine = test_engine(1);
    let schema = input_schema();
    let buffer_size = engine.config().buffer_size_bytes;
    let origin = OriginId::new(70).unwrap();

    let mut deploy = |query_raw: u64| -> Result<(), EngineError> {
        let query_id = QueryId::new(query_raw).unwrap();
        let pipeline = PipelineId::new(1).unwrap();
        let sink = RecordingSink::new(&schema, buffer_size);
        let plan = engine
            .plan_builder(query_id)
            .add_source(origin, vec![SuccessorTarget::Pipeline(pipeline)])
            .add_pipeline(pipeline, Arc::new(PassthroughStage), vec![SuccessorTarget::Sink(SinkId(1))], vec![])
            .add_sink(SinkId(1), sink)
            .build()?;
        let (source, _handle) = IngestSource::create(&schema, buffer_size, 2)?;
        let runner = engine.create_source_runner(origin, Box::new(source), &plan, 0)?;
        engine.register_query(plan, vec![runner as Arc<dyn ManagedSource>])
    };

    deploy(7).unwrap();
    let duplicate = deploy(8).unwrap_err();
    assert!(matches!(duplicate, EngineError::InvalidPlan(_)));
    engine.shutdown();
}

/// A reconfiguration broadcast reaches every worker exactly once and its
/// post callback runs exactly once.
#[test]
fn test_reconfiguration_once_per_worker() {
    struct CountingHandler {
        reconfigures: AtomicUsize,
        posts: AtomicUsize,
    }
    impl OperatorHandler for CountingHandler {
        fn reconfigure(&self, rtype: ReconfigurationType, _worker: tidal::WorkerThreadId) {
            if rtype == ReconfigurationType::SoftEndOfStream {
                self.reconfigures.fetch_add(1, Ordering::AcqRel);
            }
        }
        fn post_reconfiguration(
            &self,
            rtype: ReconfigurationType,
            _ctx: &mut tidal::infrastructure::runtime::pipeline_execution_context::PipelineExecutionContext<'_>,
        ) -> Result<(), EngineError> {
            if rtype == ReconfigurationType::SoftEndOfStream {
                self.posts.fetch_add(1, Ordering::AcqRel);
            }
            Ok(())
        }
        fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
            self
        }
    }

    let workers = 4;
    let engine = test_engine(workers);
    let schema = input_schema();
    let buffer_size = engine.config().buffer_size_bytes;
    let query_id = QueryId::new(9).unwrap();
    let origin = OriginId::new(90).unwrap();
    let pipeline = PipelineId::new(1).unwrap();
    let sink = RecordingSink::new(&schema, buffer_size);
    let handler = Arc::new(CountingHandler {
        reconfigures: AtomicUsize::new(0),
        posts: AtomicUsize::new(0),
    });

    let mut builder = engine.plan_builder(query_id);
    let handler_index = builder.add_operator_handler(handler.clone());
    let plan = builder
        .add_source(origin, vec![SuccessorTarget::Pipeline(pipeline)])
        .add_pipeline(
            pipeline,
            Arc::new(PassthroughStage),
            vec![SuccessorTarget::Sink(SinkId(1))],
            vec![handler_index],
        )
        .add_sink(SinkId(1), sink)
        .build()
        .unwrap();
    let (source, handle) = IngestSource::create(&schema, buffer_size, 2).unwrap();
    let runner = engine.create_source_runner(origin, Box::new(source), &plan, 0).unwrap();
    engine
        .register_query(Arc::clone(&plan), vec![runner as Arc<dyn ManagedSource>])
        .unwrap();
    engine.start_query(query_id).unwrap();

    handle.push(vec![record(1, 1, 1)]).unwrap();
    handle.finish();
    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query_id) == Some(ExecutionStatus::Stopped)
    }));

    assert_eq!(handler.reconfigures.load(Ordering::Acquire), workers);
    assert_eq!(handler.posts.load(Ordering::Acquire), 1);
    engine.shutdown();
}

/// Allocated minus released balances across a full start-stop-unregister
/// cycle: the global pool returns to its initial occupancy.
#[test]
fn test_no_buffer_leak_across_query_cycle() {
    let engine = test_engine(2);
    let baseline = engine.buffer_manager().available_buffers();

    let (query_id, handle, sink, _plan) = deploy_passthrough(&engine, 3);
    engine.start_query(query_id).unwrap();
    for batch in 0..10 {
        handle.push(vec![record(batch, batch as i64, batch)]).unwrap();
    }
    handle.finish();
    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query_id) == Some(ExecutionStatus::Stopped)
    }));
    assert!(wait_until(Duration::from_secs(2), || sink.rows().len() == 10));
    engine.unregister_query(query_id).unwrap();

    // Source-runner pools dissolve with the runner; give the driver a
    // moment to be joined and its buffers to flow back.
    assert!(
        wait_until(Duration::from_secs(5), || {
            engine.buffer_manager().available_buffers() == baseline
        }),
        "pool occupancy {} != baseline {baseline}",
        engine.buffer_manager().available_buffers()
    );

    // Statistics were released with the registration.
    assert!(engine.statistics(query_id).is_none());
    engine.shutdown();
}

/// The static queue mode (one queue per worker, routed by target) carries
/// the same lifecycle guarantees as the dynamic default.
#[test]
fn test_static_queue_mode_lifecycle() {
    use crate::common::test_config;
    use tidal::QueryManagerMode;

    let mut config = test_config(3);
    config.query_manager_mode = QueryManagerMode::Static;
    let engine = NodeEngine::start(config).unwrap();

    let (query_id, handle, sink, _plan) = deploy_passthrough(&engine, 1);
    engine.start_query(query_id).unwrap();
    handle.push(vec![record(1, 1, 1), record(2, 2, 2)]).unwrap();
    handle.push(vec![record(3, 3, 3)]).unwrap();
    handle.finish();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query_id) == Some(ExecutionStatus::Stopped)
    }));
    assert!(wait_until(Duration::from_secs(2), || sink.rows().len() == 3));
    assert_eq!(sink.eos_calls(), 1);
    engine.unregister_query(query_id).unwrap();
    engine.shutdown();
}

/// Redeploy runs as stop-then-start behind the reconfiguration flag.
#[test]
fn test_redeploy_is_stop_then_start() {
    use crate::common::test_config;

    let mut config = test_config(1);
    config.enable_query_reconfiguration = true;
    let engine = NodeEngine::start(config).unwrap();

    let (query_id, handle, _sink, _plan) = deploy_passthrough(&engine, 1);
    engine.start_query(query_id).unwrap();
    handle.finish();
    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query_id) == Some(ExecutionStatus::Stopped)
    }));

    // Redeploy under a new query id; the old origin is released first.
    let schema = input_schema();
    let buffer_size = engine.config().buffer_size_bytes;
    let new_query = QueryId::new(2).unwrap();
    let origin = OriginId::new(20).unwrap();
    let pipeline = PipelineId::new(1).unwrap();
    let sink = RecordingSink::new(&schema, buffer_size);
    let plan = engine
        .plan_builder(new_query)
        .add_source(origin, vec![SuccessorTarget::Pipeline(pipeline)])
        .add_pipeline(pipeline, Arc::new(PassthroughStage), vec![SuccessorTarget::Sink(SinkId(1))], vec![])
        .add_sink(SinkId(1), sink.clone())
        .build()
        .unwrap();
    let (source, new_handle) = IngestSource::create(&schema, buffer_size, 2).unwrap();
    let runner = engine.create_source_runner(origin, Box::new(source), &plan, 0).unwrap();
    engine
        .redeploy_query(query_id, plan, vec![runner as Arc<dyn ManagedSource>])
        .unwrap();

    assert_eq!(engine.query_status(query_id), None);
    assert_eq!(engine.query_status(new_query), Some(ExecutionStatus::Running));
    new_handle.push(vec![record(1, 1, 1)]).unwrap();
    assert!(wait_until(Duration::from_secs(5), || sink.rows().len() == 1));
    new_handle.finish();
    engine.shutdown();
}

/// Redeploy is rejected while the reconfiguration flag is off.
#[test]
fn test_redeploy_requires_flag() {
    let engine = test_engine(1);
    let (query_id, handle, _sink, plan) = deploy_passthrough(&engine, 1);
    engine.start_query(query_id).unwrap();

    let result = engine.redeploy_query(query_id, plan, vec![]);
    assert!(matches!(result, Err(EngineError::Unsupported(_))));

    handle.finish();
    engine.shutdown();
}

/// Per-query statistics counters reflect the processed volume.
#[test]
fn test_statistics_track_processing() {
    let engine = test_engine(1);
    let (query_id, handle, _sink, _plan) = deploy_passthrough(&engine, 2);
    engine.start_query(query_id).unwrap();

    handle.push(vec![record(1, 1, 1), record(2, 2, 2)]).unwrap();
    handle.push(vec![record(3, 3, 3)]).unwrap();
    handle.finish();
    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query_id) == Some(ExecutionStatus::Stopped)
    }));

    assert!(wait_until(Duration::from_secs(2), || {
        engine.statistics(query_id).is_some_and(|stats| stats.processed_tuples >= 3)
    }));
    let stats = engine.statistics(query_id).unwrap();
    assert!(stats.timestamp_query_start > 0);
    // Two buffers entered the pipeline and were forwarded to the sink.
    assert!(stats.processed_buffers >= 2);
    engine.shutdown();
}
