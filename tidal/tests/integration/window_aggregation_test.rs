//! # Windowed Aggregation Integration Tests
//!
//! Tumbling and sliding window results end to end: single worker,
//! multi-worker pre-aggregation, watermark invariants on result buffers,
//! and cache hit-neutrality.

use std::sync::Arc;
use std::time::Duration;

use crate::common::{
    input_schema, record, test_engine, wait_until, RecordingSink, window_result_schema,
};

use tidal::infrastructure::operators::window_operator::{WindowBuildStage, WindowOperatorHandler};
use tidal::infrastructure::runtime::executable_plan::{SinkId, SuccessorTarget};
use tidal::infrastructure::sources::ingest_source::{IngestHandle, IngestSource};
use tidal::infrastructure::sources::managed_source::ManagedSource;
use tidal::{
    ExecutionStatus, FieldValue, NodeEngine, OriginId, PipelineId, QueryId, WindowSpec,
};
use tidal_domain::{aggregation_for, AggregationKind, CachePolicy, FieldValue as DomainValue};

struct WindowQuery {
    query_id: QueryId,
    handle: IngestHandle,
    sink: Arc<RecordingSink>,
}

/// Deploys `ingest -> window build -> sink` with a sum aggregation.
fn deploy_window_query(
    engine: &Arc<NodeEngine>,
    query_raw: u64,
    window: WindowSpec,
    slice_size: u64,
    cache: Option<(CachePolicy, usize)>,
) -> WindowQuery {
    let schema = input_schema();
    let result_schema = window_result_schema();
    let buffer_size = engine.config().buffer_size_bytes;
    let workers = engine.config().number_of_worker_threads;

    let query_id = QueryId::new(query_raw).unwrap();
    let origin = OriginId::new(query_raw * 100).unwrap();
    let pipeline = PipelineId::new(1).unwrap();
    let sink = RecordingSink::new(&result_schema, buffer_size);

    let handler = WindowOperatorHandler::new(
        window,
        slice_size,
        0,
        vec![aggregation_for(AggregationKind::Sum)],
        vec![origin],
        workers,
        &result_schema,
        buffer_size,
        cache,
    )
    .unwrap();

    let mut builder = engine.plan_builder(query_id);
    let handler_index = builder.add_operator_handler(handler);
    let plan = builder
        .add_source(origin, vec![SuccessorTarget::Pipeline(pipeline)])
        .add_pipeline(
            pipeline,
            Arc::new(
                WindowBuildStage::new(handler_index, &schema, buffer_size, "in$ts", "in$key", "in$value")
                    .unwrap(),
            ),
            vec![SuccessorTarget::Sink(SinkId(1))],
            vec![handler_index],
        )
        .add_sink(SinkId(1), sink.clone())
        .build()
        .unwrap();

    let (source, handle) = IngestSource::create(&schema, buffer_size, 2).unwrap();
    let runner = engine.create_source_runner(origin, Box::new(source), &plan, 0).unwrap();
    engine
        .register_query(plan, vec![runner as Arc<dyn ManagedSource>])
        .unwrap();
    engine.start_query(query_id).unwrap();
    WindowQuery { query_id, handle, sink }
}

fn sum_rows(rows: &[Vec<FieldValue>]) -> Vec<(u64, u64, u64, i64)> {
    let mut extracted: Vec<(u64, u64, u64, i64)> = rows
        .iter()
        .map(|row| {
            (
                row[0].as_u64().unwrap(),
                row[1].as_u64().unwrap(),
                row[2].as_u64().unwrap(),
                row[3].as_i64().unwrap(),
            )
        })
        .collect();
    extracted.sort();
    extracted
}

/// Tumbling sum on a single worker: records `(k=1, v=10/20/30/40,
/// ts=1/1/2/3)` with window 10 produce exactly `(0, 10, 1, 100)` after the
/// stream ends.
#[test]
fn test_tumbling_sum_single_worker() {
    let engine = test_engine(1);
    let query = deploy_window_query(&engine, 1, WindowSpec::tumbling(10).unwrap(), 10, None);

    query
        .handle
        .push(vec![record(1, 10, 1), record(1, 20, 1), record(1, 30, 2), record(1, 40, 3)])
        .unwrap();
    query.handle.finish();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query.query_id) == Some(ExecutionStatus::Stopped)
    }));
    assert!(wait_until(Duration::from_secs(2), || query.sink.rows().len() == 1));
    assert_eq!(sum_rows(&query.sink.rows()), vec![(0, 10, 1, 100)]);
    engine.shutdown();
}

/// The same records split across four workers in separate buffers produce
/// the identical single result.
#[test]
fn test_multi_worker_pre_aggregation() {
    let engine = test_engine(4);
    let query = deploy_window_query(&engine, 2, WindowSpec::tumbling(10).unwrap(), 10, None);

    // One record per buffer so the four buffers spread across workers.
    for (value, ts) in [(10, 1), (20, 1), (30, 2), (40, 3)] {
        query.handle.push(vec![record(1, value, ts)]).unwrap();
    }
    query.handle.finish();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query.query_id) == Some(ExecutionStatus::Stopped)
    }));
    assert!(wait_until(Duration::from_secs(2), || query.sink.rows().len() == 1));
    assert_eq!(sum_rows(&query.sink.rows()), vec![(0, 10, 1, 100)]);
    engine.shutdown();
}

/// Mid-stream triggering: once the watermark passes a window end, the
/// result is emitted with `watermark >= window_end` and `end > start`.
#[test]
fn test_window_triggers_on_watermark_progress() {
    let engine = test_engine(1);
    let query = deploy_window_query(&engine, 3, WindowSpec::tumbling(10).unwrap(), 10, None);

    query.handle.push(vec![record(1, 5, 2), record(2, 7, 4)]).unwrap();
    // A record far ahead pushes the watermark past the first window.
    query.handle.push(vec![record(1, 1, 25)]).unwrap();

    assert!(wait_until(Duration::from_secs(5), || query.sink.rows().len() >= 2));
    let rows = sum_rows(&query.sink.rows());
    assert_eq!(rows, vec![(0, 10, 1, 5), (0, 10, 2, 7)]);
    for watermark in query.sink.watermarks() {
        assert!(watermark.millis() >= 10, "result watermark {watermark} below window end");
    }

    query.handle.finish();
    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query.query_id) == Some(ExecutionStatus::Stopped)
    }));
    engine.shutdown();
}

/// Sliding windows: a record belongs to `size / slide` windows.
#[test]
fn test_sliding_window_sums() {
    let engine = test_engine(1);
    let query = deploy_window_query(&engine, 4, WindowSpec::sliding(10, 5).unwrap(), 5, None);

    query.handle.push(vec![record(1, 3, 7)]).unwrap();
    query.handle.finish();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query.query_id) == Some(ExecutionStatus::Stopped)
    }));
    // ts=7 falls into [0,10) and [5,15).
    assert!(wait_until(Duration::from_secs(2), || query.sink.rows().len() == 2));
    assert_eq!(sum_rows(&query.sink.rows()), vec![(0, 10, 1, 3), (5, 15, 1, 3)]);
    engine.shutdown();
}

/// Keys in the same window aggregate independently.
#[test]
fn test_keys_are_independent() {
    let engine = test_engine(2);
    let query = deploy_window_query(&engine, 5, WindowSpec::tumbling(10).unwrap(), 10, None);

    query
        .handle
        .push(vec![record(1, 1, 1), record(2, 2, 2), record(1, 10, 3), record(3, 5, 4)])
        .unwrap();
    query.handle.finish();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query.query_id) == Some(ExecutionStatus::Stopped)
    }));
    assert!(wait_until(Duration::from_secs(2), || query.sink.rows().len() == 3));
    assert_eq!(
        sum_rows(&query.sink.rows()),
        vec![(0, 10, 1, 11), (0, 10, 2, 2), (0, 10, 3, 5)]
    );
    engine.shutdown();
}

/// The slice cache is hit-neutral: every policy produces the identical
/// results as the uncached run.
#[test]
fn test_slice_cache_is_hit_neutral() {
    let records: Vec<(u64, i64, u64)> = (0..40).map(|i| (i % 3, (i % 7) as i64, i)).collect();
    let mut expected: Option<Vec<(u64, u64, u64, i64)>> = None;

    let policies = [
        None,
        Some((CachePolicy::Fifo, 4)),
        Some((CachePolicy::Lru, 4)),
        Some((CachePolicy::SecondChance, 4)),
    ];
    for (index, cache) in policies.into_iter().enumerate() {
        let engine = test_engine(1);
        let query = deploy_window_query(
            &engine,
            6 + index as u64,
            WindowSpec::tumbling(10).unwrap(),
            10,
            cache,
        );
        for chunk in records.chunks(8) {
            let batch = chunk.iter().map(|(k, v, ts)| record(*k, *v, *ts)).collect();
            query.handle.push(batch).unwrap();
        }
        query.handle.finish();
        assert!(wait_until(Duration::from_secs(5), || {
            engine.query_status(query.query_id) == Some(ExecutionStatus::Stopped)
        }));

        wait_until(Duration::from_secs(2), || !query.sink.rows().is_empty());
        let rows = sum_rows(&query.sink.rows());
        match &expected {
            None => expected = Some(rows),
            Some(expected) => assert_eq!(&rows, expected, "policy {cache:?} changed results"),
        }
        engine.shutdown();
    }
}

/// Average lowers to the floating-point mean of the window.
#[test]
fn test_average_aggregation() {
    let engine = test_engine(1);
    let schema = input_schema();
    let buffer_size = engine.config().buffer_size_bytes;
    let result_schema = tidal::Schema::build(
        tidal::MemoryLayoutType::Row,
        [
            ("out$window_start", tidal::DataType::UInt64),
            ("out$window_end", tidal::DataType::UInt64),
            ("out$key", tidal::DataType::UInt64),
            ("out$avg", tidal::DataType::Float64),
        ],
    )
    .unwrap();

    let query_id = QueryId::new(20).unwrap();
    let origin = OriginId::new(2000).unwrap();
    let pipeline = PipelineId::new(1).unwrap();
    let sink = RecordingSink::new(&result_schema, buffer_size);
    let handler = WindowOperatorHandler::new(
        WindowSpec::tumbling(10).unwrap(),
        10,
        0,
        vec![aggregation_for(AggregationKind::Avg)],
        vec![origin],
        1,
        &result_schema,
        buffer_size,
        None,
    )
    .unwrap();
    let mut builder = engine.plan_builder(query_id);
    let handler_index = builder.add_operator_handler(handler);
    let plan = builder
        .add_source(origin, vec![SuccessorTarget::Pipeline(pipeline)])
        .add_pipeline(
            pipeline,
            Arc::new(
                WindowBuildStage::new(handler_index, &schema, buffer_size, "in$ts", "in$key", "in$value")
                    .unwrap(),
            ),
            vec![SuccessorTarget::Sink(SinkId(1))],
            vec![handler_index],
        )
        .add_sink(SinkId(1), sink.clone())
        .build()
        .unwrap();
    let (source, handle) = IngestSource::create(&schema, buffer_size, 2).unwrap();
    let runner = engine.create_source_runner(origin, Box::new(source), &plan, 0).unwrap();
    engine.register_query(plan, vec![runner as Arc<dyn ManagedSource>]).unwrap();
    engine.start_query(query_id).unwrap();

    handle.push(vec![record(1, 1, 1), record(1, 2, 2), record(1, 3, 3)]).unwrap();
    handle.finish();
    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query_id) == Some(ExecutionStatus::Stopped)
    }));

    assert!(wait_until(Duration::from_secs(2), || sink.rows().len() == 1));
    let rows = sink.rows();
    assert_eq!(rows[0][3], DomainValue::Float64(2.0));
    engine.shutdown();
}
