//! # Interval Join Integration Tests
//!
//! Build-probe joins over per-interval paged vectors: the two-sided plan
//! `left ingest -> left build`, `right ingest -> right build`, both builds
//! feeding the probe pipeline, probe feeding the sink.

use std::sync::Arc;
use std::time::Duration;

use crate::common::{test_engine, wait_until, RecordingSink};

use tidal::infrastructure::operators::interval_join::{
    IntervalJoinBuildStage, IntervalJoinHandler, IntervalJoinProbeStage, JoinSide,
};
use tidal::infrastructure::runtime::executable_plan::{SinkId, SuccessorTarget};
use tidal::infrastructure::sources::ingest_source::{IngestHandle, IngestSource};
use tidal::infrastructure::sources::managed_source::ManagedSource;
use tidal::{
    DataType, ExecutionStatus, FieldValue, MemoryLayoutType, NodeEngine, OriginId, PipelineId,
    QueryId, Schema,
};
use tidal_domain::Field;

fn side_schema(prefix: &str) -> Schema {
    Schema::new(
        MemoryLayoutType::Row,
        vec![
            Field::new(format!("{prefix}$id"), DataType::UInt64, false).unwrap(),
            Field::new(format!("{prefix}$ts"), DataType::UInt64, false).unwrap(),
        ],
    )
    .unwrap()
}

struct JoinQuery {
    query_id: QueryId,
    left: IngestHandle,
    right: IngestHandle,
    sink: Arc<RecordingSink>,
    handler: Arc<IntervalJoinHandler>,
}

/// Deploys the interval-join plan with an `id == id` predicate.
fn deploy_join_query(engine: &Arc<NodeEngine>, interval_size: u64) -> JoinQuery {
    let left_schema = side_schema("l");
    let right_schema = side_schema("r");
    let buffer_size = engine.config().buffer_size_bytes;
    let workers = engine.config().number_of_worker_threads;

    let query_id = QueryId::new(1).unwrap();
    let left_origin = OriginId::new(11).unwrap();
    let right_origin = OriginId::new(12).unwrap();
    let left_build = PipelineId::new(1).unwrap();
    let right_build = PipelineId::new(2).unwrap();
    let probe = PipelineId::new(3).unwrap();

    let handler = IntervalJoinHandler::new(
        interval_size,
        &left_schema,
        &right_schema,
        "l$ts",
        "r$ts",
        Arc::new(|left: &[FieldValue], right: &[FieldValue]| {
            Ok(left[0].as_u64()? == right[0].as_u64()?)
        }),
        vec![left_origin, right_origin],
        workers,
        buffer_size,
        64,
        2,
    )
    .unwrap();
    let sink = RecordingSink::new(handler.output_schema(), buffer_size);

    let mut builder = engine.plan_builder(query_id);
    let handler_index = builder.add_operator_handler(handler.clone());
    let plan = builder
        .add_source(left_origin, vec![SuccessorTarget::Pipeline(left_build)])
        .add_source(right_origin, vec![SuccessorTarget::Pipeline(right_build)])
        .add_pipeline(
            left_build,
            Arc::new(
                IntervalJoinBuildStage::new(handler_index, JoinSide::Left, &left_schema, buffer_size, "l$ts")
                    .unwrap(),
            ),
            vec![SuccessorTarget::Pipeline(probe)],
            vec![handler_index],
        )
        .add_pipeline(
            right_build,
            Arc::new(
                IntervalJoinBuildStage::new(handler_index, JoinSide::Right, &right_schema, buffer_size, "r$ts")
                    .unwrap(),
            ),
            vec![SuccessorTarget::Pipeline(probe)],
            vec![handler_index],
        )
        .add_pipeline(
            probe,
            Arc::new(IntervalJoinProbeStage::new(handler_index)),
            vec![SuccessorTarget::Sink(SinkId(1))],
            vec![handler_index],
        )
        .add_sink(SinkId(1), sink.clone())
        .build()
        .unwrap();

    let (left_source, left) = IngestSource::create(&left_schema, buffer_size, 1).unwrap();
    let (right_source, right) = IngestSource::create(&right_schema, buffer_size, 1).unwrap();
    let left_runner = engine
        .create_source_runner(left_origin, Box::new(left_source), &plan, 0)
        .unwrap();
    let right_runner = engine
        .create_source_runner(right_origin, Box::new(right_source), &plan, 0)
        .unwrap();
    engine
        .register_query(
            plan,
            vec![
                left_runner as Arc<dyn ManagedSource>,
                right_runner as Arc<dyn ManagedSource>,
            ],
        )
        .unwrap();
    engine.start_query(query_id).unwrap();
    JoinQuery { query_id, left, right, sink, handler }
}

fn row(id: u64, ts: u64) -> Vec<FieldValue> {
    vec![FieldValue::UInt64(id), FieldValue::UInt64(ts)]
}

fn joined(rows: &[Vec<FieldValue>]) -> Vec<(u64, u64, u64, u64)> {
    // (interval_start, interval_end, left id, right ts)
    let mut extracted: Vec<(u64, u64, u64, u64)> = rows
        .iter()
        .map(|r| {
            (
                r[0].as_u64().unwrap(),
                r[1].as_u64().unwrap(),
                r[2].as_u64().unwrap(),
                r[5].as_u64().unwrap(),
            )
        })
        .collect();
    extracted.sort();
    extracted
}

/// One left record joins two matching right records inside `[1000, 2000)`,
/// and both joined rows carry the interval bounds.
#[test]
fn test_interval_join_basic() {
    let engine = test_engine(2);
    let query = deploy_join_query(&engine, 1000);

    query.left.push(vec![row(4, 1002)]).unwrap();
    query.right.push(vec![row(4, 1102), row(4, 1112)]).unwrap();
    query.left.finish();
    query.right.finish();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query.query_id) == Some(ExecutionStatus::Stopped)
    }));
    assert!(wait_until(Duration::from_secs(2), || query.sink.rows().len() == 2));
    assert_eq!(
        joined(&query.sink.rows()),
        vec![(1000, 2000, 4, 1102), (1000, 2000, 4, 1112)]
    );
    // Probed intervals were deleted at termination.
    assert_eq!(query.handler.interval_count(), 0);
    engine.shutdown();
}

/// Right rows arriving before any left row of their interval still join:
/// the retention buffer seeds the late-created interval.
#[test]
fn test_right_before_left_is_retained() {
    let engine = test_engine(1);
    let query = deploy_join_query(&engine, 1000);

    query.right.push(vec![row(7, 1500)]).unwrap();
    // Give the right build a head start before the left row arrives.
    std::thread::sleep(Duration::from_millis(100));
    query.left.push(vec![row(7, 1400)]).unwrap();
    query.left.finish();
    query.right.finish();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query.query_id) == Some(ExecutionStatus::Stopped)
    }));
    assert!(wait_until(Duration::from_secs(2), || query.sink.rows().len() == 1));
    assert_eq!(joined(&query.sink.rows()), vec![(1000, 2000, 7, 1500)]);
    engine.shutdown();
}

/// Non-matching ids produce no joined rows.
#[test]
fn test_predicate_filters_mismatches() {
    let engine = test_engine(1);
    let query = deploy_join_query(&engine, 1000);

    query.left.push(vec![row(1, 1010)]).unwrap();
    query.right.push(vec![row(2, 1020)]).unwrap();
    query.left.finish();
    query.right.finish();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query.query_id) == Some(ExecutionStatus::Stopped)
    }));
    assert!(query.sink.rows().is_empty());
    engine.shutdown();
}

/// Records in different intervals never join.
#[test]
fn test_intervals_partition_time() {
    let engine = test_engine(2);
    let query = deploy_join_query(&engine, 1000);

    query.left.push(vec![row(5, 500)]).unwrap();
    query.right.push(vec![row(5, 1500)]).unwrap();
    query.left.finish();
    query.right.finish();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.query_status(query.query_id) == Some(ExecutionStatus::Stopped)
    }));
    assert!(query.sink.rows().is_empty(), "cross-interval rows must not join");
    engine.shutdown();
}
