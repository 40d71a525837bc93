//! # Network Transport Integration Tests
//!
//! Two engines in one process connected over loopback TCP: a producer
//! engine shipping buffers through a network sink, a consumer engine
//! receiving them through a network source. Covers the data path, the
//! graceful end-of-stream crossing the wire, and the bounded-retry failure
//! path when the upstream peer never appears.

use std::sync::Arc;
use std::time::Duration;

use crate::common::{input_schema, record, test_config, wait_until, PassthroughStage, RecordingSink};

use tidal::infrastructure::config::engine_config::NetworkConfiguration;
use tidal::infrastructure::network::network_sink::NetworkSink;
use tidal::infrastructure::network::network_source::NetworkSource;
use tidal::infrastructure::runtime::executable_plan::{SinkId, SuccessorTarget};
use tidal::infrastructure::sources::ingest_source::IngestSource;
use tidal::infrastructure::sources::managed_source::ManagedSource;
use tidal::{
    ExecutionStatus, NodeEngine, OriginId, Partition, PipelineId, QueryId, TerminationKind,
};
use tidal_domain::NodeLocation;

fn networked_engine(workers: usize) -> Arc<NodeEngine> {
    let mut config = test_config(workers);
    config.network = Some(NetworkConfiguration {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        retry_times: 10,
        wait_time_ms: 50,
    });
    NodeEngine::start(config).expect("networked engine starts")
}

/// Buffers produced on one engine arrive on the other, and the graceful
/// end-of-stream crosses the wire.
#[test]
fn test_cross_node_data_flow() {
    let schema = input_schema();

    // Consumer node first so its listener is up.
    let consumer = networked_engine(2);
    let producer = networked_engine(2);
    let buffer_size = consumer.config().buffer_size_bytes;
    let tuple_size = schema.size_in_bytes();

    let consumer_query = QueryId::new(1).unwrap();
    let consumer_origin = OriginId::new(1).unwrap();
    let consumer_pipeline = PipelineId::new(1).unwrap();
    let partition = Partition::new(consumer_query, consumer_pipeline, consumer_origin);

    // Consumer plan: network source -> passthrough -> recording sink.
    let sink = RecordingSink::new(&schema, buffer_size);
    let consumer_plan = consumer
        .plan_builder(consumer_query)
        .add_source(consumer_origin, vec![SuccessorTarget::Pipeline(consumer_pipeline)])
        .add_pipeline(
            consumer_pipeline,
            Arc::new(PassthroughStage),
            vec![SuccessorTarget::Sink(SinkId(1))],
            vec![],
        )
        .add_sink(SinkId(1), sink.clone())
        .build()
        .unwrap();

    let producer_location = producer.network().unwrap().location().clone();
    let network_source = NetworkSource::new(
        partition,
        consumer_origin,
        tuple_size,
        Arc::clone(consumer.query_manager()),
        Arc::clone(&consumer_plan),
        Arc::clone(consumer.network().unwrap()),
        producer_location,
        Duration::from_millis(50),
        10,
        8,
    )
    .unwrap();
    network_source.bind().unwrap();
    consumer
        .register_query(
            Arc::clone(&consumer_plan),
            vec![Arc::clone(&network_source) as Arc<dyn ManagedSource>],
        )
        .unwrap();
    consumer.start_query(consumer_query).unwrap();

    // Producer plan: ingest -> passthrough -> network sink toward consumer.
    let producer_query = QueryId::new(2).unwrap();
    let producer_origin = OriginId::new(2).unwrap();
    let producer_pipeline = PipelineId::new(1).unwrap();
    let consumer_location = consumer.network().unwrap().location().clone();
    let network_sink = NetworkSink::new(
        partition,
        consumer_location,
        Arc::clone(producer.network().unwrap()),
        tuple_size,
        10,
        Duration::from_millis(50),
    )
    .unwrap();
    let producer_plan = producer
        .plan_builder(producer_query)
        .add_source(producer_origin, vec![SuccessorTarget::Pipeline(producer_pipeline)])
        .add_pipeline(
            producer_pipeline,
            Arc::new(PassthroughStage),
            vec![SuccessorTarget::Sink(SinkId(1))],
            vec![],
        )
        .add_sink(SinkId(1), network_sink)
        .build()
        .unwrap();
    let (source, handle) = IngestSource::create(&schema, buffer_size, 2).unwrap();
    let runner = producer
        .create_source_runner(producer_origin, Box::new(source), &producer_plan, 0)
        .unwrap();
    producer
        .register_query(Arc::clone(&producer_plan), vec![runner as Arc<dyn ManagedSource>])
        .unwrap();
    producer.start_query(producer_query).unwrap();

    handle.push(vec![record(1, 10, 1), record(2, 20, 2)]).unwrap();
    handle.push(vec![record(3, 30, 3)]).unwrap();
    handle.finish();

    // The producer drains and closes its channel with a soft EoS; the
    // consumer sees the data and then terminates gracefully.
    assert!(wait_until(Duration::from_secs(10), || {
        producer.query_status(producer_query) == Some(ExecutionStatus::Stopped)
    }));
    assert!(wait_until(Duration::from_secs(10), || {
        consumer.query_status(consumer_query) == Some(ExecutionStatus::Stopped)
    }));
    assert!(wait_until(Duration::from_secs(2), || sink.rows().len() == 3));
    assert_eq!(sink.eos_kinds(), vec![TerminationKind::Graceful]);

    producer.shutdown();
    consumer.shutdown();
}

/// A consumer whose upstream never appears exhausts its retry budget and
/// fails the query.
#[test]
fn test_unreachable_upstream_fails_query() {
    let schema = input_schema();
    let consumer = networked_engine(1);
    let buffer_size = consumer.config().buffer_size_bytes;

    let query_id = QueryId::new(3).unwrap();
    let origin = OriginId::new(3).unwrap();
    let pipeline = PipelineId::new(1).unwrap();
    let partition = Partition::new(query_id, pipeline, origin);

    let sink = RecordingSink::new(&schema, buffer_size);
    let plan = consumer
        .plan_builder(query_id)
        .add_source(origin, vec![SuccessorTarget::Pipeline(pipeline)])
        .add_pipeline(pipeline, Arc::new(PassthroughStage), vec![SuccessorTarget::Sink(SinkId(1))], vec![])
        .add_sink(SinkId(1), sink)
        .build()
        .unwrap();

    // Port 1 on loopback: nothing listens there.
    let network_source = NetworkSource::new(
        partition,
        origin,
        schema.size_in_bytes(),
        Arc::clone(consumer.query_manager()),
        Arc::clone(&plan),
        Arc::clone(consumer.network().unwrap()),
        NodeLocation::new("127.0.0.1", 1),
        Duration::from_millis(20),
        2,
        4,
    )
    .unwrap();
    network_source.bind().unwrap();
    consumer
        .register_query(Arc::clone(&plan), vec![network_source as Arc<dyn ManagedSource>])
        .unwrap();
    consumer.start_query(query_id).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        consumer.query_status(query_id) == Some(ExecutionStatus::Failed)
    }));
    assert!(plan.error().unwrap().contains("unreachable"));
    consumer.shutdown();
}
