//! Integration Tests
//!
//! This module aggregates the engine integration suite: query lifecycle,
//! windowed aggregation, interval joins, and network transport.

mod common;

#[path = "integration/query_lifecycle_test.rs"]
mod query_lifecycle_test;

#[path = "integration/window_aggregation_test.rs"]
mod window_aggregation_test;

#[path = "integration/interval_join_test.rs"]
mod interval_join_test;

#[path = "integration/network_transport_test.rs"]
mod network_transport_test;
