//! Metrics collection server.
//!
//! Agents push gauges and counters over HTTP ([`api`]) or gRPC ([`grpc`]).
//! Both bindings call the same [`service::MetricsService`], which keeps the
//! latest values in a [`store::MetricStore`] and snapshots them through the
//! persistence gateway ([`lifecycle`]).

pub mod api;
pub mod app;
pub mod config;
pub mod grpc;
pub mod lifecycle;
pub mod logging;
pub mod middleware;
pub mod service;
pub mod state;
pub mod store;
