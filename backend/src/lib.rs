//! HTTP control plane for the process allocator's heap profiler.
//!
//! Exposes pprof-style endpoints to toggle allocation sampling, pull heap
//! profiles, symbolize addresses and scrape allocator counters. The allocator
//! is reached through [`allocator::AllocatorControl`], so everything above it
//! runs against [`fake::FakeAllocator`] in tests.

pub mod allocator;
pub mod config;
pub mod control;
pub mod dump;
pub mod fake;
pub mod handlers;
#[cfg(feature = "jemalloc")]
pub mod jemalloc;
pub mod metrics;
pub mod request_context;
pub mod routes;
pub mod symbolize;
pub mod symbols;
