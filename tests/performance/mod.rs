//! Performance integration tests
//!
//! Throughput and fairness under many concurrent clients.

mod stress_test;
