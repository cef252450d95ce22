//! Integration tests for the Agora overlay network.

pub mod support;

pub mod fanout_tests;
pub mod service_unit_tests;
