//! Router-level tests for the edge pipeline.
//!
//! ## Test Modules
//!
//! - **pipeline_tests**: the standard chain end to end over a test router
//! - **config_tests**: configuration loading and validation
//!
//! Unit tests for the individual stages live next to each stage.
