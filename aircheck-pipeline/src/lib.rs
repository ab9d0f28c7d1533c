//! aircheck-pipeline library interface
//!
//! Stage implementations, the worker loop, the store, and the
//! knowledge-base engine, exposed for the `aircheck` binary and for
//! integration testing.

pub mod clipper;
pub mod escalation;
pub mod inference;
pub mod kb;
pub mod models;
pub mod stages;
pub mod storage;
pub mod store;
pub mod worker;
