//! This crate provides a distributed datacube operator framework. A datacube is a
//! multidimensional array whose rows are partitioned into fragments spread over several storage
//! servers. Operators transform whole datacubes by running a group of workers, each of which
//! transforms its share of the fragments next to the data.
//!
//! Every operator invocation follows the same lifecycle (see [engine]): rank 0 resolves the inputs
//! and creates the output metadata, the fragments are partitioned among the workers, each worker
//! writes its output fragments, and the outcome is agreed collectively. A failure on any worker
//! rolls back everything the invocation created.
//!
//! The building blocks are:
//!
//! * [subset] parses range expressions such as `1:2:10,end` and maps flat row ids onto
//!   dimension indices.
//! * [coordinates] resolves coordinate-value ranges onto index ranges.
//! * [partition] splits fragment lists among workers and [matcher] pairs the fragments of two
//!   datacubes.
//! * [catalog] and [storage] abstract the metadata catalog and the fragment storage servers, with
//!   in-memory implementations.
//! * [operators] holds the array operators.
//!
//! The service is built on [Tokio](tokio), the [Axum](axum) web framework, [Serde](serde) for
//! (de)serialisation and [ndarray] for the element arithmetic of the storage kernels.

pub mod app;
pub mod app_state;
pub mod array;
pub mod catalog;
pub mod cli;
pub mod compression;
pub mod coordinates;
pub mod engine;
pub mod error;
pub mod fragment_ids;
pub mod group;
pub mod kernels;
pub mod matcher;
pub mod metrics;
pub mod models;
pub mod operators;
pub mod partition;
pub mod report;
pub mod resource_manager;
pub mod server;
pub mod storage;
pub mod subset;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod validated_json;
