//! Mock Kubernetes API server for testing.
//!
//! Provides an HTTP server that can be used with kubeconfig-based connections.
//! Besides discovery and CRUD it models the parts of the API server that
//! decide whether an object actually disappears: finalizers, deletion
//! timestamps and the `finalize` subresource.

pub mod discovery;
mod helpers;
pub mod http;
mod path;

pub use discovery::{DiscoveryMode, MockApiResource, MockDiscovery};
pub use http::{HttpMockK8sServer, RunningHttpMockK8sServer};
