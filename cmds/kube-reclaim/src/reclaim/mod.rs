//! Escalating reclamation of stuck resources and namespaces.

pub mod engine;
pub mod namespace;
pub mod payload;
pub mod proxy;
pub mod report;
pub mod session;
