//! Pure renderers from manifest to Kubernetes object specs.

pub mod common;
pub mod cronjob;
pub mod pdb;
pub mod secret;
pub mod service;
pub mod statefulset;

pub use common::{ClusterInfo, PostgresRole};
