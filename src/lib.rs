//! beiboot-operator: ephemeral nested k3s clusters (`Beiboot`) and
//! volume snapshots of them (`Shelf`), managed as Kubernetes resources.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod helpers;
pub mod provider;
pub mod snapshot;
pub mod tunnel;
pub mod webhook;

#[cfg(test)]
pub mod fixtures;
