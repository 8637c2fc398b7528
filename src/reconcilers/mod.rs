// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes reconcilers that react to watch events.

pub mod cluster_mapping;
pub mod namespace_mapping;

pub use cluster_mapping::ClusterMappingReconciler;
pub use namespace_mapping::NamespaceMappingReconciler;
