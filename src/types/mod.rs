// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Custom resources served by the controller.

pub mod cluster_mapping;
pub mod namespace_mapping;

pub use cluster_mapping::{ClusterMapping, ClusterMappingSpec, ClusterRef, KubeconfigSecretRef};
pub use namespace_mapping::{
    NamespaceMapping, NamespaceMappingSpec, NamespaceMappingStatus, ResourceOutcome, SyncMode,
    SyncPhase, SyncStats,
};
