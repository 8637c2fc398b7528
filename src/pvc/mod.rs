// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! PVC data plane: node discovery, temp pods and cross-cluster data copies.

pub mod locator;
pub mod sync;
pub mod temp_pod;

pub use locator::{LocateStrategy, NodeLocation, PvcNodeLocator};
pub use sync::{PvcDataSyncer, PvcSyncReport, PvcSyncSettings};
pub use temp_pod::{TempPodLease, TempPodManager, TempPodSpec};
