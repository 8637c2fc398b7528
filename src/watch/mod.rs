// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Change-driven triggers for Continuous mappings.

pub mod manager;

pub use manager::{
    InformerFactory, KubeInformerFactory, WatchCallback, WatchEventKind, WatchManager, WatchStream,
};
