// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Sync engine: per-mapping runtimes, sync passes and status bookkeeping.

pub mod manager;
pub mod replicate;
pub mod runner;
pub mod runtime;
pub mod status;

pub use manager::{EngineContext, InformerSource, SyncEvent, SyncManager, SyncManagerHandle};
pub use replicate::replicate_kind;
pub use runner::{PassScope, PassSummary, SyncRunner};
pub use runtime::MappingRuntime;
pub use status::StatusWriter;
