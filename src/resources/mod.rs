// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Replicated resource kinds and their fetch, transform, diff and apply rules.

pub mod kind;
pub mod transform;

pub use kind::{resolve_kinds, CustomKind, ResourceKind};
pub use transform::TransformContext;
