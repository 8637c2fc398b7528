// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
pub mod agent;
pub mod backoff;
pub mod config;
pub mod constants;
pub mod error;
pub mod kubernetes;
pub mod pvc;
pub mod reconcilers;
pub mod remote;
pub mod resources;
pub mod shutdown;
pub mod ssh;
pub mod sync;
pub mod types;
pub mod watch;
pub mod workers;

#[cfg(test)]
pub mod test_utils;
