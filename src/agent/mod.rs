// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The per-node agent daemon.

pub mod daemon;
pub mod leader;
pub mod sshd;

pub use daemon::AgentDaemon;
pub use leader::{LeaderElectionConfig, LeaderStatus};
pub use sshd::SshServer;
