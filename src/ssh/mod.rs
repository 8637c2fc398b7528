// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! SSH identities for the PVC data plane and the agent-side trust file watcher.

pub mod keys;
pub mod secret_watcher;

pub use keys::{generate_key_pair, temp_secret_name, KeyManager, KeyPair};
pub use secret_watcher::SecretWatcher;
