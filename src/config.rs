// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::defaults;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Controller configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace the controller runs in and whose mappings it serves
    pub namespace: String,
    /// Namespace of the agent DaemonSet in every cluster
    pub agent_namespace: String,
    pub agent_ssh_port: u16,
    pub temp_pod_image: String,
    pub pvc_sync_concurrency: usize,
    pub resource_sync_concurrency: usize,
    pub key_rotation: chrono::Duration,
    pub key_bits: usize,
    pub temp_pod_ready_timeout: Duration,
    pub cache_sync_timeout: Duration,
    pub background_sync_interval: Duration,
    /// Time given to agents to re-materialize authorized keys after a change
    pub key_propagation_delay: Duration,
    pub exec_max_retries: u32,
    pub exec_backoff: Duration,
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            namespace: env_string("POD_NAMESPACE", "dr-syncer"),
            agent_namespace: env_string("AGENT_NAMESPACE", "dr-syncer"),
            agent_ssh_port: env_parse("AGENT_SSH_PORT", defaults::SSH_PORT)?,
            temp_pod_image: env_string("TEMP_POD_IMAGE", defaults::TEMP_POD_IMAGE),
            pvc_sync_concurrency: env_parse("PVC_SYNC_CONCURRENCY", defaults::PVC_SYNC_CONCURRENCY)?,
            resource_sync_concurrency: env_parse(
                "RESOURCE_SYNC_CONCURRENCY",
                defaults::RESOURCE_SYNC_CONCURRENCY,
            )?,
            key_rotation: chrono::Duration::hours(env_parse(
                "KEY_ROTATION_HOURS",
                defaults::KEY_ROTATION_HOURS,
            )?),
            key_bits: env_parse("KEY_BITS", defaults::KEY_BITS)?,
            temp_pod_ready_timeout: Duration::from_secs(env_parse("TEMP_POD_READY_TIMEOUT_SECS", 300)?),
            cache_sync_timeout: Duration::from_secs(env_parse("CACHE_SYNC_TIMEOUT_SECS", 60)?),
            background_sync_interval: Duration::from_secs(env_parse(
                "BACKGROUND_SYNC_INTERVAL_SECS",
                300,
            )?),
            key_propagation_delay: Duration::from_secs(env_parse("KEY_PROPAGATION_DELAY_SECS", 15)?),
            exec_max_retries: env_parse("EXEC_MAX_RETRIES", 3)?,
            exec_backoff: Duration::from_millis(env_parse("EXEC_BACKOFF_MS", 1000)?),
            shutdown_timeout: Duration::from_secs(env_parse("SHUTDOWN_TIMEOUT_SECS", 30)?),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: "dr-syncer".to_string(),
            agent_namespace: "dr-syncer".to_string(),
            agent_ssh_port: defaults::SSH_PORT,
            temp_pod_image: defaults::TEMP_POD_IMAGE.to_string(),
            pvc_sync_concurrency: defaults::PVC_SYNC_CONCURRENCY,
            resource_sync_concurrency: defaults::RESOURCE_SYNC_CONCURRENCY,
            key_rotation: chrono::Duration::hours(defaults::KEY_ROTATION_HOURS),
            key_bits: defaults::KEY_BITS,
            temp_pod_ready_timeout: Duration::from_secs(300),
            cache_sync_timeout: Duration::from_secs(60),
            background_sync_interval: Duration::from_secs(300),
            key_propagation_delay: Duration::from_secs(15),
            exec_max_retries: 3,
            exec_backoff: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Agent daemon configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub namespace: String,
    /// Leader election identity
    pub pod_name: String,
    pub node_name: String,
    pub ssh_port: u16,
    pub sshd_path: PathBuf,
    /// Where the agent key secret's authorized_keys is projected
    pub keys_mount_path: PathBuf,
    /// Where sshd reads authorized keys from
    pub authorized_keys_path: PathBuf,
    pub secret_poll_interval: Duration,
    pub leader_election: bool,
    pub lease_name: String,
    pub key_rotation: chrono::Duration,
    pub key_bits: usize,
    pub shutdown_timeout: Duration,
}

impl AgentConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let node_name = env::var("NODE_NAME").context("NODE_NAME environment variable not set")?;
        let authorized_keys_path = match env::var("AUTHORIZED_KEYS_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => dirs::home_dir()
                .context("Cannot determine home directory for authorized_keys")?
                .join(".ssh")
                .join("authorized_keys"),
        };

        Ok(AgentConfig {
            namespace: env_string("POD_NAMESPACE", "dr-syncer"),
            pod_name: env::var("POD_NAME")
                .unwrap_or_else(|_| format!("dr-syncer-agent-{}", rand::random::<u32>())),
            node_name,
            ssh_port: env_parse("SSH_PORT", defaults::SSH_PORT)?,
            sshd_path: PathBuf::from(env_string("SSHD_PATH", "/usr/sbin/sshd")),
            keys_mount_path: PathBuf::from(env_string("KEYS_MOUNT_PATH", defaults::KEYS_MOUNT_PATH)),
            authorized_keys_path,
            secret_poll_interval: Duration::from_secs(env_parse("SECRET_POLL_INTERVAL_SECS", 10)?),
            leader_election: env_parse("LEADER_ELECTION", true)?,
            lease_name: env_string("LEASE_NAME", defaults::LEASE_NAME),
            key_rotation: chrono::Duration::hours(env_parse(
                "KEY_ROTATION_HOURS",
                defaults::KEY_ROTATION_HOURS,
            )?),
            key_bits: env_parse("KEY_BITS", defaults::KEY_BITS)?,
            shutdown_timeout: Duration::from_secs(env_parse("SHUTDOWN_TIMEOUT_SECS", 30)?),
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value '{}' for {}", raw, key)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_uses_default_when_unset() {
        let value: u16 = env_parse("DR_SYNCER_TEST_UNSET_PORT", 2222).unwrap();
        assert_eq!(value, 2222);
    }

    #[test]
    fn test_env_parse_reads_value() {
        env::set_var("DR_SYNCER_TEST_CONCURRENCY", " 7 ");
        let value: usize = env_parse("DR_SYNCER_TEST_CONCURRENCY", 3).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        env::set_var("DR_SYNCER_TEST_BAD_BOOL", "maybe");
        let result: Result<bool> = env_parse("DR_SYNCER_TEST_BAD_BOOL", true);
        assert!(result.is_err());
    }

    #[test]
    fn test_default_config_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.pvc_sync_concurrency, 3);
        assert_eq!(config.agent_ssh_port, 2222);
        assert_eq!(config.key_rotation, chrono::Duration::hours(24));
        assert_eq!(config.key_bits, 2048);
    }
}
