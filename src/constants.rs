// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// The operator name used for server-side apply and managed-by labels
pub const OPERATOR_NAME: &str = "dr-syncer";

/// API group of the mapping resources
pub const API_GROUP: &str = "dr-syncer.io";

/// Finalizer placed on NamespaceMappings so runtimes are torn down on delete
pub const FINALIZER: &str = "dr-syncer.io/finalizer";

/// Kubernetes annotation keys used by dr-syncer
pub mod annotations {
    /// Prefix shared by every dr-syncer annotation; stripped from replicated objects
    pub const PREFIX: &str = "dr-syncer.io/";
    /// Changing this value on a Manual NamespaceMapping triggers a sync pass
    pub const SYNC_NOW: &str = "dr-syncer.io/sync-now";
    /// Replica count of a Deployment before scale-to-zero
    pub const ORIGINAL_REPLICAS: &str = "dr-syncer.io/original-replicas";
    /// When "true" on a source Deployment, its replica count is kept
    pub const SCALE_OVERRIDE: &str = "dr-syncer.io/scale-override";
    /// SHA256 fingerprint of the key pair held by a key secret
    pub const FINGERPRINT: &str = "dr-syncer.io/fingerprint";
    /// RFC 3339 creation time of a key pair or temp pod
    pub const CREATED_AT: &str = "dr-syncer.io/created-at";
    /// kubectl client-side apply bookkeeping, never replicated
    pub const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";
}

/// Kubernetes label keys and values used by dr-syncer
pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    /// Marker label carried by every temp pod
    pub const TEMP_POD: &str = "dr-syncer.io/temp-pod";
    /// Marker label carried by every temporary key secret
    pub const TEMP_KEY: &str = "dr-syncer.io/temp-key";
    /// Set on every object written into a destination namespace
    pub const REPLICATED: &str = "dr-syncer.io/replicated";
    /// PVC a temp pod mounts
    pub const TEMP_POD_PVC: &str = "dr-syncer.io/pvc";
    /// Selector for agent pods
    pub const AGENT_SELECTOR: &str = "app.kubernetes.io/name=dr-syncer-agent";
}

/// Secret keys and names for SSH material
pub mod secrets {
    pub const PRIVATE_KEY: &str = "id_rsa";
    pub const PUBLIC_KEY: &str = "id_rsa.pub";
    pub const AUTHORIZED_KEYS: &str = "authorized_keys";
    pub const AGENT_SECRET_NAME: &str = "dr-syncer-agent-keys";
    pub const TEMP_SECRET_PREFIX: &str = "dr-syncer-temp-key-";
}

/// Default values for configuration and spec fields
pub mod defaults {
    pub const SSH_PORT: u16 = 2222;
    pub const KEY_BITS: usize = 2048;
    pub const KEY_ROTATION_HOURS: i64 = 24;
    pub const TEMP_POD_IMAGE: &str = "instrumentisto/rsync-ssh:latest";
    pub const TEMP_POD_MOUNT_PATH: &str = "/data";
    pub const TEMP_KEY_MOUNT_PATH: &str = "/etc/dr-syncer/ssh";
    pub const PVC_SYNC_CONCURRENCY: usize = 3;
    pub const RESOURCE_SYNC_CONCURRENCY: usize = 4;
    pub const SCHEDULE: &str = "*/15 * * * *";
    pub const KEYS_MOUNT_PATH: &str = "/etc/ssh/keys/authorized_keys";
    pub const KUBELET_PODS_DIR: &str = "/var/lib/kubelet/pods";
    pub const KUBECONFIG_KEY: &str = "kubeconfig";
    pub const LEASE_NAME: &str = "dr-syncer-agent-leader";
}

/// Temp pod readiness polling
pub mod pod_wait {
    /// First poll interval in milliseconds
    pub const BASE_INTERVAL_MS: u64 = 1000;
    /// Growth factor between polls
    pub const FACTOR: f64 = 1.5;
    /// Upper bound on a single poll interval in milliseconds
    pub const MAX_INTERVAL_MS: u64 = 30_000;
}

/// CRD polling configuration
pub mod crd {
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}

/// Agent singleton duties
pub mod agent_duties {
    /// How often the leader refreshes key material and sweeps temp pods
    pub const INTERVAL_SECS: u64 = 60;
    /// Temp pods older than this are considered leaked
    pub const STALE_TEMP_POD_MINUTES: i64 = 60;
}
