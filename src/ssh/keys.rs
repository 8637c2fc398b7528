// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! SSH key pairs persisted as secrets.
//!
//! Every namespace has one current "agent" identity stored in the secret
//! `dr-syncer-agent-keys`; its `authorized_keys` entry is what the agent's sshd
//! trusts. Data-plane operations mint short-lived "temporary" identities,
//! add their public key to the agent's authorized keys for the duration of a
//! copy, then remove it again.

use crate::constants::{annotations, labels, secrets, OPERATOR_NAME};
use crate::error::{is_conflict, is_not_found, DrSyncError, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::{Api, Client};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Read-modify-write attempts before giving up on a contended secret
const MAX_WRITE_ATTEMPTS: usize = 5;

/// An SSH identity and the trust blob stored alongside it
#[derive(Clone, Debug, PartialEq)]
pub struct KeyPair {
    /// PKCS#1 PEM
    pub private_key: String,
    /// OpenSSH `ssh-rsa` line
    pub public_key: String,
    pub authorized_keys: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl KeyPair {
    /// Read a key pair back from its secret. Returns None when the secret
    /// does not hold a complete pair.
    pub fn from_secret(secret: &Secret) -> Option<KeyPair> {
        let data = secret.data.as_ref()?;
        let text = |key: &str| {
            data.get(key)
                .and_then(|v| String::from_utf8(v.0.clone()).ok())
        };

        let private_key = text(secrets::PRIVATE_KEY)?;
        let public_key = text(secrets::PUBLIC_KEY)?;
        let authorized_keys = text(secrets::AUTHORIZED_KEYS).unwrap_or_default();

        let notes = secret.metadata.annotations.as_ref();
        let fingerprint = notes
            .and_then(|a| a.get(annotations::FINGERPRINT).cloned())
            .or_else(|| fingerprint_of(&public_key))?;
        // A pair without a readable creation time is treated as expired
        let created_at = notes
            .and_then(|a| a.get(annotations::CREATED_AT))
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Some(KeyPair {
            private_key,
            public_key,
            authorized_keys,
            fingerprint,
            created_at,
        })
    }

    fn secret_data(&self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (
                secrets::PRIVATE_KEY.to_string(),
                ByteString(self.private_key.clone().into_bytes()),
            ),
            (
                secrets::PUBLIC_KEY.to_string(),
                ByteString(self.public_key.clone().into_bytes()),
            ),
            (
                secrets::AUTHORIZED_KEYS.to_string(),
                ByteString(self.authorized_keys.clone().into_bytes()),
            ),
        ])
    }

    fn secret_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (annotations::FINGERPRINT.to_string(), self.fingerprint.clone()),
            (annotations::CREATED_AT.to_string(), self.created_at.to_rfc3339()),
        ])
    }
}

/// Generate an RSA key pair in OpenSSH form. The authorized-keys blob of a
/// fresh pair trusts only its own public key.
pub fn generate_key_pair(bits: usize, comment: &str) -> Result<KeyPair> {
    let mut rng = rand::rngs::OsRng;
    let key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| DrSyncError::KeyError(format!("Failed to generate RSA key: {}", e)))?;

    let private_key = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| DrSyncError::KeyError(format!("Failed to encode private key: {}", e)))?
        .to_string();

    let mut blob = Vec::new();
    put_string(&mut blob, b"ssh-rsa");
    put_mpint(&mut blob, &key.e().to_bytes_be());
    put_mpint(&mut blob, &key.n().to_bytes_be());

    let public_key = format!("ssh-rsa {} {}", STANDARD.encode(&blob), comment);
    let fingerprint = fingerprint_of_blob(&blob);

    Ok(KeyPair {
        authorized_keys: format!("{}\n", public_key),
        private_key,
        public_key,
        fingerprint,
        created_at: Utc::now(),
    })
}

/// OpenSSH SHA256 fingerprint of an `ssh-rsa AAAA... comment` line
pub fn fingerprint_of(public_key: &str) -> Option<String> {
    let encoded = public_key.split_whitespace().nth(1)?;
    let blob = STANDARD.decode(encoded).ok()?;
    Some(fingerprint_of_blob(&blob))
}

fn fingerprint_of_blob(blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(blob)))
}

fn put_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

fn put_mpint(buf: &mut Vec<u8>, big_endian: &[u8]) {
    let start = big_endian
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(big_endian.len());
    let digits = &big_endian[start..];
    if digits.first().is_some_and(|b| b & 0x80 != 0) {
        let mut padded = Vec::with_capacity(digits.len() + 1);
        padded.push(0);
        padded.extend_from_slice(digits);
        put_string(buf, &padded);
    } else {
        put_string(buf, digits);
    }
}

/// Key type and base64 body, ignoring the comment
fn key_identity(line: &str) -> Option<(&str, &str)> {
    let mut fields = line.split_whitespace();
    Some((fields.next()?, fields.next()?))
}

fn join_lines(lines: &[&str]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n", lines.join("\n"))
    }
}

/// Append a key to an authorized-keys blob. None if it is already present.
fn with_key(blob: &str, public_key: &str) -> Option<String> {
    let wanted = key_identity(public_key)?;
    let mut lines: Vec<&str> = blob.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.iter().any(|l| key_identity(l) == Some(wanted)) {
        return None;
    }
    lines.push(public_key.trim());
    Some(join_lines(&lines))
}

/// Drop a key from an authorized-keys blob. None if it was not present.
fn without_key(blob: &str, public_key: &str) -> Option<String> {
    let unwanted = key_identity(public_key)?;
    let lines: Vec<&str> = blob.lines().filter(|l| !l.trim().is_empty()).collect();
    let kept: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|l| key_identity(l) != Some(unwanted))
        .collect();
    if kept.len() == lines.len() {
        return None;
    }
    Some(join_lines(&kept))
}

/// Name of the secret holding a temporary identity
pub fn temp_secret_name(name: &str) -> String {
    format!("{}{}", secrets::TEMP_SECRET_PREFIX, name)
}

/// Manages agent and temporary key pairs stored as secrets
pub struct KeyManager {
    client: Client,
    rotation: chrono::Duration,
    bits: usize,
    temp_keys: Mutex<HashSet<(String, String)>>,
}

impl KeyManager {
    pub fn new(client: Client, rotation: chrono::Duration, bits: usize) -> Self {
        Self {
            client,
            rotation,
            bits,
            temp_keys: Mutex::new(HashSet::new()),
        }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn is_expired(&self, pair: &KeyPair) -> bool {
        Utc::now().signed_duration_since(pair.created_at) >= self.rotation
    }

    async fn generate(&self, namespace: &str) -> Result<KeyPair> {
        let bits = self.bits;
        let comment = format!("{}@{}", OPERATOR_NAME, namespace);
        tokio::task::spawn_blocking(move || generate_key_pair(bits, &comment))
            .await
            .map_err(|e| DrSyncError::KeyError(format!("Key generation task failed: {}", e)))?
    }

    /// Return the namespace's current agent identity, generating it when it is
    /// missing and rotating it in place once it is older than the rotation
    /// interval. Keys other than the agent's own stay in `authorized_keys`
    /// across a rotation.
    #[instrument(skip(self))]
    pub async fn ensure_agent_key_pair(&self, namespace: &str) -> Result<KeyPair> {
        let api = self.secrets(namespace);

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let existing = api.get_opt(secrets::AGENT_SECRET_NAME).await?;
            let current = existing.as_ref().and_then(KeyPair::from_secret);

            if let Some(pair) = current.as_ref().filter(|p| !self.is_expired(p)) {
                debug!("Agent key pair {} is current", pair.fingerprint);
                return Ok(pair.clone());
            }

            let mut pair = self.generate(namespace).await?;
            if let Some(old) = &current {
                info!(
                    "Rotating agent key pair {} in namespace {}",
                    old.fingerprint, namespace
                );
                let trusted = without_key(&old.authorized_keys, &old.public_key)
                    .unwrap_or_else(|| old.authorized_keys.clone());
                pair.authorized_keys =
                    with_key(&trusted, &pair.public_key).unwrap_or(trusted);
            } else {
                info!("Generating agent key pair in namespace {}", namespace);
            }

            let secret = key_secret(
                existing,
                namespace,
                secrets::AGENT_SECRET_NAME,
                &pair,
                false,
            );
            if write_secret(&api, secret).await?.is_some() {
                return Ok(pair);
            }
            debug!("Agent key secret changed concurrently, retrying");
        }

        Err(contended(namespace, secrets::AGENT_SECRET_NAME))
    }

    /// Return the temporary identity `name`, generating it on first use
    #[instrument(skip(self))]
    pub async fn ensure_temp_key_pair(&self, namespace: &str, name: &str) -> Result<KeyPair> {
        let api = self.secrets(namespace);
        let secret_name = temp_secret_name(name);

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let existing = api.get_opt(&secret_name).await?;
            if let Some(pair) = existing.as_ref().and_then(KeyPair::from_secret) {
                self.track(namespace, &secret_name);
                return Ok(pair);
            }

            let pair = self.generate(namespace).await?;
            let secret = key_secret(existing, namespace, &secret_name, &pair, true);
            if write_secret(&api, secret).await?.is_some() {
                info!("Created temporary key pair {}/{}", namespace, secret_name);
                self.track(namespace, &secret_name);
                return Ok(pair);
            }
        }

        Err(contended(namespace, &secret_name))
    }

    /// Trust `public_key` in the namespace's agent secret. Adding a key that
    /// is already trusted is a no-op.
    #[instrument(skip(self, public_key))]
    pub async fn add_authorized_key(&self, namespace: &str, public_key: &str) -> Result<()> {
        self.modify_authorized_keys(namespace, |blob| with_key(blob, public_key))
            .await
    }

    /// Stop trusting `public_key`. Removing an unknown key is a no-op.
    #[instrument(skip(self, public_key))]
    pub async fn remove_authorized_key(&self, namespace: &str, public_key: &str) -> Result<()> {
        self.modify_authorized_keys(namespace, |blob| without_key(blob, public_key))
            .await
    }

    async fn modify_authorized_keys<F>(&self, namespace: &str, change: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api = self.secrets(namespace);

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(mut secret) = api.get_opt(secrets::AGENT_SECRET_NAME).await? else {
                self.ensure_agent_key_pair(namespace).await?;
                continue;
            };

            let data = secret.data.get_or_insert_with(BTreeMap::new);
            let blob = data
                .get(secrets::AUTHORIZED_KEYS)
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .unwrap_or_default();

            let Some(updated) = change(&blob) else {
                debug!("Authorized keys in {} already up to date", namespace);
                return Ok(());
            };
            data.insert(
                secrets::AUTHORIZED_KEYS.to_string(),
                ByteString(updated.into_bytes()),
            );

            if write_secret(&api, secret).await?.is_some() {
                return Ok(());
            }
        }

        Err(contended(namespace, secrets::AGENT_SECRET_NAME))
    }

    /// Delete a temporary identity. Absence counts as success.
    #[instrument(skip(self))]
    pub async fn delete_temp_key_pair(&self, namespace: &str, name: &str) -> Result<()> {
        let secret_name = temp_secret_name(name);
        self.delete_secret(namespace, &secret_name).await?;
        self.untrack(namespace, &secret_name);
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, secret_name: &str) -> Result<()> {
        match self
            .secrets(namespace)
            .delete(secret_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!("Deleted key secret {}/{}", namespace, secret_name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every temporary identity this manager created. Failures are
    /// logged and the remaining secrets are still attempted.
    pub async fn cleanup_temp_keys(&self) -> usize {
        let tracked: Vec<(String, String)> = match self.temp_keys.lock() {
            Ok(keys) => keys.iter().cloned().collect(),
            Err(_) => return 0,
        };

        let mut removed = 0;
        for (namespace, secret_name) in tracked {
            match self.delete_secret(&namespace, &secret_name).await {
                Ok(()) => {
                    self.untrack(&namespace, &secret_name);
                    removed += 1;
                }
                Err(e) => warn!(
                    "Failed to delete temporary key {}/{}: {}",
                    namespace, secret_name, e
                ),
            }
        }
        removed
    }

    fn track(&self, namespace: &str, secret_name: &str) {
        if let Ok(mut keys) = self.temp_keys.lock() {
            keys.insert((namespace.to_string(), secret_name.to_string()));
        }
    }

    fn untrack(&self, namespace: &str, secret_name: &str) {
        if let Ok(mut keys) = self.temp_keys.lock() {
            keys.remove(&(namespace.to_string(), secret_name.to_string()));
        }
    }
}

/// Build the secret holding `pair`, reusing `existing` so a replace carries
/// its resource version
fn key_secret(
    existing: Option<Secret>,
    namespace: &str,
    name: &str,
    pair: &KeyPair,
    temporary: bool,
) -> Secret {
    let mut secret = existing.unwrap_or_else(|| Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        ..Default::default()
    });

    let marks = secret.metadata.labels.get_or_insert_with(BTreeMap::new);
    marks.insert(labels::MANAGED_BY.to_string(), OPERATOR_NAME.to_string());
    if temporary {
        marks.insert(labels::TEMP_KEY.to_string(), "true".to_string());
    }
    secret
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .extend(pair.secret_annotations());
    secret.data = Some(pair.secret_data());
    secret
}

/// Create or replace a secret. Returns None when another writer got there
/// first (already exists on create, stale resource version on replace).
async fn write_secret(api: &Api<Secret>, secret: Secret) -> Result<Option<Secret>> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let result = if secret.metadata.resource_version.is_some() {
        api.replace(&name, &PostParams::default(), &secret).await
    } else {
        api.create(&PostParams::default(), &secret).await
    };

    match result {
        Ok(written) => Ok(Some(written)),
        Err(e) if is_conflict(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn contended(namespace: &str, name: &str) -> DrSyncError {
    DrSyncError::KeyError(format!(
        "Gave up writing secret {}/{} after {} conflicting attempts",
        namespace, name, MAX_WRITE_ATTEMPTS
    ))
}
