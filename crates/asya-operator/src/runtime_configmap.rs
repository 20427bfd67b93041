// SPDX-License-Identifier: MIT OR Apache-2.0
//! The shared runtime-script ConfigMap.
//!
//! One authoritative script, loaded from the configured source, written
//! once at operator startup (and on source change), mounted read-only
//! into every actor pod. Mirroring into actor namespaces happens during
//! actor reconcile, since pods can only mount ConfigMaps from their own
//! namespace.

use crate::config::RuntimeScriptSource;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Name of the ConfigMap in every namespace it lands in.
pub const RUNTIME_CONFIGMAP_NAME: &str = "asya-runtime";
/// Key holding the script body; also its filename at the mount point.
pub const RUNTIME_SCRIPT_KEY: &str = "asya-runtime.py";

const FIELD_MANAGER: &str = "asya-operator";

/// Errors from loading or reconciling the runtime script.
#[derive(Debug, Error)]
pub enum RuntimeScriptError {
    /// Local file read failed.
    #[error("failed to read runtime script {path}: {source}")]
    Read {
        /// Configured path.
        path: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// Release download failed.
    #[error("failed to fetch runtime script from {url}: {reason}")]
    Fetch {
        /// Release URL.
        url: String,
        /// HTTP-level detail.
        reason: String,
    },

    /// The fetched script did not match the pinned digest.
    #[error("runtime script digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Pinned sha256.
        expected: String,
        /// Computed sha256.
        actual: String,
    },

    /// The loaded script is empty; shipping it would break every actor.
    #[error("runtime script is empty")]
    Empty,

    /// Kubernetes API failure.
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// Load the script content from the configured source.
pub async fn load_script(source: &RuntimeScriptSource) -> Result<String, RuntimeScriptError> {
    let content = match source {
        RuntimeScriptSource::File { file } => tokio::fs::read_to_string(file)
            .await
            .map_err(|source| RuntimeScriptError::Read {
                path: file.display().to_string(),
                source,
            })?,
        RuntimeScriptSource::Release { url, sha256 } => {
            let response = reqwest::get(url)
                .await
                .map_err(|e| RuntimeScriptError::Fetch {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
            if !response.status().is_success() {
                return Err(RuntimeScriptError::Fetch {
                    url: url.clone(),
                    reason: format!("status {}", response.status()),
                });
            }
            let body = response.text().await.map_err(|e| RuntimeScriptError::Fetch {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            if let Some(expected) = sha256 {
                let actual = hex_digest(&body);
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(RuntimeScriptError::DigestMismatch {
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            body
        }
    };
    if content.trim().is_empty() {
        return Err(RuntimeScriptError::Empty);
    }
    Ok(content)
}

fn hex_digest(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Standard identification labels on the ConfigMap.
fn configmap_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "asya-runtime".to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "asya-operator".to_string(),
        ),
    ])
}

/// Desired shape of the ConfigMap for a given script body.
pub fn desired_configmap(namespace: &str, content: &str) -> ConfigMap {
    ConfigMap {
        metadata: kube::api::ObjectMeta {
            name: Some(RUNTIME_CONFIGMAP_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(configmap_labels()),
            ..kube::api::ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(
            RUNTIME_SCRIPT_KEY.to_string(),
            content.to_string(),
        )])),
        ..ConfigMap::default()
    }
}

/// Create or update the ConfigMap in a namespace; no-op when the cluster
/// copy already matches.
pub async fn ensure_configmap(
    client: Client,
    namespace: &str,
    content: &str,
) -> Result<(), RuntimeScriptError> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    if let Some(existing) = api.get_opt(RUNTIME_CONFIGMAP_NAME).await? {
        let current = existing
            .data
            .as_ref()
            .and_then(|d| d.get(RUNTIME_SCRIPT_KEY));
        if current.map(String::as_str) == Some(content) {
            debug!(namespace = %namespace, "runtime configmap already current");
            return Ok(());
        }
    }
    let desired = desired_configmap(namespace, content);
    api.patch(
        RUNTIME_CONFIGMAP_NAME,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&desired),
    )
    .await?;
    info!(namespace = %namespace, bytes = content.len(), "runtime configmap written");
    Ok(())
}

/// Delete the ConfigMap from a namespace; missing is fine.
pub async fn delete_configmap(client: Client, namespace: &str) -> Result<(), RuntimeScriptError> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    match api
        .delete(RUNTIME_CONFIGMAP_NAME, &kube::api::DeleteParams::default())
        .await
    {
        Ok(_) => {
            info!(namespace = %namespace, "runtime configmap deleted");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
