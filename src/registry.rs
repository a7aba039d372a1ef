//! Package-registry lookups
//!
//! Resolves the latest published version of a package from the npm registry
//! or PyPI. Lookups are best-effort: any network error, timeout, or missing
//! package yields `None` and the caller skips that dependency for the
//! current detection cycle.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::model::Ecosystem;

/// Response from `https://registry.npmjs.org/{name}/latest`.
#[derive(Debug, Deserialize)]
struct NpmLatest {
    version: String,
}

/// Response from `https://pypi.org/pypi/{name}/json`.
#[derive(Debug, Deserialize)]
struct PypiResponse {
    info: PypiInfo,
}

#[derive(Debug, Deserialize)]
struct PypiInfo {
    version: String,
}

pub struct RegistryClient {
    client: reqwest::Client,
}

impl RegistryClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("remedy/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to create registry HTTP client")?;
        Ok(Self { client })
    }

    /// Latest published version of `name`, or `None` when it cannot be
    /// resolved. Never retries; one miss excludes the dependency from this
    /// cycle only.
    pub async fn latest_version(&self, ecosystem: Ecosystem, name: &str) -> Option<String> {
        match self.fetch(ecosystem, name).await {
            Ok(version) => Some(version),
            Err(err) => {
                tracing::debug!(package = name, ecosystem = ecosystem.label(), %err, "registry lookup failed");
                None
            }
        }
    }

    async fn fetch(&self, ecosystem: Ecosystem, name: &str) -> Result<String> {
        let url = endpoint(ecosystem, name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Registry returned an error for {}", name))?;

        match ecosystem {
            Ecosystem::Npm => {
                let latest: NpmLatest = response
                    .json()
                    .await
                    .context("Failed to parse npm registry response")?;
                Ok(latest.version)
            }
            Ecosystem::Pip => {
                let latest: PypiResponse = response
                    .json()
                    .await
                    .context("Failed to parse PyPI response")?;
                Ok(latest.info.version)
            }
        }
    }
}

fn endpoint(ecosystem: Ecosystem, name: &str) -> String {
    match ecosystem {
        Ecosystem::Npm => format!("https://registry.npmjs.org/{}/latest", name),
        Ecosystem::Pip => format!("https://pypi.org/pypi/{}/json", name),
    }
}
