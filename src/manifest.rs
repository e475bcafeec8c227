use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use semver::Version;
use serde::Serialize;

use crate::core::config::ManifestSettings;
use crate::core::errors::ManifestError;

/// Versions offered by the upstream buildbot, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct VersionManifest {
    versions: Vec<String>,
    base_url: String,
    platform: String,
    archive_name: String,
    pub fetched_at: DateTime<Utc>,
}

impl VersionManifest {
    pub fn new(settings: &ManifestSettings, versions: Vec<String>) -> Self {
        Self {
            versions: sort_versions(versions),
            base_url: settings.base_url.clone(),
            platform: settings.platform.clone(),
            archive_name: settings.archive_name.clone(),
            fetched_at: Utc::now(),
        }
    }

    pub fn versions(&self) -> &[String] {
        &self.versions
    }

    pub fn latest(&self) -> Option<&str> {
        self.versions.first().map(String::as_str)
    }

    pub fn contains(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }

    pub fn archive_name(&self) -> &str {
        &self.archive_name
    }

    pub fn archive_url(&self, version: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            version,
            self.platform.trim_matches('/'),
            self.archive_name
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveInfo {
    pub version: String,
    pub url: String,
    pub size: Option<u64>,
    pub available: bool,
}

#[derive(Clone)]
pub struct ManifestClient {
    client: Client,
    settings: ManifestSettings,
}

impl ManifestClient {
    pub fn new(settings: ManifestSettings) -> Result<Self, ManifestError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self { client, settings })
    }

    pub async fn fetch(&self) -> Result<VersionManifest, ManifestError> {
        let response = self.client.get(&self.settings.base_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ManifestError::Status(status));
        }
        let body = response.text().await?;
        let versions = parse_index(&body);
        if versions.is_empty() {
            return Err(ManifestError::Empty);
        }
        tracing::info!(count = versions.len(), "Fetched version manifest");
        Ok(VersionManifest::new(&self.settings, versions))
    }

    /// HEAD probe of a version's archive. Transport failures report the
    /// archive as unavailable instead of failing.
    pub async fn archive_info(&self, manifest: &VersionManifest, version: &str) -> ArchiveInfo {
        let url = manifest.archive_url(version);
        let (size, available) = match self.client.head(&url).send().await {
            Ok(response) if response.status().is_success() => (
                response
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok()),
                true,
            ),
            Ok(response) => {
                tracing::debug!(status = %response.status(), url = %url, "Archive not available");
                (None, false)
            }
            Err(err) => {
                tracing::warn!(error = %err, url = %url, "Archive probe failed");
                (None, false)
            }
        };
        ArchiveInfo {
            version: version.to_string(),
            url,
            size,
            available,
        }
    }
}

/// Pulls `x.y.z` directory links out of the buildbot's HTML index.
pub fn parse_index(body: &str) -> Vec<String> {
    let Ok(pattern) = Regex::new(r#"href="(?:/stable/)?(\d+\.\d+\.\d+)/""#) else {
        return Vec::new();
    };
    let mut versions: Vec<String> = pattern
        .captures_iter(body)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();
    versions.sort();
    versions.dedup();
    sort_versions(versions)
}

fn sort_versions(mut versions: Vec<String>) -> Vec<String> {
    versions.sort_by(|a, b| compare_versions(b, a));
    versions
}

/// Semver order; strings that do not parse sort below every real version.
fn compare_versions(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::UpdaterConfig;

    const INDEX: &str = r#"
        <tr><td><a href="/stable/1.9.0/">1.9.0</a></td></tr>
        <tr><td><a href="/stable/1.20.0/">1.20.0</a></td></tr>
        <tr><td><a href="/stable/1.21.0/">1.21.0</a></td></tr>
        <tr><td><a href="/stable/1.20.0/">1.20.0</a></td></tr>
        <tr><td><a href="/stable/nightly/">nightly</a></td></tr>
    "#;

    #[test]
    fn parses_and_orders_versions_newest_first() {
        assert_eq!(parse_index(INDEX), vec!["1.21.0", "1.20.0", "1.9.0"]);
    }

    #[test]
    fn empty_index_yields_no_versions() {
        assert!(parse_index("<html></html>").is_empty());
    }

    #[test]
    fn unparsable_versions_sort_last() {
        let sorted = sort_versions(vec!["junk".to_string(), "1.0.0".to_string()]);
        assert_eq!(sorted, vec!["1.0.0", "junk"]);
    }

    #[test]
    fn builds_archive_url_for_member_version() {
        let settings = UpdaterConfig::default().manifest;
        let manifest = VersionManifest::new(
            &settings,
            vec!["1.20.0".to_string(), "1.21.0".to_string()],
        );

        assert_eq!(manifest.latest(), Some("1.21.0"));
        assert!(manifest.contains("1.20.0"));
        assert!(!manifest.contains("1.19.1"));
        assert_eq!(
            manifest.archive_url("1.21.0"),
            "https://buildbot.libretro.com/stable/1.21.0/linux/x86_64/RetroArch_cores.7z"
        );
    }
}
