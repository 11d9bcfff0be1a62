use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::CredentialsError;
use crate::credentials::{Credentials, ProvideCredentials};

const DEFAULT_PROFILE: &str = "default";

/// Shared credentials file provider (`~/.aws/credentials`).
///
/// The file path comes from `AWS_SHARED_CREDENTIALS_FILE` when set, the profile from
/// `AWS_PROFILE` (falling back to `default`). Both are resolved on every call unless
/// pinned with [`ProfileFileProvider::with_path`].
#[derive(Debug, Clone, Default)]
pub struct ProfileFileProvider {
    path: Option<PathBuf>,
    profile: Option<String>,
}

impl ProfileFileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<PathBuf>, profile: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            profile: Some(profile.into()),
        }
    }

    fn resolve_path(&self) -> Option<PathBuf> {
        if let Some(p) = &self.path {
            return Some(p.clone());
        }
        if let Ok(v) = std::env::var("AWS_SHARED_CREDENTIALS_FILE")
            && !v.trim().is_empty()
        {
            return Some(PathBuf::from(v));
        }
        directories::BaseDirs::new().map(|d| d.home_dir().join(".aws").join("credentials"))
    }

    fn resolve_profile(&self) -> String {
        if let Some(p) = &self.profile {
            return p.clone();
        }
        std::env::var("AWS_PROFILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string())
    }
}

#[async_trait]
impl ProvideCredentials for ProfileFileProvider {
    async fn provide_credentials(&self) -> Result<Credentials, CredentialsError> {
        let Some(path) = self.resolve_path() else {
            return Err(CredentialsError::NotFound(
                "no home directory for shared credentials file".to_string(),
            ));
        };
        let profile = self.resolve_profile();

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialsError::NotFound(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
            Err(e) => return Err(CredentialsError::Io(e)),
        };

        let sections = parse_ini(&text);
        let Some(section) = sections.get(&profile) else {
            return Err(CredentialsError::NotFound(format!(
                "profile {profile} not in {}",
                path.display()
            )));
        };

        let Some(akid) = section.get("aws_access_key_id") else {
            return Err(CredentialsError::Invalid(format!(
                "profile {profile} has no aws_access_key_id"
            )));
        };
        let Some(secret) = section.get("aws_secret_access_key") else {
            return Err(CredentialsError::Invalid(format!(
                "profile {profile} has no aws_secret_access_key"
            )));
        };
        let token = section.get("aws_session_token").cloned();
        Credentials::new(akid.clone(), secret.clone(), token).validate()
    }
}

/// Minimal INI reader: `[section]` headers, `key = value` pairs, `#`/`;` comments.
///
/// Section names of the form `profile name` (config-file style) are normalized to `name`.
fn parse_ini(text: &str) -> HashMap<String, HashMap<String, String>> {
    let mut out: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim();
            let name = name.strip_prefix("profile ").unwrap_or(name).trim();
            current = Some(name.to_string());
            out.entry(name.to_string()).or_default();
            continue;
        }
        let (Some(section), Some((k, v))) = (current.as_ref(), line.split_once('=')) else {
            continue;
        };
        out.entry(section.clone())
            .or_default()
            .insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
    }

    out
}
