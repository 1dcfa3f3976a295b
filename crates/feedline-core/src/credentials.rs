//! API and notification credentials, loaded once per run
//!
//! Lookup order: credentials TOML file, then `FEEDLINE_*` environment
//! variables. Values are opaque strings and are never validated or logged.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;

use crate::error::IngestError;

pub const ENV_API_KEY: &str = "FEEDLINE_API_KEY";
pub const ENV_API_SECRET: &str = "FEEDLINE_API_SECRET";
pub const ENV_ACCESS_TOKEN: &str = "FEEDLINE_ACCESS_TOKEN";
pub const ENV_ACCESS_TOKEN_SECRET: &str = "FEEDLINE_ACCESS_TOKEN_SECRET";
pub const ENV_NOTIFY_USERNAME: &str = "FEEDLINE_NOTIFY_USERNAME";
pub const ENV_NOTIFY_PASSWORD: &str = "FEEDLINE_NOTIFY_PASSWORD";

const REDACTED: &str = "***";

/// Stream API credentials.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &REDACTED)
            .field("api_secret", &REDACTED)
            .field("access_token", &REDACTED)
            .field("access_token_secret", &REDACTED)
            .finish()
    }
}

/// Login for the notification transport.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct NotifyCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for NotifyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyCredentials")
            .field("username", &self.username)
            .field("password", &REDACTED)
            .finish()
    }
}

/// On-disk layout:
///
/// ```toml
/// [stream]
/// api_key = "..."
/// api_secret = "..."
/// access_token = "..."
/// access_token_secret = "..."
///
/// [notify]
/// username = "..."
/// password = "..."
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CredentialsFile {
    stream: Option<Credentials>,
    notify: Option<NotifyCredentials>,
}

#[derive(Debug, Default)]
struct Loaded {
    stream: Option<Credentials>,
    notify: Option<NotifyCredentials>,
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Default credentials file: `<config_dir>/feedline/credentials.toml`.
pub fn default_credentials_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "feedline")
        .map(|dirs| dirs.config_dir().join("credentials.toml"))
}

/// Loads credentials lazily, at most once, and hands out copies.
pub struct CredentialProvider {
    path: Option<PathBuf>,
    env: EnvLookup,
    loaded: OnceLock<Result<Loaded, String>>,
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("path", &self.path)
            .field("loaded", &self.loaded.get().is_some())
            .finish_non_exhaustive()
    }
}

impl CredentialProvider {
    /// Provider reading `path` (if it exists) and the process environment.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self::with_env(path, |name| std::env::var(name).ok())
    }

    /// Provider with an injected environment lookup.
    pub fn with_env(
        path: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            path,
            env: Box::new(env),
            loaded: OnceLock::new(),
        }
    }

    /// Stream credentials, or a configuration error naming where to put them.
    pub fn stream(&self) -> Result<Credentials, IngestError> {
        let loaded = self.load()?;
        loaded.stream.clone().ok_or_else(|| {
            IngestError::Config(format!(
                "no stream credentials: set {ENV_API_KEY}, {ENV_API_SECRET}, \
                 {ENV_ACCESS_TOKEN}, {ENV_ACCESS_TOKEN_SECRET} or add a [stream] \
                 section to {}",
                self.describe_path()
            ))
        })
    }

    /// Notification login, if configured anywhere.
    pub fn notify(&self) -> Option<NotifyCredentials> {
        match self.load() {
            Ok(loaded) => loaded.notify.clone(),
            Err(e) => {
                log::warn!("{e}");
                None
            }
        }
    }

    fn describe_path(&self) -> String {
        self.path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "the credentials file".to_string())
    }

    fn load(&self) -> Result<&Loaded, IngestError> {
        self.loaded
            .get_or_init(|| self.load_uncached())
            .as_ref()
            .map_err(|msg| IngestError::Config(msg.clone()))
    }

    fn load_uncached(&self) -> Result<Loaded, String> {
        let file = match self.path.as_deref() {
            Some(path) if path.exists() => read_file(path)?,
            Some(path) => {
                log::debug!("No credentials file at {}", path.display());
                CredentialsFile::default()
            }
            None => CredentialsFile::default(),
        };

        let stream = match file.stream {
            Some(creds) => Some(creds),
            None => self.stream_from_env(),
        };
        let notify = match file.notify {
            Some(creds) => Some(creds),
            None => self.notify_from_env(),
        };
        Ok(Loaded { stream, notify })
    }

    fn stream_from_env(&self) -> Option<Credentials> {
        let names = [
            ENV_API_KEY,
            ENV_API_SECRET,
            ENV_ACCESS_TOKEN,
            ENV_ACCESS_TOKEN_SECRET,
        ];
        let [api_key, api_secret, access_token, access_token_secret] =
            self.env_group(names)?;
        Some(Credentials {
            api_key,
            api_secret,
            access_token,
            access_token_secret,
        })
    }

    fn notify_from_env(&self) -> Option<NotifyCredentials> {
        let [username, password] = self.env_group([ENV_NOTIFY_USERNAME, ENV_NOTIFY_PASSWORD])?;
        Some(NotifyCredentials { username, password })
    }

    /// All-or-nothing lookup of related variables; a partial set is logged.
    fn env_group<const N: usize>(&self, names: [&str; N]) -> Option<[String; N]> {
        let values = names.map(|name| (self.env)(name).filter(|v| !v.is_empty()));
        let missing: Vec<&str> = names
            .iter()
            .zip(&values)
            .filter(|(_, v)| v.is_none())
            .map(|(name, _)| *name)
            .collect();
        if missing.len() == N {
            return None;
        }
        if !missing.is_empty() {
            log::warn!(
                "Ignoring incomplete credentials in environment, missing: {}",
                missing.join(", ")
            );
            return None;
        }
        Some(values.map(Option::unwrap_or_default))
    }
}

fn read_file(path: &Path) -> Result<CredentialsFile, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read credentials file {}: {e}", path.display()))?;
    let file = toml::from_str(&content)
        .map_err(|e| format!("failed to parse credentials file {}: {e}", path.display()))?;
    log::debug!("Loaded credentials from {}", path.display());
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn reads_full_environment() {
        let provider = CredentialProvider::with_env(
            None,
            env_of(&[
                (ENV_API_KEY, "k"),
                (ENV_API_SECRET, "s"),
                (ENV_ACCESS_TOKEN, "t"),
                (ENV_ACCESS_TOKEN_SECRET, "ts"),
            ]),
        );
        let creds = provider.stream().unwrap();
        assert_eq!(creds.api_key, "k");
        assert_eq!(creds.access_token_secret, "ts");
        assert!(provider.notify().is_none());
    }

    #[test]
    fn partial_environment_is_missing() {
        let provider =
            CredentialProvider::with_env(None, env_of(&[(ENV_API_KEY, "k"), (ENV_API_SECRET, "")]));
        let err = provider.stream().unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn file_takes_precedence_over_environment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.toml");
        std::fs::write(
            &path,
            r#"
[stream]
api_key = "file-key"
api_secret = "file-secret"
access_token = "file-token"
access_token_secret = "file-token-secret"

[notify]
username = "ops"
password = "hunter2"
"#,
        )
        .unwrap();

        let provider = CredentialProvider::with_env(
            Some(path),
            env_of(&[
                (ENV_API_KEY, "env"),
                (ENV_API_SECRET, "env"),
                (ENV_ACCESS_TOKEN, "env"),
                (ENV_ACCESS_TOKEN_SECRET, "env"),
            ]),
        );
        assert_eq!(provider.stream().unwrap().api_key, "file-key");
        assert_eq!(provider.notify().unwrap().username, "ops");
    }

    #[test]
    fn unparseable_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.toml");
        std::fs::write(&path, "[stream\n").unwrap();
        let provider = CredentialProvider::with_env(Some(path), env_of(&[]));
        assert!(matches!(provider.stream(), Err(IngestError::Config(_))));
    }

    #[test]
    fn debug_redacts_secrets() {
        let creds = Credentials {
            api_key: "k-secret".into(),
            api_secret: "s-secret".into(),
            access_token: "t-secret".into(),
            access_token_secret: "ts-secret".into(),
        };
        let shown = format!("{creds:?}");
        assert!(!shown.contains("k-secret"));

        let notify = NotifyCredentials {
            username: "ops".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{notify:?}").contains("hunter2"));
    }
}
