use std::path::{Path, PathBuf};

use crate::error::{MailroomError, Result};

const DEFAULT_HTTP_PORT: u16 = 8765;
const DEFAULT_HTTP_PATH: &str = "/mcp/";

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub bearer_token: Option<String>,
    pub allow_localhost_unauthenticated: bool,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub root: PathBuf,
    pub git_author_name: String,
    pub git_author_email: String,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub enabled: bool,
    pub default_model: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub http: HttpSettings,
    pub storage: StorageSettings,
    pub llm: LlmSettings,
    pub contact_enforcement_enabled: bool,
    /// Default per-call budget applied by the RPC layer when the caller
    /// supplies no deadline of its own.
    pub default_op_timeout_secs: u64,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let settings = Self {
            http: HttpSettings {
                host: env_string("HTTP_HOST", "127.0.0.1"),
                port: env_parse("HTTP_PORT", DEFAULT_HTTP_PORT)?,
                path: env_string("HTTP_PATH", DEFAULT_HTTP_PATH),
                bearer_token: std::env::var("HTTP_BEARER_TOKEN")
                    .ok()
                    .filter(|t| !t.is_empty()),
                allow_localhost_unauthenticated: env_bool(
                    "HTTP_ALLOW_LOCALHOST_UNAUTHENTICATED",
                    true,
                )?,
            },
            storage: StorageSettings {
                root: PathBuf::from(env_string("STORAGE_ROOT", "./mailroom-data")),
                git_author_name: env_string("GIT_AUTHOR_NAME", "mailroom"),
                git_author_email: env_string("GIT_AUTHOR_EMAIL", "mailroom@localhost"),
            },
            llm: LlmSettings {
                enabled: env_bool("LLM_ENABLED", false)?,
                default_model: env_string("LLM_DEFAULT_MODEL", ""),
            },
            contact_enforcement_enabled: env_bool("CONTACT_ENFORCEMENT_ENABLED", true)?,
            default_op_timeout_secs: env_parse("OP_TIMEOUT_SECS", 30u64)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Settings rooted at an explicit storage directory, used by tests and
    /// by embedders that manage their own environment.
    pub fn for_storage_root(root: impl AsRef<Path>) -> Self {
        Self {
            http: HttpSettings {
                host: "127.0.0.1".to_string(),
                port: DEFAULT_HTTP_PORT,
                path: DEFAULT_HTTP_PATH.to_string(),
                bearer_token: None,
                allow_localhost_unauthenticated: true,
            },
            storage: StorageSettings {
                root: root.as_ref().to_path_buf(),
                git_author_name: "mailroom".to_string(),
                git_author_email: "mailroom@localhost".to_string(),
            },
            llm: LlmSettings {
                enabled: false,
                default_model: String::new(),
            },
            contact_enforcement_enabled: true,
            default_op_timeout_secs: 30,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.http.path.starts_with('/') {
            return Err(MailroomError::Config(format!(
                "HTTP_PATH must start with '/', got '{}'",
                self.http.path
            )));
        }
        if self.http.host.is_empty() {
            return Err(MailroomError::Config("HTTP_HOST must not be empty".into()));
        }
        if self.storage.git_author_name.is_empty() || self.storage.git_author_email.is_empty() {
            return Err(MailroomError::Config(
                "git author name and email must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.storage.root.join("store.sqlite3")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.storage.root.join("projects")
    }

    pub fn project_repo_dir(&self, slug: &str) -> PathBuf {
        self.projects_dir().join(slug).join("repo")
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| MailroomError::Config(format!("{key} has invalid value '{raw}'"))),
        _ => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(MailroomError::Config(format!(
                "{key} must be a boolean, got '{raw}'"
            ))),
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::for_storage_root("/tmp/mailroom-test");
        assert!(settings.validate().is_ok());
        assert_eq!(settings.http.port, 8765);
        assert_eq!(settings.http.path, "/mcp/");
        assert!(settings.index_db_path().ends_with("store.sqlite3"));
        assert!(settings
            .project_repo_dir("demo-abc")
            .ends_with("projects/demo-abc/repo"));
    }

    #[test]
    fn path_must_be_rooted() {
        let mut settings = Settings::for_storage_root("/tmp/x");
        settings.http.path = "mcp".into();
        assert!(settings.validate().is_err());
    }
}
