//! Default and loaded installer configuration.

use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use xdg::BaseDirectories;

/// Execution models that run each request in a separate interpreter process.
const RESTRICTIVE_SERVER_APIS: [&str; 2] = ["cgi", "fpm"];

#[derive(Deserialize, Debug)]
#[serde(default)]
pub(crate) struct Toml {
    /// One time passphrase, at least six characters.
    pub passphrase: Option<String>,
    /// GitHub `owner/name` the application is released from.
    pub repo: String,
    /// Local name of the archive, without extension.
    pub archive_base_name: String,
    /// Tag of the last official release.
    pub official_release_tag: String,
    /// File that marks a directory as the extracted application.
    pub entry_point: PathBuf,
    /// Permission modes offered by `chmod`.
    pub folder_permissions: Vec<String>,
    /// Whether remote URLs may be opened as plain streams.
    pub allow_url_stream: bool,
    /// Capabilities switched off on this host.
    pub disabled_functions: Vec<String>,
    /// Initial execution budget in seconds, zero means unlimited.
    pub max_execution_time: u64,
    /// Host execution model, e.g. `cgi-fcgi`, `fpm-fcgi` or `apache2handler`.
    pub server_api: Option<String>,
    /// Largest tar entry accepted, in bytes.
    pub max_entry_size: u64,
    /// Leading folder removed from tar entry names.
    pub tar_remove_prefix: Option<String>,
    /// Directories searched for external tools before `which` and `PATH`.
    pub tool_dirs: Vec<PathBuf>,
    /// Working directory override.
    pub working_dir: Option<PathBuf>,
}

impl Default for Toml {
    fn default() -> Self {
        Self {
            passphrase: None,
            repo: "dakanji/G2Project-main".into(),
            archive_base_name: "gallery2".into(),
            official_release_tag: "v2.3.2".into(),
            entry_point: PathBuf::from("install/index.php"),
            folder_permissions: vec!["777".into(), "755".into(), "555".into()],
            allow_url_stream: true,
            disabled_functions: Vec::new(),
            max_execution_time: 900,
            server_api: None,
            max_entry_size: 4 << 30,
            tar_remove_prefix: None,
            tool_dirs: Vec::new(),
            working_dir: None,
        }
    }
}

pub(crate) struct Config {
    pub toml: Toml,
    working_dir: PathBuf,
}

impl Config {
    /// Load configuration or create a default one.
    pub(crate) fn new(working_dir: Option<PathBuf>) -> Result<Self> {
        let base_dir = BaseDirectories::with_prefix(env!("CARGO_PKG_NAME"));

        let toml = base_dir
            .find_config_file("preinstall.toml")
            .map(std::fs::read_to_string)
            .transpose()?
            .map(|content| toml::from_str(&content))
            .transpose()?
            .unwrap_or_default();

        Self::from_toml(toml, working_dir)
    }

    /// Build a configuration from already parsed settings.
    pub(crate) fn from_toml(toml: Toml, working_dir: Option<PathBuf>) -> Result<Self> {
        let working_dir = match working_dir.or_else(|| toml.working_dir.clone()) {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };

        if !working_dir.is_dir() {
            return Err(anyhow!(
                "working directory {} does not exist",
                working_dir.display()
            ));
        }

        Ok(Self { toml, working_dir })
    }

    /// Directory everything is downloaded to and extracted into.
    pub(crate) fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Path of the local archive for `extension`.
    pub(crate) fn archive_path(&self, extension: &str) -> PathBuf {
        self.working_dir
            .join(format!("{}.{extension}", self.toml.archive_base_name))
    }

    /// Return the host execution model. If not configured, a CGI gateway is assumed whenever
    /// `GATEWAY_INTERFACE` is set.
    pub(crate) fn server_api(&self) -> String {
        if let Some(api) = &self.toml.server_api {
            return api.to_ascii_lowercase();
        }

        match std::env::var("GATEWAY_INTERFACE") {
            Ok(_) => "cgi".into(),
            Err(_) => "cli".into(),
        }
    }

    /// Whether freshly extracted folders should be kept at restrictive permissions.
    pub(crate) fn is_restrictive_runtime(&self) -> bool {
        let api = self.server_api();
        RESTRICTIVE_SERVER_APIS
            .iter()
            .any(|restrictive| api.contains(restrictive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() -> Result<()> {
        let toml: Toml = toml::from_str("passphrase = \"secret123\"\nrepo = \"foo/bar\"")?;
        assert_eq!(toml.passphrase.as_deref(), Some("secret123"));
        assert_eq!(toml.repo, "foo/bar");
        assert_eq!(toml.archive_base_name, "gallery2");
        assert_eq!(toml.folder_permissions, ["777", "755", "555"]);
        assert!(toml.allow_url_stream);
        Ok(())
    }

    #[test]
    fn archive_path_uses_base_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::from_toml(Toml::default(), Some(dir.path().to_path_buf()))?;
        assert_eq!(config.archive_path("tar.gz"), dir.path().join("gallery2.tar.gz"));
        Ok(())
    }

    #[test]
    fn missing_working_dir_is_rejected() {
        let result = Config::from_toml(Toml::default(), Some(PathBuf::from("/nonexistent/dir")));
        assert!(result.is_err());
    }

    #[test]
    fn restrictive_runtime_detection() -> Result<()> {
        let dir = tempfile::tempdir()?;

        for (api, restrictive) in [("cgi-fcgi", true), ("fpm-fcgi", true), ("apache2handler", false)] {
            let toml = Toml {
                server_api: Some(api.into()),
                ..Toml::default()
            };
            let config = Config::from_toml(toml, Some(dir.path().to_path_buf()))?;
            assert_eq!(config.is_restrictive_runtime(), restrictive, "{api}");
        }

        Ok(())
    }
}
