//! Drives the download, extraction and post-install steps.
//!
//! Nothing is remembered between invocations: the state of an installation is derived from
//! what is on disk in the working directory every time. Two invocations running at the same
//! time against the same directory are not supported.

use crate::config::Config;
use crate::extract::{self, ArchiveExtension, ExtractionMethod};
use crate::gh::{Channel, Channels};
use crate::platform::Platform;
use crate::tarball;
use crate::transfer::{self, TransferMethod};
use anyhow::{Context, Result, anyhow};
use regex::Regex;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static METHOD_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+$").expect("compiling the regex"));

static EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z]{2,4}\.)?[a-z]{2,4}$").expect("compiling the regex"));

static CHMOD_FOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w+(\.\w+)*$").expect("compiling the regex"));

static RENAME_FOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w+$").expect("compiling the regex"));

const RESTRICTIVE_MODE: u32 = 0o755;
const PERMISSIVE_MODE: u32 = 0o777;

/// The working directory cannot be written to.
#[derive(Debug)]
pub(crate) struct Unwritable {
    pub dir: PathBuf,
}

impl Unwritable {
    /// Suggested fix for the operator.
    pub(crate) fn fix(&self) -> String {
        let name = self
            .dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string());

        format!("chmod 777 {name}")
    }
}

impl Display for Unwritable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "working directory {} is not writable", self.dir.display())
    }
}

impl std::error::Error for Unwritable {}

/// Installation progress as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum State {
    NoArchive,
    ArchivePresent,
    /// Extracted into the named folder.
    Extracted(String),
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::NoArchive => write!(
                f,
                "No archive in current working directory, please start with a download"
            ),
            State::ArchivePresent => write!(f, "Archive ready for extraction"),
            State::Extracted(folder) => {
                write!(f, "Ready for installation (folder '{folder}' found)")
            }
        }
    }
}

/// Everything the status page renders.
#[derive(Debug)]
pub(crate) struct Status {
    pub state: State,
    pub transfer_methods: Vec<transfer::Descriptor>,
    pub extraction_methods: Vec<extract::Descriptor>,
    pub stable_tag: String,
    pub release_candidate_tag: String,
    pub show_tag_release: bool,
    pub show_stable_release: bool,
}

pub(crate) struct Installer {
    config: Config,
    platform: Platform,
    channels: Channels,
}

impl Installer {
    pub(crate) fn new(config: Config, platform: Platform, channels: Channels) -> Self {
        Self {
            config,
            platform,
            channels,
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.platform.is_working_directory_writable() {
            Ok(())
        } else {
            Err(Unwritable {
                dir: self.config.working_dir().to_path_buf(),
            }
            .into())
        }
    }

    /// URL to download the archive of `channel` in `extension` format from.
    pub(crate) fn resolve_download_url(&self, channel: Channel, extension: ArchiveExtension) -> String {
        let base = self.channels.base_url(channel);

        // Release API links already point at an archive, in zip format.
        if channel.is_dynamic() && base.contains("/zipball/") {
            return match extension {
                ArchiveExtension::Zip => base.to_string(),
                ArchiveExtension::TarGz => base.replace("/zipball/", "/tarball/"),
            };
        }

        format!("{base}.{extension}")
    }

    /// Download the archive of `channel` with the transfer method `method`.
    pub(crate) async fn perform_transfer(
        &self,
        method: &str,
        channel: &str,
        extension: &str,
    ) -> Result<String> {
        let method = method.trim();

        let method = METHOD_ID
            .is_match(method)
            .then(|| TransferMethod::from_id(method))
            .flatten()
            .ok_or_else(|| anyhow!("download method is not defined or does not exist"))?;

        let extension = extension.trim();

        if !EXTENSION.is_match(extension) {
            return Err(anyhow!("filetype for download not defined, please retry"));
        }

        let extension = extension.parse().unwrap_or(ArchiveExtension::Zip);
        let channel = channel.trim().parse().unwrap_or(Channel::Stable);

        if !method.is_supported(&self.platform) {
            return Err(anyhow!(
                "download method \"{}\" is not supported by this server",
                method.name()
            ));
        }

        self.ensure_writable()?;

        let archive = self.config.archive_path(extension.as_str());

        if archive.exists() {
            log::info!("removing previous archive {}", archive.display());
            std::fs::remove_file(&archive)
                .with_context(|| format!("could not remove {}", archive.display()))?;
        }

        let url = self.resolve_download_url(channel, extension);

        // Partial downloads stay in the temporary file and are removed on failure.
        let partial = tempfile::Builder::new()
            .prefix(".preinstall-")
            .suffix(&format!(".{extension}"))
            .tempfile_in(self.config.working_dir())?;

        method.download(&url, partial.path(), &self.platform).await?;
        partial.persist(&archive)?;

        if !archive.is_file() {
            return Err(anyhow!(
                "download failed, local file {} does not exist",
                archive.display()
            ));
        }

        if let Err(err) = set_mode(&archive, PERMISSIVE_MODE) {
            log::warn!("could not change permissions of {}: {err}", archive.display());
        }

        Ok(format!("file successfully downloaded from {url}"))
    }

    /// Extract the local archive with the extraction method `method`.
    pub(crate) fn perform_extraction(&self, method: &str) -> Result<String> {
        let method = method.trim();

        let method = METHOD_ID
            .is_match(method)
            .then(|| ExtractionMethod::from_id(method))
            .flatten()
            .ok_or_else(|| anyhow!("extraction method is not defined or does not exist"))?;

        if !method.is_supported(&self.platform) {
            return Err(anyhow!(
                "extraction method \"{}\" is not supported by this server",
                method.name()
            ));
        }

        self.ensure_writable()?;

        let archive = self.config.archive_path(method.extension().as_str());

        if !archive.is_file() {
            return Err(anyhow!(
                "archive {} does not exist in the current working directory",
                archive.display()
            ));
        }

        let options = tarball::Options {
            remove_prefix: self.config.toml.tar_remove_prefix.clone(),
            max_entry_size: self.config.toml.max_entry_size,
            ..tarball::Options::new(self.config.working_dir())
        };
        let summary = method.extract(&archive, &options, &self.platform)?;

        let folder = self.find_extracted_root().ok_or_else(|| {
            anyhow!("extraction was successful, but coarse integrity check failed")
        })?;

        let mut message = format!("archive successfully extracted into {folder}: {summary}");
        let path = self.config.working_dir().join(&folder);

        let mode = if self.config.is_restrictive_runtime() {
            RESTRICTIVE_MODE
        } else {
            message.push_str(&format!(
                "\nwarning: {folder} is world writable, tighten its permissions once the installation is done"
            ));
            PERMISSIVE_MODE
        };

        if let Err(err) = set_mode(&path, mode) {
            log::warn!("could not change permissions of {}: {err}", path.display());
        }

        Ok(message)
    }

    /// Name of the folder in the working directory that contains the application entry point.
    /// The conventional folder name is preferred, otherwise the first match wins.
    pub(crate) fn find_extracted_root(&self) -> Option<String> {
        let dir = self.config.working_dir();
        let entry_point = &self.config.toml.entry_point;
        let conventional = &self.config.toml.archive_base_name;

        if dir.join(conventional).join(entry_point).is_file() {
            return Some(conventional.clone());
        }

        if !self.platform.is_callable_supported("read_dir") {
            return None;
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("could not list {}: {err}", dir.display());
                return None;
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .find(|entry| entry.path().join(entry_point).is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
    }

    /// Change the permissions of `folder` in the working directory to `mode`.
    pub(crate) fn chmod(&self, folder: &str, mode: &str) -> Result<String> {
        let folder = folder.trim().replace(['/', '\\'], "").replace("..", "");

        if folder.is_empty() {
            return Err(anyhow!("please type in a folder name"));
        }

        if !CHMOD_FOLDER.is_match(&folder) {
            return Err(anyhow!(
                "folder {folder} has invalid characters, only folders in the current working directory can be changed"
            ));
        }

        let path = self.config.working_dir().join(&folder);

        if !path.exists() {
            return Err(anyhow!("folder {} does not exist", path.display()));
        }

        let mode = mode.trim();

        if !self.config.toml.folder_permissions.iter().any(|allowed| allowed == mode) {
            return Err(anyhow!("invalid permissions {mode}"));
        }

        let bits = u32::from_str_radix(mode, 8).with_context(|| format!("invalid permissions {mode}"))?;

        set_mode(&path, bits).with_context(|| {
            format!(
                "attempt to change permissions of folder {} to {mode} failed",
                path.display()
            )
        })?;

        Ok(format!(
            "successfully changed permissions of {} to {mode}",
            path.display()
        ))
    }

    /// Rename the extracted application folder to `folder`.
    pub(crate) fn rename(&self, folder: &str) -> Result<String> {
        let folder = folder.trim().replace(['/', '\\', '.'], "");

        if !RENAME_FOLDER.is_match(&folder) {
            return Err(anyhow!(
                "folder name {folder} has invalid characters, can only rename within the current working directory"
            ));
        }

        let current = self
            .find_extracted_root()
            .ok_or_else(|| anyhow!("no application folder found in the current working directory"))?;

        let from = self.config.working_dir().join(current);
        let to = self.config.working_dir().join(&folder);

        std::fs::rename(&from, &to).with_context(|| {
            format!(
                "attempt to rename {} to {} failed",
                from.display(),
                to.display()
            )
        })?;

        Ok(format!(
            "successfully renamed {} to {}",
            from.display(),
            to.display()
        ))
    }

    pub(crate) fn state(&self) -> State {
        if let Some(folder) = self.find_extracted_root() {
            return State::Extracted(folder);
        }

        let any_archive = ArchiveExtension::ALL
            .into_iter()
            .any(|extension| self.config.archive_path(extension.as_str()).is_file());

        if any_archive {
            State::ArchivePresent
        } else {
            State::NoArchive
        }
    }

    pub(crate) fn status(&self) -> Status {
        let transfer_methods = TransferMethod::ALL
            .into_iter()
            .map(|method| method.descriptor(&self.platform))
            .collect::<Vec<_>>();

        let extraction_methods = ExtractionMethod::ALL
            .into_iter()
            .map(|method| method.descriptor(&self.platform, &self.config))
            .collect();

        let can_download = transfer_methods.iter().any(|method| method.supported);

        Status {
            state: self.state(),
            extraction_methods,
            stable_tag: self.channels.stable_tag.clone(),
            release_candidate_tag: self.channels.release_candidate_tag.clone(),
            show_tag_release: can_download && self.channels.should_show_tag_release(),
            show_stable_release: can_download && self.channels.should_show_stable_release(),
            transfer_methods,
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    std::fs::set_permissions(path, permissions)
}
