//! Extractors for the supported archive types.
use crate::config::Config;
use crate::platform::{BudgetTicker, Platform};
use crate::tarball;
use crate::transfer::joined_output;
use anyhow::{Context, Result, anyhow};
use std::ffi::OsStr;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufReader, copy};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;

/// Archive formats offered for download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArchiveExtension {
    Zip,
    TarGz,
}

impl ArchiveExtension {
    pub(crate) const ALL: [ArchiveExtension; 2] = [ArchiveExtension::Zip, ArchiveExtension::TarGz];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ArchiveExtension::Zip => "zip",
            ArchiveExtension::TarGz => "tar.gz",
        }
    }
}

impl FromStr for ArchiveExtension {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ArchiveExtension::ALL
            .into_iter()
            .find(|extension| extension.as_str() == s)
            .ok_or_else(|| anyhow!("unsupported archive extension {s}"))
    }
}

impl Display for ArchiveExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registered extraction methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExtractionMethod {
    /// External `unzip` binary.
    Unzip,
    /// External `tar` binary.
    Tar,
    /// Built-in zip reader.
    ZipReader,
    /// Built-in tar reader.
    TarReader,
}

/// What the status page shows about an [`ExtractionMethod`].
#[derive(Debug, Clone)]
pub(crate) struct Descriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub supported: bool,
    pub archive_name: String,
    pub archive_exists: bool,
}

impl ExtractionMethod {
    pub(crate) const ALL: [ExtractionMethod; 4] = [
        ExtractionMethod::Unzip,
        ExtractionMethod::ZipReader,
        ExtractionMethod::Tar,
        ExtractionMethod::TarReader,
    ];

    pub(crate) fn id(self) -> &'static str {
        match self {
            ExtractionMethod::Unzip => "unzip",
            ExtractionMethod::Tar => "tar",
            ExtractionMethod::ZipReader => "zipreader",
            ExtractionMethod::TarReader => "tarreader",
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            ExtractionMethod::Unzip => "Extract .zip with unzip",
            ExtractionMethod::Tar => "Extract .tar.gz with tar",
            ExtractionMethod::ZipReader => "Extract .zip with the built-in reader",
            ExtractionMethod::TarReader => "Extract .tar.gz with the built-in reader",
        }
    }

    /// Look up a registered method. Anything not in the registry is rejected.
    pub(crate) fn from_id(id: &str) -> Option<Self> {
        ExtractionMethod::ALL
            .into_iter()
            .find(|method| method.id() == id)
    }

    pub(crate) fn extension(self) -> ArchiveExtension {
        match self {
            ExtractionMethod::Unzip | ExtractionMethod::ZipReader => ArchiveExtension::Zip,
            ExtractionMethod::Tar | ExtractionMethod::TarReader => ArchiveExtension::TarGz,
        }
    }

    pub(crate) fn is_supported(self, platform: &Platform) -> bool {
        match self {
            ExtractionMethod::Unzip => platform.is_external_tool_available("unzip"),
            ExtractionMethod::Tar => platform.is_external_tool_available("tar"),
            ExtractionMethod::ZipReader => {
                platform.is_callable_supported("zip") && platform.is_callable_supported("mkdir")
            }
            ExtractionMethod::TarReader => {
                platform.is_callable_supported("gzip") && platform.is_callable_supported("touch")
            }
        }
    }

    pub(crate) fn descriptor(self, platform: &Platform, config: &Config) -> Descriptor {
        let archive = config.archive_path(self.extension().as_str());

        Descriptor {
            id: self.id(),
            name: self.name(),
            supported: self.is_supported(platform),
            archive_name: archive
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            archive_exists: archive.is_file(),
        }
    }

    /// Unpack `archive` below `options.dest_root` and return a short summary. Only the tar
    /// reader honours the entry name and size options.
    pub(crate) fn extract(
        self,
        archive: &Path,
        options: &tarball::Options,
        platform: &Platform,
    ) -> Result<String> {
        log::info!("extracting {} with {}", archive.display(), self.id());
        let dest_dir = options.dest_root.as_path();

        match self {
            ExtractionMethod::Unzip => {
                run_tool(platform, "unzip", &[OsStr::new("-o"), archive.as_os_str()], dest_dir)
            }
            ExtractionMethod::Tar => {
                run_tool(platform, "tar", &[OsStr::new("-xzf"), archive.as_os_str()], dest_dir)
            }
            ExtractionMethod::ZipReader => {
                let count = extract_zip(archive, dest_dir, platform)?;
                Ok(format!("extracted {count} entries"))
            }
            ExtractionMethod::TarReader => {
                let report = tarball::extract_archive(archive, options, platform)?;

                for entry in report.skipped() {
                    log::info!("skipped {}: {}", entry.path.display(), entry.status);
                }

                Ok(format!(
                    "extracted {} entries ({} bytes), skipped {}",
                    report.extracted().count(),
                    report.total_size(),
                    report.skipped().count()
                ))
            }
        }
    }
}

fn run_tool(
    platform: &Platform,
    name: &str,
    args: &[&OsStr],
    dest_dir: &Path,
) -> Result<String> {
    let tool = platform
        .executable_path(name)
        .ok_or_else(|| anyhow!("{name} is not available"))?;

    let output = Command::new(tool)
        .args(args)
        .current_dir(dest_dir)
        .stdin(Stdio::null())
        .output()?;

    if !output.status.success() {
        return Err(anyhow!(
            "{name} returned an error status ({}): {}",
            output.status,
            joined_output(&output.stdout, &output.stderr)
        ));
    }

    Ok(format!("{name} finished"))
}

/// Recreate the directory chain `relative` below `root`, replacing plain files that are in
/// the way.
fn prepare_dirs(root: &Path, relative: &Path) -> Result<()> {
    let mut dir = root.to_path_buf();

    for component in relative.components() {
        dir.push(component);

        if dir.is_file() {
            std::fs::remove_file(&dir)?;
        }

        if !dir.is_dir() {
            std::fs::create_dir(&dir)
                .with_context(|| format!("could not create directory {}", dir.display()))?;
        }
    }

    Ok(())
}

/// Extract every entry of the zip file at `archive` into `dest_dir`.
pub(crate) fn extract_zip(archive: &Path, dest_dir: &Path, platform: &Platform) -> Result<usize> {
    let input = File::open(archive)
        .with_context(|| format!("could not open the zip archive {}", archive.display()))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(input))?;
    let mut ticker = BudgetTicker::new(platform);
    let mut count = 0;

    for i in 0..archive.len() {
        let mut input = archive.by_index(i)?;

        let Some(name) = input.enclosed_name() else {
            log::warn!("skipping zip entry with unsafe name {}", input.name());
            continue;
        };

        if input.is_dir() {
            prepare_dirs(dest_dir, &name)?;
            count += 1;
            continue;
        }

        if let Some(parent) = name.parent() {
            prepare_dirs(dest_dir, parent)?;
        }

        let dest: PathBuf = dest_dir.join(&name);
        let mut output = File::create(&dest).with_context(|| {
            format!("error during unzip: could not open {} for writing", dest.display())
        })?;

        let written = copy(&mut input, &mut output)?;

        if written != input.size() {
            return Err(anyhow!(
                "error during unzip: wrote {written} of {} bytes to {}",
                input.size(),
                dest.display()
            ));
        }

        count += 1;
        ticker.tick()?;
    }

    Ok(count)
}
