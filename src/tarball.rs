//! Streaming reader for plain and gzip compressed tar archives.
//!
//! Entries are written below a destination root. An entry is never allowed to replace a
//! directory, a write protected file or a file that is newer than the archived one; such
//! entries are skipped and reported, the rest of the archive is still extracted. Checksum
//! errors and size mismatches abort the whole extraction.

use crate::platform::{BudgetTicker, Platform};
use anyhow::{Context, Result, anyhow};
use flate2::read::GzDecoder;
use std::fmt::Display;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) const BLOCK_SIZE: usize = 512;

/// Sum of an all-zero block with the checksum field counted as spaces.
const ZERO_BLOCK_CHECKSUM: u64 = 8 * b' ' as u64;

const CHECKSUM_FIELD: std::ops::Range<usize> = 148..156;

/// Stream format, derived from the archive file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Format {
    Tar,
    Tgz,
}

impl Format {
    pub(crate) fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;

        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Format::Tgz)
        } else if name.ends_with(".tar") {
            Some(Format::Tar)
        } else {
            None
        }
    }
}

/// Parsed 512 byte header block.
#[derive(Debug, Clone, Default)]
pub(crate) struct Header {
    pub name: String,
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: u64,
    pub checksum: u64,
    pub typeflag: u8,
    pub link_name: String,
    pub magic: Vec<u8>,
    pub version: Vec<u8>,
    pub uname: String,
    pub gname: String,
    pub devmajor: u64,
    pub devminor: u64,
    pub prefix: String,
}

impl Header {
    fn is_dir(&self) -> bool {
        self.typeflag == b'5'
    }

    fn is_regular(&self) -> bool {
        matches!(self.typeflag, b'0' | b'\0' | b'7')
    }

    /// pax extended headers only carry metadata for other entries.
    fn is_pax(&self) -> bool {
        matches!(self.typeflag, b'x' | b'g')
    }

    fn is_gnu_long_name(&self) -> bool {
        self.typeflag == b'L'
    }

    fn is_gnu_long_link(&self) -> bool {
        self.typeflag == b'K'
    }

    /// Bytes following the header, including padding to the next block boundary.
    fn padded_size(&self) -> u64 {
        self.size.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
    }

    /// Full entry name, joining the ustar prefix when present.
    fn path(&self) -> String {
        if self.magic == b"ustar\0" && !self.prefix.is_empty() {
            format!("{}/{}", self.prefix, self.name)
        } else {
            self.name.clone()
        }
    }
}

/// Checksum of `block` with the checksum field itself counted as spaces.
pub(crate) fn checksum(block: &[u8; BLOCK_SIZE]) -> u64 {
    block
        .iter()
        .enumerate()
        .map(|(index, byte)| {
            if CHECKSUM_FIELD.contains(&index) {
                u64::from(b' ')
            } else {
                u64::from(*byte)
            }
        })
        .sum()
}

/// Parse a header block. Returns `Ok(None)` for the all-zero end of archive marker.
pub(crate) fn parse_header(block: &[u8; BLOCK_SIZE]) -> Result<Option<Header>> {
    let computed = checksum(block);
    let stored = octal(&block[CHECKSUM_FIELD]);

    if computed != stored {
        if computed == ZERO_BLOCK_CHECKSUM && stored == 0 {
            return Ok(None);
        }

        return Err(anyhow!(
            "invalid header checksum: stored {stored}, computed {computed}"
        ));
    }

    let typeflag = block[156];

    let mut header = Header {
        name: text(&block[0..100]),
        mode: octal(&block[100..108]),
        uid: octal(&block[108..116]),
        gid: octal(&block[116..124]),
        size: octal(&block[124..136]),
        mtime: octal(&block[136..148]),
        checksum: stored,
        typeflag,
        link_name: text(&block[157..257]),
        magic: block[257..263].to_vec(),
        version: block[263..265].to_vec(),
        uname: text(&block[265..297]),
        gname: text(&block[297..329]),
        devmajor: octal(&block[329..337]),
        devminor: octal(&block[337..345]),
        prefix: text(&block[345..500]),
    };

    if header.is_dir() {
        header.size = 0;
    }

    Ok(Some(header))
}

/// NUL terminated string field, surrounding whitespace removed.
fn text(field: &[u8]) -> String {
    let end = field.iter().position(|byte| *byte == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

/// Numeric field in octal ASCII, or GNU base-256 when the high bit of the first byte is set.
/// Negative base-256 values (pre-1970 times) read as zero. Characters that are not octal
/// digits are ignored.
fn octal(field: &[u8]) -> u64 {
    if field.first().is_some_and(|byte| byte & 0x80 != 0) {
        if field[0] & 0x40 != 0 {
            return 0;
        }

        return field[1..]
            .iter()
            .fold(u64::from(field[0] & 0x7f), |acc, byte| {
                acc.saturating_mul(256).saturating_add(u64::from(*byte))
            });
    }

    field
        .iter()
        .filter(|byte| (b'0'..=b'7').contains(*byte))
        .fold(0u64, |acc, byte| {
            acc.saturating_mul(8).saturating_add(u64::from(byte - b'0'))
        })
}

/// What happened to a single archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryStatus {
    Extracted,
    AlreadyADirectory,
    WriteProtected,
    NewerExists,
    UnsafePath,
    UnsupportedType,
}

impl Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EntryStatus::Extracted => "ok",
            EntryStatus::AlreadyADirectory => "already a directory",
            EntryStatus::WriteProtected => "write protected",
            EntryStatus::NewerExists => "newer exists",
            EntryStatus::UnsafePath => "unsafe path",
            EntryStatus::UnsupportedType => "unsupported type",
        })
    }
}

#[derive(Debug)]
pub(crate) struct Entry {
    pub path: PathBuf,
    pub size: u64,
    pub status: EntryStatus,
}

/// Per entry outcome of an extraction.
#[derive(Debug, Default)]
pub(crate) struct Report {
    pub entries: Vec<Entry>,
}

impl Report {
    pub(crate) fn extracted(&self) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(|entry| entry.status == EntryStatus::Extracted)
    }

    pub(crate) fn skipped(&self) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(|entry| entry.status != EntryStatus::Extracted)
    }

    /// Bytes written for all extracted entries.
    pub(crate) fn total_size(&self) -> u64 {
        self.extracted().map(|entry| entry.size).sum()
    }
}

pub(crate) struct Options {
    /// Root every entry is written below.
    pub dest_root: PathBuf,
    /// Leading path removed from entry names that start with it.
    pub remove_prefix: Option<String>,
    /// Largest accepted entry.
    pub max_entry_size: u64,
}

impl Options {
    pub(crate) fn new(dest_root: impl Into<PathBuf>) -> Self {
        Self {
            dest_root: dest_root.into(),
            remove_prefix: None,
            max_entry_size: u64::MAX,
        }
    }

    fn destination(&self, name: &str) -> Option<PathBuf> {
        let mut name = name;

        if let Some(prefix) = &self.remove_prefix {
            let prefix = prefix.trim_end_matches('/');

            if let Some(rest) = name.strip_prefix(prefix) {
                if rest.is_empty() || rest.starts_with('/') {
                    name = rest;
                }
            }
        }

        let relative = Path::new(name.trim_start_matches('/'));

        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }

        Some(self.dest_root.join(relative))
    }
}

/// Extract the tar archive at `archive` according to `options`.
pub(crate) fn extract_archive(
    archive: &Path,
    options: &Options,
    platform: &Platform,
) -> Result<Report> {
    let format = Format::from_path(archive)
        .ok_or_else(|| anyhow!("extracting tar/gz failed, cannot handle extension"))?;

    let file = File::open(archive)
        .with_context(|| format!("could not open archive {}", archive.display()))?;

    let reader: Box<dyn Read> = match format {
        Format::Tar => Box::new(file),
        Format::Tgz => Box::new(GzDecoder::new(file)),
    };

    Extractor {
        reader: BufReader::new(reader),
        options,
        ticker: BudgetTicker::new(platform),
        report: Report::default(),
    }
    .run()
}

struct Extractor<'a, R> {
    reader: R,
    options: &'a Options,
    ticker: BudgetTicker<'a>,
    report: Report,
}

impl<R: Read> Extractor<'_, R> {
    fn run(mut self) -> Result<Report> {
        let mut block = [0u8; BLOCK_SIZE];
        let mut long_name: Option<String> = None;

        loop {
            self.ticker.tick()?;

            match read_block(&mut self.reader, &mut block)? {
                0 => break,
                BLOCK_SIZE => {}
                partial => return Err(anyhow!("invalid header block of {partial} bytes")),
            }

            let Some(header) = parse_header(&block)? else {
                break;
            };

            if header.size > self.options.max_entry_size {
                return Err(anyhow!(
                    "entry {} declares {} bytes, more than the allowed {}",
                    header.path(),
                    header.size,
                    self.options.max_entry_size
                ));
            }

            if header.is_gnu_long_name() {
                long_name = Some(self.read_long_name(&header)?);
                continue;
            }

            if header.is_pax() || header.is_gnu_long_link() {
                self.skip(&header)?;
                continue;
            }

            let name = long_name.take().unwrap_or_else(|| header.path());

            if name.is_empty() {
                continue;
            }

            self.entry(&name, &header)?;
        }

        Ok(self.report)
    }

    fn entry(&mut self, name: &str, header: &Header) -> Result<()> {
        log::trace!(
            "{name}: type {:?}, mode {:o}, owner {}:{} ({}:{}), link {:?}, device {}:{}, version {:?}, checksum {}",
            char::from(header.typeflag),
            header.mode,
            header.uname,
            header.gname,
            header.uid,
            header.gid,
            header.link_name,
            header.devmajor,
            header.devminor,
            header.version,
            header.checksum,
        );

        let Some(dest) = self.options.destination(name) else {
            return self.skip_with(PathBuf::from(name), header, EntryStatus::UnsafePath);
        };

        if !header.is_dir() && !header.is_regular() {
            return self.skip_with(dest, header, EntryStatus::UnsupportedType);
        }

        if let Some(status) = blocking_status(&dest, header.mtime)? {
            return self.skip_with(dest, header, status);
        }

        let dir = if header.is_dir() {
            Some(dest.as_path())
        } else {
            dest.parent()
        };

        if let Some(dir) = dir {
            create_dir_chain(dir, &mut self.ticker)
                .with_context(|| format!("could not create directory {}", dir.display()))?;
        }

        if header.is_regular() {
            self.write_file(&dest, header)?;
        }

        self.report.entries.push(Entry {
            path: dest,
            size: header.size,
            status: EntryStatus::Extracted,
        });

        Ok(())
    }

    fn write_file(&mut self, dest: &Path, header: &Header) -> Result<()> {
        let mut output = File::create(dest)
            .with_context(|| format!("could not open {} for writing", dest.display()))?;

        let mut remaining = header.size;
        let mut block = [0u8; BLOCK_SIZE];

        while remaining > 0 {
            let read = read_block(&mut self.reader, &mut block)?;
            let wanted = usize::try_from(remaining.min(BLOCK_SIZE as u64))?;
            let meaningful = read.min(wanted);

            output
                .write_all(&block[..meaningful])
                .with_context(|| format!("could not write {}", dest.display()))?;

            if read < BLOCK_SIZE {
                break;
            }

            remaining -= wanted as u64;
            self.ticker.tick()?;
        }

        match archived_time(header.mtime) {
            Some(modified) => {
                if let Err(err) = output.set_modified(modified) {
                    log::warn!("could not set modification time of {}: {err}", dest.display());
                }
            }
            None => log::warn!(
                "modification time {} of {} is out of range, not set",
                header.mtime,
                dest.display()
            ),
        }

        drop(output);

        let written = std::fs::metadata(dest)?.len();

        if written != header.size {
            return Err(anyhow!(
                "size mismatch for {}: wrote {written} bytes, archive declares {}",
                dest.display(),
                header.size
            ));
        }

        Ok(())
    }

    fn read_long_name(&mut self, header: &Header) -> Result<String> {
        let mut data = Vec::new();
        let read = (&mut self.reader)
            .take(header.padded_size())
            .read_to_end(&mut data)?;

        if (read as u64) < header.padded_size() {
            return Err(anyhow!("unexpected end of archive in long name"));
        }

        data.truncate(usize::try_from(header.size)?);
        Ok(text(&data))
    }

    fn skip(&mut self, header: &Header) -> Result<()> {
        let skipped = io::copy(&mut (&mut self.reader).take(header.padded_size()), &mut io::sink())?;

        if skipped < header.padded_size() {
            return Err(anyhow!("unexpected end of archive"));
        }

        Ok(())
    }

    fn skip_with(&mut self, path: PathBuf, header: &Header, status: EntryStatus) -> Result<()> {
        log::debug!("skipping {}: {status}", path.display());
        self.skip(header)?;
        self.report.entries.push(Entry {
            path,
            size: header.size,
            status,
        });
        Ok(())
    }
}

/// Reason an existing `dest` must not be replaced, if any.
fn blocking_status(dest: &Path, mtime: u64) -> Result<Option<EntryStatus>> {
    let metadata = match std::fs::metadata(dest) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    if metadata.is_dir() {
        return Ok(Some(EntryStatus::AlreadyADirectory));
    }

    if metadata.permissions().readonly() {
        return Ok(Some(EntryStatus::WriteProtected));
    }

    // An archived time beyond what the platform represents is newer than anything on disk.
    let Some(archived) = archived_time(mtime) else {
        return Ok(None);
    };

    if metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH) > archived {
        return Ok(Some(EntryStatus::NewerExists));
    }

    Ok(None)
}

/// Header mtime as a [`SystemTime`], if representable.
fn archived_time(mtime: u64) -> Option<SystemTime> {
    UNIX_EPOCH.checked_add(Duration::from_secs(mtime))
}

/// Create `dir` and all missing ancestors, world writable before the umask.
pub(crate) fn create_dir_chain(dir: &Path, ticker: &mut BudgetTicker<'_>) -> Result<()> {
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }

    if let Some(parent) = dir.parent() {
        create_dir_chain(parent, ticker)?;
    }

    let mut builder = std::fs::DirBuilder::new();

    #[cfg(unix)]
    std::os::unix::fs::DirBuilderExt::mode(&mut builder, 0o777);

    builder.create(dir)?;
    ticker.tick()
}

/// Fill `block` from `reader`, returning fewer bytes only at the end of the stream.
fn read_block<R: Read>(reader: &mut R, block: &mut [u8; BLOCK_SIZE]) -> io::Result<usize> {
    let mut filled = 0;

    while filled < BLOCK_SIZE {
        match reader.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }

    Ok(filled)
}
