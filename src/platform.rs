//! Host capability discovery and the execution time budget.

use crate::config::Config;
use anyhow::{Result, anyhow};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Primitive operations this build provides. A host may switch any of them off through the
/// `disabled_functions` setting.
const PROVIDED_FUNCTIONS: [&str; 10] = [
    "exec",
    "http_client",
    "url_stream",
    "socket",
    "gzip",
    "zip",
    "mkdir",
    "touch",
    "read_dir",
    "set_time_limit",
];

/// Budget granted by every extension.
const EXTENDED_TIME_LIMIT: Duration = Duration::from_secs(600);

/// Interval after which long running loops renew the budget.
pub(crate) const EXTEND_INTERVAL: Duration = Duration::from_secs(55);

/// Wall clock allowance for the current invocation.
pub(crate) struct ExecutionBudget {
    deadline: Mutex<Option<Instant>>,
}

impl ExecutionBudget {
    pub(crate) fn new(limit: Option<Duration>) -> Self {
        Self {
            deadline: Mutex::new(limit.map(|limit| Instant::now() + limit)),
        }
    }

    fn extend(&self, by: Duration) {
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = Some(Instant::now() + by);
        }
    }

    /// Fail once the deadline has passed.
    pub(crate) fn ensure_remaining(&self) -> Result<()> {
        let deadline = self
            .deadline
            .lock()
            .map_err(|_| anyhow!("execution budget poisoned"))?;

        match *deadline {
            Some(deadline) if Instant::now() > deadline => {
                Err(anyhow!("maximum execution time exceeded"))
            }
            _ => Ok(()),
        }
    }
}

pub(crate) struct Platform {
    disabled: Vec<String>,
    allow_url_stream: bool,
    tool_dirs: Vec<PathBuf>,
    working_dir: PathBuf,
    budget: ExecutionBudget,
}

impl Platform {
    pub(crate) fn new(config: &Config) -> Self {
        let limit = match config.toml.max_execution_time {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Self {
            disabled: config
                .toml
                .disabled_functions
                .iter()
                .map(|name| name.trim().to_ascii_lowercase())
                .collect(),
            allow_url_stream: config.toml.allow_url_stream,
            tool_dirs: config.toml.tool_dirs.clone(),
            working_dir: config.working_dir().to_path_buf(),
            budget: ExecutionBudget::new(limit),
        }
    }

    /// True only if `name` is provided by this build and not disabled on this host.
    pub(crate) fn is_callable_supported(&self, name: &str) -> bool {
        PROVIDED_FUNCTIONS.contains(&name) && !self.disabled.iter().any(|disabled| disabled == name)
    }

    /// Whether remote URLs may be opened like local files.
    pub(crate) fn allows_url_stream(&self) -> bool {
        self.allow_url_stream && self.is_callable_supported("url_stream")
    }

    pub(crate) fn is_external_tool_available(&self, name: &str) -> bool {
        self.executable_path(name).is_some()
    }

    /// Resolve `name` to an executable: configured tool directories first, then `which`, then
    /// the conventional installation directories and `PATH`.
    pub(crate) fn executable_path(&self, name: &str) -> Option<PathBuf> {
        if !self.is_callable_supported("exec") {
            return None;
        }

        let file_name = format!("{name}{}", std::env::consts::EXE_SUFFIX);

        if let Some(path) = self
            .tool_dirs
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|path| is_executable(path))
        {
            return Some(path);
        }

        if let Some(path) = which(name) {
            return Some(path);
        }

        candidate_dirs(name, std::env::var_os("PATH"))
            .into_iter()
            .map(|dir| dir.join(&file_name))
            .find(|path| is_executable(path))
    }

    pub(crate) fn is_working_directory_writable(&self) -> bool {
        std::fs::metadata(&self.working_dir)
            .map(|metadata| metadata.is_dir() && !metadata.permissions().readonly())
            .unwrap_or(false)
    }

    /// Best effort renewal of the execution budget.
    pub(crate) fn extend_execution_budget(&self) {
        if self.is_callable_supported("set_time_limit") {
            log::debug!("extending execution budget by {EXTENDED_TIME_LIMIT:?}");
            self.budget.extend(EXTENDED_TIME_LIMIT);
        }
    }

    pub(crate) fn budget(&self) -> &ExecutionBudget {
        &self.budget
    }
}

/// Renews the budget of a [`Platform`] every [`EXTEND_INTERVAL`] of a long running loop.
pub(crate) struct BudgetTicker<'a> {
    platform: &'a Platform,
    start: Instant,
}

impl<'a> BudgetTicker<'a> {
    pub(crate) fn new(platform: &'a Platform) -> Self {
        Self {
            platform,
            start: Instant::now(),
        }
    }

    pub(crate) fn tick(&mut self) -> Result<()> {
        if self.start.elapsed() > EXTEND_INTERVAL {
            self.platform.extend_execution_budget();
            self.start = Instant::now();
        }

        self.platform.budget().ensure_remaining()
    }
}

fn which(name: &str) -> Option<PathBuf> {
    let lookup = if cfg!(windows) { "where" } else { "which" };

    let output = Command::new(lookup)
        .arg(name)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let path = PathBuf::from(stdout.lines().next()?.trim());

    (path.to_string_lossy().contains(name) && is_executable(&path)).then_some(path)
}

/// Conventional installation directories followed by every `PATH` entry.
fn candidate_dirs(name: &str, path_var: Option<std::ffi::OsString>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = if cfg!(windows) {
        vec![
            PathBuf::from(format!("C:\\Program Files\\{name}")),
            PathBuf::from(format!("C:\\apps\\{name}")),
            PathBuf::from(format!("C:\\{name}")),
        ]
    } else {
        ["/usr/bin", "/usr/local/bin", "/bin", "/sw/bin"]
            .into_iter()
            .map(PathBuf::from)
            .collect()
    };

    dirs.push(PathBuf::from("."));

    if let Some(var) = path_var {
        dirs.extend(std::env::split_paths(&var).filter(|dir| !dir.as_os_str().is_empty()));
    }

    dirs
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Toml;

    fn platform(toml: Toml, dir: &Path) -> Result<Platform> {
        let config = Config::from_toml(toml, Some(dir.to_path_buf()))?;
        Ok(Platform::new(&config))
    }

    #[test]
    fn disabled_functions_are_unsupported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let toml = Toml {
            disabled_functions: vec!["exec".into(), " Socket".into()],
            ..Toml::default()
        };
        let platform = platform(toml, dir.path())?;

        assert!(!platform.is_callable_supported("exec"));
        assert!(!platform.is_callable_supported("socket"));
        assert!(platform.is_callable_supported("http_client"));
        assert!(!platform.is_callable_supported("no_such_function"));
        assert!(!platform.is_external_tool_available("sh"));
        Ok(())
    }

    #[test]
    fn url_stream_needs_setting_and_capability() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let toml = Toml {
            allow_url_stream: false,
            ..Toml::default()
        };
        assert!(!platform(toml, dir.path())?.allows_url_stream());
        assert!(platform(Toml::default(), dir.path())?.allows_url_stream());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn finds_shell() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let platform = platform(Toml::default(), dir.path())?;
        let path = platform.executable_path("sh");
        assert!(path.is_some_and(|path| is_executable(&path)));
        assert!(!platform.is_external_tool_available("definitely-not-a-real-binary"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn configured_tool_dirs_come_first() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tools = tempfile::tempdir()?;
        test_tools::stub_tool(tools.path(), "sh", "exit 0")?;
        let toml = Toml {
            tool_dirs: vec![tools.path().to_path_buf()],
            ..Toml::default()
        };

        let path = platform(toml, dir.path())?.executable_path("sh");

        assert_eq!(path, Some(tools.path().join("sh")));
        Ok(())
    }

    #[test]
    fn candidate_dirs_include_path_entries() {
        let var = std::env::join_paths(["/opt/tools/bin", "/srv/bin"]).ok();
        let dirs = candidate_dirs("wget", var);
        assert!(dirs.contains(&PathBuf::from("/opt/tools/bin")));
        assert!(dirs.contains(&PathBuf::from("/srv/bin")));
        assert!(dirs.contains(&PathBuf::from(".")));
    }

    #[test]
    fn working_dir_writability() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(platform(Toml::default(), dir.path())?.is_working_directory_writable());
        Ok(())
    }

    #[test]
    fn expired_budget_fails_until_extended() -> Result<()> {
        let budget = ExecutionBudget::new(Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(5));
        assert!(budget.ensure_remaining().is_err());

        budget.extend(EXTENDED_TIME_LIMIT);
        assert!(budget.ensure_remaining().is_ok());

        assert!(ExecutionBudget::new(None).ensure_remaining().is_ok());
        Ok(())
    }

    fn deadline(platform: &Platform) -> Result<Option<Instant>> {
        let deadline = platform
            .budget()
            .deadline
            .lock()
            .map_err(|_| anyhow!("execution budget poisoned"))?;
        Ok(*deadline)
    }

    #[test]
    fn ticker_extends_budget_after_interval() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let cases = [
            (Vec::<String>::new(), true),
            (vec!["set_time_limit".to_string()], false),
        ];

        for (disabled, extended) in cases {
            let toml = Toml {
                max_execution_time: 1,
                disabled_functions: disabled,
                ..Toml::default()
            };
            let platform = platform(toml, dir.path())?;

            let Some(start) = Instant::now().checked_sub(EXTEND_INTERVAL + Duration::from_secs(1))
            else {
                return Ok(());
            };

            let before = deadline(&platform)?.ok_or_else(|| anyhow!("no deadline"))?;
            let mut ticker = BudgetTicker {
                platform: &platform,
                start,
            };
            ticker.tick()?;
            let after = deadline(&platform)?.ok_or_else(|| anyhow!("no deadline"))?;

            assert_eq!(after > before + Duration::from_secs(500), extended);
            assert!(ticker.start.elapsed() < EXTEND_INTERVAL);
        }

        Ok(())
    }
}
