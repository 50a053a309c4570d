use anyhow::Result;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Deserialize;
use std::fmt::Display;
use std::str::FromStr;

/// API release.
#[derive(Deserialize, Debug, Clone)]
pub(crate) struct Release {
    pub tag_name: String,
    pub created_at: String,
    pub zipball_url: String,
    #[serde(default)]
    pub prerelease: bool,
}

/// Named source of the codebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel {
    /// Last official release.
    Official,
    /// Newest release that is not a pre-release.
    Stable,
    /// Newest release of any kind.
    Tag,
    /// Tip of the master branch.
    Master,
    /// Tip of the development branch.
    Dev,
}

impl Channel {
    pub(crate) const ALL: [Channel; 5] = [
        Channel::Official,
        Channel::Stable,
        Channel::Tag,
        Channel::Master,
        Channel::Dev,
    ];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Channel::Official => "official",
            Channel::Stable => "stable",
            Channel::Tag => "tag",
            Channel::Master => "master",
            Channel::Dev => "dev",
        }
    }

    /// Channels whose URL comes from the releases API and already points at an archive.
    pub(crate) fn is_dynamic(self) -> bool {
        matches!(self, Channel::Stable | Channel::Tag)
    }
}

impl FromStr for Channel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Channel::ALL
            .into_iter()
            .find(|channel| channel.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown release channel {s}"))
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const GITHUB: &str = "https://github.com";

/// Base URLs and tag names for every [`Channel`].
#[derive(Debug, Clone)]
pub(crate) struct Channels {
    official: String,
    stable: String,
    tag: String,
    master: String,
    dev: String,
    pub stable_tag: String,
    pub release_candidate_tag: String,
    pub official_tag: String,
}

impl Channels {
    /// Build the channel table from releases. `releases` may be in any order; channels fall
    /// back to the official tag name and the master branch path if nothing is published.
    pub(crate) fn new(repo: &str, official_tag: &str, releases: Vec<Release>) -> Self {
        Self::with_host(GITHUB, repo, official_tag, releases)
    }

    /// Like [`Channels::new`] with branch and tag archives served from `host`.
    pub(crate) fn with_host(
        host: &str,
        repo: &str,
        official_tag: &str,
        mut releases: Vec<Release>,
    ) -> Self {
        // ISO 8601 timestamps order lexicographically.
        releases.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let newest = releases.first();
        let newest_stable = releases.iter().find(|release| !release.prerelease);
        let master = format!("{host}/{repo}/archive/master");

        let stable_tag = newest_stable
            .map(|release| release.tag_name.clone())
            .unwrap_or_else(|| official_tag.to_string());

        let release_candidate_tag = newest
            .map(|release| release.tag_name.clone())
            .unwrap_or_else(|| stable_tag.clone());

        Self {
            official: format!("{host}/{repo}/archive/{official_tag}"),
            stable: newest_stable
                .map(|release| release.zipball_url.clone())
                .unwrap_or_else(|| master.clone()),
            tag: newest
                .map(|release| release.zipball_url.clone())
                .unwrap_or_else(|| master.clone()),
            dev: format!("{host}/{repo}/archive/dev"),
            master,
            stable_tag,
            release_candidate_tag,
            official_tag: official_tag.to_string(),
        }
    }

    pub(crate) fn base_url(&self, channel: Channel) -> &str {
        match channel {
            Channel::Official => &self.official,
            Channel::Stable => &self.stable,
            Channel::Tag => &self.tag,
            Channel::Master => &self.master,
            Channel::Dev => &self.dev,
        }
    }

    /// Only worth offering while a release candidate is newer than the stable release.
    pub(crate) fn should_show_tag_release(&self) -> bool {
        self.stable_tag != self.release_candidate_tag
    }

    /// Only worth offering once a stable release follows the official one.
    pub(crate) fn should_show_stable_release(&self) -> bool {
        self.stable_tag != self.official_tag
    }
}

/// Create a new client usable for GitHub APIs.
pub(crate) fn make_client(token: Option<String>) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();

    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("application/vnd.github+json"),
    );

    headers.insert(header::USER_AGENT, HeaderValue::from_static("preinstall"));

    headers.insert(
        "X-GitHub-Api-Version",
        HeaderValue::from_static("2022-11-28"),
    );

    if let Some(token) = token {
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
    }

    let client = reqwest::ClientBuilder::new()
        .default_headers(headers)
        .brotli(true)
        .zstd(true)
        .build()?;

    Ok(client)
}

/// Fetch all releases of `repo`.
pub(crate) async fn releases(client: &reqwest::Client, repo: &str) -> Result<Vec<Release>> {
    let url = reqwest::Url::parse(&format!("https://api.github.com/repos/{repo}/releases"))?;

    Ok(client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?)
}
