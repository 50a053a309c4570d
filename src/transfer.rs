//! Interchangeable ways of fetching a URL into a local file.

use crate::platform::{BudgetTicker, Platform};
use crate::socket;
use anyhow::{Context, Result, anyhow};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

/// Chunk size used when copying streams by hand.
pub(crate) const CHUNK_SIZE: usize = 4096;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const MAX_REDIRECTS: usize = 10;

/// Connect timeout of URL streams, the usual default socket timeout of web hosts.
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Registered transfer methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferMethod {
    /// Library HTTP client.
    Curl,
    /// External `wget` binary.
    Wget,
    /// Remote URL opened as a plain stream.
    Fopen,
    /// Hand written HTTP/1.0 over a TCP socket.
    Fsockopen,
}

/// What the status page shows about a [`TransferMethod`].
#[derive(Debug, Clone)]
pub(crate) struct Descriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub supported: bool,
}

impl TransferMethod {
    pub(crate) const ALL: [TransferMethod; 4] = [
        TransferMethod::Curl,
        TransferMethod::Wget,
        TransferMethod::Fopen,
        TransferMethod::Fsockopen,
    ];

    pub(crate) fn id(self) -> &'static str {
        match self {
            TransferMethod::Curl => "curl",
            TransferMethod::Wget => "wget",
            TransferMethod::Fopen => "fopen",
            TransferMethod::Fsockopen => "fsockopen",
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            TransferMethod::Curl => "Download with the HTTP client",
            TransferMethod::Wget => "Download with wget",
            TransferMethod::Fopen => "Download with a URL stream",
            TransferMethod::Fsockopen => "Download with a raw socket",
        }
    }

    /// Look up a registered method. Anything not in the registry is rejected.
    pub(crate) fn from_id(id: &str) -> Option<Self> {
        TransferMethod::ALL
            .into_iter()
            .find(|method| method.id() == id)
    }

    pub(crate) fn is_supported(self, platform: &Platform) -> bool {
        match self {
            TransferMethod::Curl => platform.is_callable_supported("http_client"),
            TransferMethod::Wget => platform.is_external_tool_available("wget"),
            TransferMethod::Fopen => platform.allows_url_stream(),
            TransferMethod::Fsockopen => platform.is_callable_supported("socket"),
        }
    }

    pub(crate) fn descriptor(self, platform: &Platform) -> Descriptor {
        Descriptor {
            id: self.id(),
            name: self.name(),
            supported: self.is_supported(platform),
        }
    }

    /// Fetch `url` into `output`.
    pub(crate) async fn download(self, url: &str, output: &Path, platform: &Platform) -> Result<()> {
        log::info!("downloading {url} with {}", self.id());

        match self {
            TransferMethod::Curl => curl(url, output).await,
            TransferMethod::Wget => wget(url, output, platform).await,
            TransferMethod::Fopen => fopen(url, output, platform).await,
            TransferMethod::Fsockopen => socket::download(url, output, platform).await,
        }
    }
}

fn open_output(output: &Path) -> Result<File> {
    File::create(output).with_context(|| {
        format!(
            "unable to open output file {} in writing mode",
            output.display()
        )
    })
}

async fn curl(url: &str, output: &Path) -> Result<()> {
    let mut file = open_output(output)?;

    let client = reqwest::ClientBuilder::new()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(TOTAL_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .user_agent(USER_AGENT)
        .build()?;

    let mut response = client.get(url).send().await?.error_for_status()?;

    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk)?;
    }

    Ok(())
}

async fn wget(url: &str, output: &Path, platform: &Platform) -> Result<()> {
    let wget = platform
        .executable_path("wget")
        .ok_or_else(|| anyhow!("wget is not available"))?;

    let result = tokio::process::Command::new(wget)
        .arg("-O")
        .arg(output)
        .arg(url)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !result.status.success() {
        return Err(anyhow!(
            "wget returned an error status ({}): {}",
            result.status,
            joined_output(&result.stdout, &result.stderr)
        ));
    }

    Ok(())
}

async fn fopen(url: &str, output: &Path, platform: &Platform) -> Result<()> {
    platform.extend_execution_budget();

    let client = reqwest::ClientBuilder::new()
        .connect_timeout(STREAM_CONNECT_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;

    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|err| anyhow!("unable to open url {url}: {err}"))?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "unable to open url {url}: HTTP status {}",
            response.status()
        ));
    }

    let mut file = open_output(output)?;
    let mut ticker = BudgetTicker::new(platform);

    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) if !chunk.is_empty() => chunk,
            Ok(Some(_)) => return Err(anyhow!("error during download: empty read")),
            Ok(None) => break,
            Err(err) => return Err(anyhow!("error during download: {err}")),
        };

        for piece in chunk.chunks(CHUNK_SIZE) {
            if file.write(piece)? != piece.len() {
                return Err(anyhow!("error during writing {}", output.display()));
            }
        }

        ticker.tick()?;
    }

    Ok(())
}

/// Captured process output as one diagnostic string.
pub(crate) fn joined_output(stdout: &[u8], stderr: &[u8]) -> String {
    [stdout, stderr]
        .iter()
        .map(|stream| String::from_utf8_lossy(stream))
        .flat_map(|text| {
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Minimal HTTP responder for exercising the transfer methods.

    use anyhow::Result;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    pub(crate) enum Reply {
        Body(Vec<u8>),
        Redirect(String),
        Status(u16, &'static str),
    }

    fn render(reply: Reply) -> Vec<u8> {
        let (status, headers, body) = match reply {
            Reply::Body(body) => ("200 OK".to_string(), String::new(), body),
            Reply::Redirect(location) => (
                "302 Found".to_string(),
                format!("Location: {location}\r\n"),
                Vec::new(),
            ),
            Reply::Status(code, reason) => (
                format!("{code} {reason}"),
                String::new(),
                reason.as_bytes().to_vec(),
            ),
        };

        let mut response = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n{headers}\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(&body);
        response
    }

    /// Serve every request path with `handler` until the runtime shuts down.
    pub(crate) async fn serve<F>(handler: F) -> Result<SocketAddr>
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let handler = handler.clone();

                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];

                    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(read) => request.extend_from_slice(&buf[..read]),
                        }
                    }

                    let request = String::from_utf8_lossy(&request);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let _ = socket.write_all(&render(handler(&path))).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Ok(addr)
    }
}
