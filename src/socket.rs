//! HTTP/1.0 downloads over a plain TCP socket, following `Location` redirects.

use crate::platform::{BudgetTicker, Platform};
use crate::transfer::CHUNK_SIZE;
use anyhow::{Context, Result, anyhow};
use regex::Regex;
use reqwest::Url;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub(crate) const MAX_REDIRECTS: i32 = 10;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

static SUCCESS_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^HTTP/\d+\.\d+\s2\d{2}").expect("compiling the regex"));

enum Fetched {
    Redirect(String),
    Body,
}

/// Download `url` into `output`, following at most [`MAX_REDIRECTS`] redirects.
pub(crate) async fn download(url: &str, output: &Path, platform: &Platform) -> Result<()> {
    let mut url = Url::parse(url)?;
    let mut redirects_left = MAX_REDIRECTS;

    loop {
        if redirects_left < 0 {
            return Err(anyhow!("too many redirects, last URL: {url}"));
        }

        match fetch(&url, output, platform).await? {
            Fetched::Body => return Ok(()),
            Fetched::Redirect(location) => {
                url = url
                    .join(&location)
                    .with_context(|| format!("invalid redirect target {location}"))?;
                log::debug!("redirected to {url}");
                redirects_left -= 1;
            }
        }
    }
}

async fn fetch(url: &Url, output: &Path, platform: &Platform) -> Result<Fetched> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("no host in {url}"))?;
    let port = url.port().unwrap_or(80);

    // IPv6 literals are bracketed in URLs but not when resolving.
    let address = host.trim_start_matches('[').trim_end_matches(']');

    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((address, port)))
        .await
        .map_err(|_| anyhow!("connection timed out retrieving {url}"))?
        .with_context(|| format!("could not connect retrieving {url}"))?;

    let mut stream = BufReader::new(stream);
    let mut target = url.path().to_string();

    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    stream
        .get_mut()
        .write_all(format!("GET {target} HTTP/1.0\r\nHost: {host_header}\r\n\r\n").as_bytes())
        .await
        .context("download request failed (write)")?;
    stream
        .get_mut()
        .flush()
        .await
        .context("download request failed (flush)")?;

    let mut ticker = BudgetTicker::new(platform);
    let mut status = String::new();
    stream.read_line(&mut status).await?;
    let status = status.trim().to_string();

    loop {
        let mut line = String::new();

        if stream.read_line(&mut line).await? == 0 {
            break;
        }

        let line = line.trim();

        if line.is_empty() {
            break;
        }

        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("location") {
                return Ok(Fetched::Redirect(value.trim().to_string()));
            }
        }
    }

    let mut file = File::create(output)
        .with_context(|| format!("could not open {} in write mode", output.display()))?;
    let mut buf = [0u8; CHUNK_SIZE];

    loop {
        let read = stream.read(&mut buf).await?;

        if read == 0 {
            break;
        }

        if file.write(&buf[..read])? != read {
            return Err(anyhow!("error during writing {}", output.display()));
        }

        ticker.tick()?;
    }

    if !SUCCESS_STATUS.is_match(&status) {
        return Err(anyhow!("download failed with HTTP status: {status}"));
    }

    Ok(Fetched::Body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Toml};
    use crate::transfer::test_server::{Reply, serve};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn platform(dir: &Path) -> Result<Platform> {
        let config = Config::from_toml(Toml::default(), Some(dir.to_path_buf()))?;
        Ok(Platform::new(&config))
    }

    #[test]
    fn status_line() {
        assert!(SUCCESS_STATUS.is_match("HTTP/1.1 200 OK"));
        assert!(SUCCESS_STATUS.is_match("HTTP/1.0 204 No Content"));
        assert!(!SUCCESS_STATUS.is_match("HTTP/1.1 302 Found"));
        assert!(!SUCCESS_STATUS.is_match("HTTP/1.1 404 Not Found"));
        assert!(!SUCCESS_STATUS.is_match(""));
    }

    #[tokio::test]
    async fn follows_redirect_chain() -> Result<()> {
        let addr = serve(|path| match path {
            "/first" => Reply::Redirect("/second".into()),
            "/second" => Reply::Redirect("third".into()),
            "/third" => Reply::Redirect("/archive/gallery2.tar.gz?ref=v2".into()),
            "/archive/gallery2.tar.gz?ref=v2" => Reply::Body(b"final body".to_vec()),
            _ => Reply::Status(404, "Not Found"),
        })
        .await?;

        let dir = tempfile::tempdir()?;
        let output = dir.path().join("gallery2.tar.gz");
        download(&format!("http://{addr}/first"), &output, &platform(dir.path())?).await?;

        assert_eq!(std::fs::read(&output)?, b"final body");
        Ok(())
    }

    #[tokio::test]
    async fn endless_redirects_fail() -> Result<()> {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let addr = serve(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Reply::Redirect("/again".into())
        })
        .await?;

        let dir = tempfile::tempdir()?;
        let output = dir.path().join("gallery2.zip");
        let err = download(&format!("http://{addr}/start"), &output, &platform(dir.path())?)
            .await
            .err()
            .ok_or_else(|| anyhow!("endless redirects succeeded"))?;

        assert!(err.to_string().contains("too many redirects"), "{err}");
        assert!(err.to_string().contains("/again"), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), usize::try_from(MAX_REDIRECTS)? + 1);
        Ok(())
    }

    #[tokio::test]
    async fn error_status_is_reported() -> Result<()> {
        let addr = serve(|_| Reply::Status(500, "Internal Server Error")).await?;

        let dir = tempfile::tempdir()?;
        let output = dir.path().join("gallery2.zip");
        let err = download(&format!("http://{addr}/"), &output, &platform(dir.path())?)
            .await
            .err()
            .ok_or_else(|| anyhow!("server error succeeded"))?;

        assert!(
            err.to_string()
                .contains("download failed with HTTP status: HTTP/1.1 500 Internal Server Error"),
            "{err}"
        );
        Ok(())
    }

    /// Answer one request on `listener` and hand back its raw text.
    fn capture_request(listener: TcpListener) -> JoinHandle<Result<String>> {
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await?;
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];

            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = socket.read(&mut buf).await?;

                if read == 0 {
                    break;
                }

                request.extend_from_slice(&buf[..read]);
            }

            socket.write_all(b"HTTP/1.0 200 OK\r\n\r\nbody").await?;
            socket.shutdown().await?;
            Ok(String::from_utf8_lossy(&request).into_owned())
        })
    }

    #[tokio::test]
    async fn host_header_carries_explicit_port() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let request = capture_request(listener);

        let dir = tempfile::tempdir()?;
        let output = dir.path().join("gallery2.zip");
        let url = format!("http://127.0.0.1:{port}/gallery2.zip?x=1");
        download(&url, &output, &platform(dir.path())?).await?;

        let request = request.await??;
        assert!(request.starts_with("GET /gallery2.zip?x=1 HTTP/1.0\r\n"), "{request}");
        assert!(request.contains(&format!("Host: 127.0.0.1:{port}\r\n")), "{request}");
        assert_eq!(std::fs::read(&output)?, b"body");
        Ok(())
    }

    #[tokio::test]
    async fn ipv6_literal_hosts() -> Result<()> {
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            return Ok(());
        };
        let port = listener.local_addr()?.port();
        let request = capture_request(listener);

        let dir = tempfile::tempdir()?;
        let output = dir.path().join("gallery2.zip");
        let url = format!("http://[::1]:{port}/gallery2.zip");
        download(&url, &output, &platform(dir.path())?).await?;

        let request = request.await??;
        assert!(request.contains(&format!("Host: [::1]:{port}\r\n")), "{request}");
        assert_eq!(std::fs::read(&output)?, b"body");
        Ok(())
    }
}
