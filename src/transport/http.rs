//! HTTP/HTTPS transport client (spec.md §4.2). Issues one ranged GET per
//! `open()`, follows redirects up to `max_redirect` on the probe path, and
//! detects range support from the response status (206 vs. 200).

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::url::Url;

use super::resolver::FamilyResolver;
use super::{OpenOutcome, ProbeResult, Transport};

/// A host is routed direct (bypassing `http_proxy`) when it exactly matches
/// or is a subdomain of an entry in `no_proxy_list`.
fn bypasses_proxy(config: &Config, host: &str) -> bool {
    config
        .no_proxy_list
        .iter()
        .any(|entry| host == entry || host.ends_with(&format!(".{entry}")))
}

fn build_client(config: &Config, host: &str) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(
            config.max_redirect as usize,
        ))
        .danger_accept_invalid_certs(config.insecure)
        .connect_timeout(config.io_timeout)
        .dns_resolver(std::sync::Arc::new(FamilyResolver(config.ai_family)));

    if let Some(ref proxy) = config.http_proxy {
        if !bypasses_proxy(config, host) {
            builder = builder.proxy(reqwest::Proxy::http(proxy).map_err(|e| {
                EngineError::Connect {
                    host: proxy.clone(),
                    port: 0,
                    message: e.to_string(),
                }
            })?);
        }
    }
    builder.build().map_err(|e| EngineError::Connect {
        host: String::new(),
        port: 0,
        message: e.to_string(),
    })
}

fn apply_headers(mut req: reqwest::RequestBuilder, url: &Url, config: &Config) -> reqwest::RequestBuilder {
    for (k, v) in &config.add_headers {
        req = req.header(k.as_str(), v.as_str());
    }
    if let Some(ref user) = url.user {
        req = req.basic_auth(user, url.pass.clone());
    }
    req
}

pub async fn probe(url: &Url, config: &Config) -> Result<ProbeResult> {
    let client = build_client(config, &url.host)?;
    let mut req = apply_headers(client.get(url.reconstruct()), url, config);
    req = req.header("Range", "bytes=0-");

    let resp = req.send().await.map_err(map_reqwest_err)?;
    let supported = resp.status().as_u16() == 206;
    let total_size = content_length_for(&resp, supported);
    Ok(ProbeResult {
        total_size,
        supported,
    })
}

fn content_length_for(resp: &reqwest::Response, supported: bool) -> Option<u64> {
    if supported {
        // Content-Range: bytes 0-x/TOTAL
        resp.headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.rsplit('/').next())
            .and_then(|total| total.parse::<u64>().ok())
            .or_else(|| resp.content_length())
    } else {
        resp.content_length()
    }
}

fn map_reqwest_err(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        return EngineError::IoTimeout;
    }
    if e.is_connect() {
        return EngineError::Connect {
            host: e.url().and_then(|u| u.host_str()).unwrap_or("").to_string(),
            port: e.url().and_then(|u| u.port_or_known_default()).unwrap_or(0),
            message: e.to_string(),
        };
    }
    if let Some(status) = e.status() {
        return EngineError::TransportError {
            status: status.as_u16() as u32,
            message: e.to_string(),
        };
    }
    EngineError::TransportError {
        status: 0,
        message: e.to_string(),
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    config_snapshot: RequestShape,
    body: Option<Pin<Box<dyn AsyncRead + Send>>>,
}

/// The request-shaping bits of `Config` this transport needs repeatedly;
/// cloned out once so `open()` doesn't need a `&Config` each call.
#[derive(Clone)]
struct RequestShape {
    headers: Vec<(String, String)>,
}

impl HttpTransport {
    pub fn new(url: Url, config: &Config) -> Self {
        let client = build_client(config, &url.host).unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url,
            config_snapshot: RequestShape {
                headers: config.add_headers.clone(),
            },
            body: None,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&mut self, range_start: u64, range_end: Option<u64>) -> Result<OpenOutcome> {
        let range_value = match range_end {
            Some(end) => format!("bytes={range_start}-{}", end.saturating_sub(1)),
            None => format!("bytes={range_start}-"),
        };

        let mut req = self.client.get(self.url.reconstruct());
        for (k, v) in &self.config_snapshot.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(ref user) = self.url.user {
            req = req.basic_auth(user, self.url.pass.clone());
        }
        req = req.header("Range", range_value);

        let resp = req.send().await.map_err(map_reqwest_err)?;
        let status = resp.status();
        if status.as_u16() >= 400 {
            return Err(EngineError::TransportError {
                status: status.as_u16() as u32,
                message: status.to_string(),
            });
        }

        let supported = status.as_u16() == 206;

        let stream = resp
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        self.body = Some(Box::pin(StreamReader::new(stream)));

        Ok(OpenOutcome { supported })
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        use tokio::io::AsyncReadExt;
        let body = self
            .body
            .as_mut()
            .ok_or_else(|| EngineError::TransportError {
                status: 0,
                message: "read before open".to_string(),
            })?;
        let n = body.read(buf).await?;
        Ok(n)
    }

    async fn close(&mut self) {
        self.body = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn probe_detects_range_support() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-0/1024")
                    .set_body_bytes(vec![0u8]),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/f", server.uri())).unwrap();
        let result = probe(&url, &Config::default()).await.unwrap();
        assert!(result.supported);
        assert_eq!(result.total_size, Some(1024));
    }

    #[tokio::test]
    async fn probe_detects_ignored_range() {
        let server = MockServer::start().await;
        let body = vec![0u8; 2048];
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Length", "2048")
                    .set_body_bytes(body),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/f", server.uri())).unwrap();
        let result = probe(&url, &Config::default()).await.unwrap();
        assert!(!result.supported);
        assert_eq!(result.total_size, Some(2048));
    }

    #[tokio::test]
    async fn open_reads_chunk_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-4/5")
                    .set_body_bytes(b"hello".to_vec()),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/f", server.uri())).unwrap();
        let mut transport = HttpTransport::new(url, &Config::default());
        let outcome = transport.open(0, Some(5)).await.unwrap();
        assert!(outcome.supported);

        let mut buf = vec![0u8; 16];
        let mut total = Vec::new();
        loop {
            let n = transport.read_chunk(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            total.extend_from_slice(&buf[..n]);
        }
        assert_eq!(total, b"hello");
    }

    #[tokio::test]
    async fn open_404_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let mut transport = HttpTransport::new(url, &Config::default());
        let err = transport.open(0, None).await.unwrap_err();
        match err {
            EngineError::TransportError { status, .. } => assert_eq!(status, 404),
            other => panic!("expected TransportError, got {other:?}"),
        }
    }
}
