//! FTP transport client (spec.md §4.2). Logs in (anonymous when no
//! credentials), sets binary mode, issues `SIZE` on probe only, and
//! `REST <start>` + `RETR <path>` per `open()`. `supported` is true iff
//! `REST` is accepted.

use async_trait::async_trait;
use futures_util::io::{AsyncRead, AsyncReadExt};
use suppaftp::{AsyncFtpStream, FtpError};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::url::Url;

use super::{OpenOutcome, ProbeResult, Transport};

fn map_ftp_err(host: &str, port: u16, e: FtpError) -> EngineError {
    match e {
        FtpError::ConnectionError(io_err) => EngineError::Connect {
            host: host.to_string(),
            port,
            message: io_err.to_string(),
        },
        other => EngineError::TransportError {
            status: 0,
            message: other.to_string(),
        },
    }
}

async fn connect_and_login(url: &Url, config: &Config) -> Result<AsyncFtpStream> {
    let addr = format!("{}:{}", url.host, url.port);

    let mut stream = tokio::time::timeout(config.io_timeout, AsyncFtpStream::connect(&addr))
        .await
        .map_err(|_| EngineError::IoTimeout)?
        .map_err(|e| map_ftp_err(&url.host, url.port, e))?;

    let user = url.user.clone().unwrap_or_else(|| "anonymous".to_string());
    let pass = url.pass.clone().unwrap_or_default();
    stream
        .login(&user, &pass)
        .await
        .map_err(|e| map_ftp_err(&url.host, url.port, e))?;

    stream
        .transfer_type(suppaftp::types::FileType::Binary)
        .await
        .map_err(|e| map_ftp_err(&url.host, url.port, e))?;

    Ok(stream)
}

pub async fn probe(url: &Url, config: &Config) -> Result<ProbeResult> {
    let mut stream = connect_and_login(url, config).await?;

    let total_size = stream.size(&url.path).await.ok().map(|s| s as u64);
    let supported = stream.resume_transfer(0).await.is_ok();
    let _ = stream.quit().await;

    Ok(ProbeResult {
        total_size,
        supported,
    })
}

pub struct FtpTransport {
    url: Url,
    io_timeout: std::time::Duration,
    stream: Option<AsyncFtpStream>,
    reader: Option<Box<dyn AsyncRead + Unpin + Send>>,
}

impl FtpTransport {
    pub fn new(url: Url, config: &Config) -> Self {
        Self {
            url,
            io_timeout: config.io_timeout,
            stream: None,
            reader: None,
        }
    }
}

#[async_trait]
impl Transport for FtpTransport {
    async fn open(&mut self, range_start: u64, _range_end: Option<u64>) -> Result<OpenOutcome> {
        let url = self.url.clone();
        let mut stream = connect_and_login(&url, &Config {
            io_timeout: self.io_timeout,
            ..Config::default()
        })
        .await?;

        let supported = if range_start > 0 {
            stream.resume_transfer(range_start as usize).await.is_ok()
        } else {
            true
        };

        let data_stream = stream
            .retr_as_stream(&url.path)
            .await
            .map_err(|e| map_ftp_err(&url.host, url.port, e))?;

        self.reader = Some(Box::new(data_stream));
        self.stream = Some(stream);

        Ok(OpenOutcome { supported })
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| EngineError::TransportError {
                status: 0,
                message: "read before open".to_string(),
            })?;
        let n = tokio::time::timeout(self.io_timeout, reader.read(buf))
            .await
            .map_err(|_| EngineError::IoTimeout)?
            .map_err(EngineError::FileIo)?;
        Ok(n)
    }

    async fn close(&mut self) {
        // Dropping the data-connection reader closes it; `quit` then tears
        // down the control connection. We don't read the server's
        // transfer-complete reply (no `finalize_retr_stream`) since the
        // reader was erased to a trait object — harmless, as the bytes are
        // already flushed to the output file by the time `close` runs.
        self.reader = None;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.quit().await;
        }
    }
}
