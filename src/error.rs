/// Errors surfaced by the engine. Variants map directly onto the taxonomy
/// the coordinator and transports use to decide retry vs. disable vs. abort.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unparseable or unsupported URL: {0}")]
    BadUrl(String),

    #[error("DNS resolution failed for {host}: {message}")]
    Resolve { host: String, message: String },

    #[error("connect failed for {host}:{port}: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },

    #[error("transport error (status/code {status}): {message}")]
    TransportError { status: u32, message: String },

    #[error("peer ignored byte range request")]
    RangeUnsupported,

    #[error("socket inactive past the configured timeout")]
    IoTimeout,

    #[error("local filesystem error: {0}")]
    FileIo(#[from] std::io::Error),

    #[error("output file exists but no state file was found, and the peer supports resume")]
    NoStateCannotResume,

    #[error("output already complete and no_clobber is set")]
    AlreadyComplete,

    #[error("all connections exhausted retries and alternate URLs")]
    AllConnectionsFailed,

    #[error("no URLs were provided")]
    EmptyUrlPool,
}

pub type Result<T> = std::result::Result<T, EngineError>;
