//! Streaming checksum support for the `checksum` extension.

use crate::errors::{TusError, TusResult};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::Stream;
use sha2::Digest;
use std::{
    io,
    pin::Pin,
    str::FromStr,
    task::{Context, Poll, ready},
};
use thiserror::Error;

/// Value advertised in `Tus-Checksum-Algorithm`.
pub const SUPPORTED_ALGORITHMS: &str = "sha1,sha256,md5";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported checksum algorithm `{0}`")]
pub struct UnsupportedAlgorithm(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Md5 => "md5",
        }
    }

    pub fn hasher(self) -> ChecksumHasher {
        match self {
            ChecksumAlgorithm::Sha1 => ChecksumHasher::Sha1(sha1::Sha1::new()),
            ChecksumAlgorithm::Sha256 => ChecksumHasher::Sha256(sha2::Sha256::new()),
            ChecksumAlgorithm::Md5 => ChecksumHasher::Md5(md5::Context::new()),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = UnsupportedAlgorithm;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "sha1" => Ok(ChecksumAlgorithm::Sha1),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "md5" => Ok(ChecksumAlgorithm::Md5),
            other => Err(UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Incremental digest over one of the supported algorithms.
pub enum ChecksumHasher {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Md5(md5::Context),
}

impl ChecksumHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumHasher::Sha1(h) => h.update(data),
            ChecksumHasher::Sha256(h) => h.update(data),
            ChecksumHasher::Md5(ctx) => ctx.consume(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            ChecksumHasher::Sha1(h) => h.finalize().to_vec(),
            ChecksumHasher::Sha256(h) => h.finalize().to_vec(),
            ChecksumHasher::Md5(ctx) => ctx.compute().0.to_vec(),
        }
    }
}

/// Parsed `Upload-Checksum: <algorithm> <base64 digest>` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumDeclaration {
    pub algorithm: ChecksumAlgorithm,
    pub digest: Vec<u8>,
}

impl ChecksumDeclaration {
    pub fn parse(value: &str) -> TusResult<Self> {
        let parts: Vec<&str> = value.split(' ').filter(|p| !p.is_empty()).collect();
        let [algorithm, encoded] = parts.as_slice() else {
            return Err(TusError::malformed(
                "Upload-Checksum must be `<algorithm> <base64 digest>`",
            ));
        };
        let algorithm = algorithm.parse::<ChecksumAlgorithm>()?;
        let digest = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| TusError::malformed("Upload-Checksum digest is not valid base64"))?;
        Ok(Self { algorithm, digest })
    }

    pub fn matches(&self, computed: &[u8]) -> bool {
        self.digest.as_slice() == computed
    }

    /// Canonical header form, used as the content-addressed lookup key.
    pub fn to_header_value(&self) -> String {
        format!(
            "{} {}",
            self.algorithm.name(),
            general_purpose::STANDARD.encode(&self.digest)
        )
    }
}

/// Pass-through stream that digests every chunk it yields.
pub struct DigestStream<S> {
    inner: S,
    hasher: ChecksumHasher,
}

impl<S> DigestStream<S> {
    pub fn new(inner: S, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            inner,
            hasher: algorithm.hasher(),
        }
    }

    /// Digest of everything yielded so far.
    pub fn finalize(self) -> Vec<u8> {
        self.hasher.finalize()
    }
}

impl<S> Stream for DigestStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = ready!(Pin::new(&mut this.inner).poll_next(cx));
        if let Some(Ok(chunk)) = &item {
            this.hasher.update(chunk);
        }
        Poll::Ready(item)
    }
}
