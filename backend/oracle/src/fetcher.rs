//! Artifact retrieval from a content-addressed gateway.
//!
//! One `GET {gateway}/{cid}` per call. Retrying is the orchestrator's job;
//! this module only classifies what went wrong.

use std::time::Duration;

use bytes::BytesMut;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

use crate::errors::FetchError;
use crate::verifier::ProofArtifact;

#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    client: Client,
    gateway: String,
    max_bytes: u64,
}

impl ArtifactFetcher {
    pub fn new(gateway: &str, timeout: Duration, max_bytes: u64) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            gateway: gateway.trim_end_matches('/').to_string(),
            max_bytes,
        })
    }

    pub fn url_for(&self, cid: &str) -> String {
        format!("{}/{}", self.gateway, cid)
    }

    /// Download the artifact for `cid`, hashing it on success.
    ///
    /// The body is streamed and abandoned as soon as it crosses the size
    /// ceiling, so a hostile gateway cannot make us buffer an unbounded file.
    pub async fn fetch(&self, cid: &str) -> Result<ProofArtifact, FetchError> {
        let url = self.url_for(cid);
        info!("Fetching proof artifact from {url}");

        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify(cid, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(FetchError::NotFound {
                cid: cid.to_string(),
                status: status.as_u16(),
            });
        }
        if status.is_client_error()
            && status != StatusCode::REQUEST_TIMEOUT
            && status != StatusCode::TOO_MANY_REQUESTS
        {
            return Err(FetchError::Rejected {
                cid: cid.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Network(format!(
                "gateway returned HTTP {status} for {cid}"
            )));
        }

        if let Some(len) = response.content_length() {
            debug!("Declared artifact size: {len} bytes");
            if len > self.max_bytes {
                return Err(FetchError::TooLarge {
                    size: len,
                    max: self.max_bytes,
                });
            }
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(cid, e))? {
            let size = (buf.len() + chunk.len()) as u64;
            if size > self.max_bytes {
                return Err(FetchError::TooLarge {
                    size,
                    max: self.max_bytes,
                });
            }
            buf.extend_from_slice(&chunk);
        }

        if buf.is_empty() {
            return Err(FetchError::Empty {
                cid: cid.to_string(),
            });
        }

        let artifact = ProofArtifact::new(cid, buf.freeze());
        info!(
            "Downloaded {} bytes, sha256 {}",
            artifact.len(),
            artifact.digest
        );
        Ok(artifact)
    }
}

fn classify(cid: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            cid: cid.to_string(),
        }
    } else {
        FetchError::Network(e.to_string())
    }
}
