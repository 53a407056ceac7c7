//! Bounded reads of outbound HTTP response bodies.

use thiserror::Error;

/// A capped body read failed.
#[derive(Debug, Error)]
pub(crate) enum BodyError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Reads a response body chunk-wise, failing once `limit` is exceeded so a
/// misbehaving peer cannot exhaust memory.
pub(crate) async fn read_capped(
    mut resp: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, BodyError> {
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
