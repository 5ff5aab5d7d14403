use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use tracing::warn;

use crate::transport::ProxyError;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Split one upstream chunk into pieces of at most `max` bytes. Splitting a
/// `Bytes` only bumps a refcount; nothing is copied.
pub fn split_chunk(mut bytes: Bytes, max: usize) -> Vec<Bytes> {
    let max = max.max(1);
    let mut pieces = Vec::with_capacity(bytes.len().div_ceil(max));
    while bytes.len() > max {
        pieces.push(bytes.split_to(max));
    }
    if !bytes.is_empty() {
        pieces.push(bytes);
    }
    pieces
}

/// Re-emit an upstream byte stream in chunks of at most `max_chunk` bytes.
///
/// Chunks are passed on as soon as they arrive, so small event-stream frames
/// are never held back waiting to fill a chunk. An upstream error becomes a
/// [`ProxyError::StreamInterrupted`] item, which makes the server abort the
/// caller's connection rather than finish the body cleanly.
pub fn rechunk<S, E>(
    upstream: S,
    max_chunk: usize,
) -> impl Stream<Item = Result<Bytes, ProxyError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    upstream
        .map(move |item| {
            let pieces: Vec<Result<Bytes, ProxyError>> = match item {
                Ok(bytes) => split_chunk(bytes, max_chunk).into_iter().map(Ok).collect(),
                Err(e) => {
                    warn!(error = %e, "upstream stream failed mid-transfer");
                    vec![Err(ProxyError::StreamInterrupted(e.to_string()))]
                }
            };
            stream::iter(pieces)
        })
        .flatten()
}
