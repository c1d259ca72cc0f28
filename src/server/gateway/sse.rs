use async_compression::tokio::bufread::GzipDecoder;
use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::io;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, error};

/// Error texts that mean the peer went away, not that something broke.
/// These end the relay at debug level.
const DISCONNECT_MARKERS: &[&str] = &[
    "connection reset",
    "broken pipe",
    "eof",
    "context canceled",
    "context deadline exceeded",
    "use of closed network connection",
    "client disconnected",
];

pub fn is_normal_disconnect(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    DISCONNECT_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Splits an SSE byte stream into `\n\n`-delimited frames and re-prefixes
/// the `data:` path of every `event: endpoint` frame with the gateway
/// route, so downstream clients keep addressing the gateway instead of the
/// upstream. Frames without an endpoint event pass through byte-identical.
pub struct FrameRewriter {
    buffer: BytesMut,
    prefix: String,
}

impl FrameRewriter {
    pub fn new(gateway_prefix: &str, instance_id: &str) -> Self {
        Self {
            buffer: BytesMut::new(),
            prefix: format!("/{}/{}", gateway_prefix.trim_matches('/'), instance_id),
        }
    }

    /// Feed a chunk; returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|window| window == b"\n\n") {
            let frame = self.buffer.split_to(end + 2);
            frames.push(self.rewrite(frame.freeze()));
        }
        frames
    }

    /// Flush whatever trails the last complete frame, untouched.
    pub fn finish(&mut self) -> Option<Bytes> {
        (!self.buffer.is_empty()).then(|| self.buffer.split().freeze())
    }

    fn rewrite(&self, frame: Bytes) -> Bytes {
        let Ok(text) = std::str::from_utf8(&frame) else {
            return frame;
        };
        if !text.contains("event: endpoint") && !text.contains("event:endpoint") {
            return frame;
        }

        let rewritten: Vec<String> = text
            .split('\n')
            .map(|line| {
                let Some(payload) = line.strip_prefix("data:") else {
                    return line.to_string();
                };
                let trimmed = payload.trim_start();
                if !trimmed.starts_with('/') {
                    return line.to_string();
                }
                let spacing = &payload[..payload.len() - trimmed.len()];
                format!("data:{}{}{}", spacing, self.prefix, trimmed)
            })
            .collect();

        Bytes::from(rewritten.join("\n"))
    }
}

/// Upstream bytes as an io stream, transparently gunzipping when the
/// upstream sent `Content-Encoding: gzip`.
pub fn decode_stream<S>(stream: S, gzip: bool) -> BoxStream<'static, io::Result<Bytes>>
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    if gzip {
        let reader = StreamReader::new(stream);
        ReaderStream::new(GzipDecoder::new(reader)).boxed()
    } else {
        stream.boxed()
    }
}

/// Lazy frame-by-frame relay. Each chunk is consumed cooperatively; the
/// stream ends when the client drops it or the upstream closes.
fn frame_stream(
    upstream: BoxStream<'static, io::Result<Bytes>>,
    mut rewriter: FrameRewriter,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    async_stream::stream! {
        let mut upstream = upstream;
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in rewriter.push(&bytes) {
                        yield Ok(frame);
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    if is_normal_disconnect(&message) {
                        debug!(error = message, "sse stream closed");
                    } else {
                        error!(error = message, "sse stream failed");
                    }
                    break;
                }
            }
        }
        if let Some(rest) = rewriter.finish() {
            yield Ok(rest);
        }
    }
}

/// Response body relaying an upstream SSE stream through the rewriter.
pub fn rewritten_body(
    upstream: BoxStream<'static, io::Result<Bytes>>,
    rewriter: FrameRewriter,
) -> Body {
    Body::from_stream(frame_stream(upstream, rewriter))
}
