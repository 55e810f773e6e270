// Copyright 2024-2025 Weft Compute
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Streaming HTTP relay plumbing shared by every hop in the fabric: the
//! coordinator's reverse proxy, the edge router's forwarder and the
//! worker-to-worker request router.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use poem::http::StatusCode;
use poem::{Body, Response};

/// Request bodies up to this size are buffered so a failed attempt can be
/// replayed against another upstream; larger bodies are streamed to a
/// single target.
pub const REPLAY_THRESHOLD: usize = 256 * 1024;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub enum RelayPayload {
    Buffered(Bytes),
    Streaming(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

impl RelayPayload {
    pub fn replayable(&self) -> bool {
        matches!(self, RelayPayload::Buffered(_))
    }
}

/// Reads the incoming body up to the replay threshold; a body that fits
/// becomes replayable, the rest stays a stream with the already-read
/// prefix chained back on.
pub async fn read_payload(body: Body) -> Result<RelayPayload, std::io::Error> {
    let mut stream = body.into_bytes_stream().boxed();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        total += chunk.len();
        chunks.push(chunk);
        if total > REPLAY_THRESHOLD {
            let prefix = futures::stream::iter(chunks.into_iter().map(Ok));
            return Ok(RelayPayload::Streaming(prefix.chain(stream).boxed()));
        }
    }
    Ok(RelayPayload::Buffered(chunks.concat().into()))
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|header| header.eq_ignore_ascii_case(name))
}

/// Copies end-to-end request headers onto the outgoing request.
pub fn copy_request_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &poem::http::HeaderMap,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    builder
}

/// Turns an upstream response into a poem response, streaming the body
/// through without buffering.
pub fn relay_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    let stream = upstream
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    builder.body(Body::from_bytes_stream(stream))
}

pub fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response {
    let rendered = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .content_type("application/json")
        .body(rendered)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn hop_by_hop_headers_are_filtered_case_insensitively() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("HOST"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("authorization"));
    }

    #[test]
    async fn small_bodies_are_replayable() {
        let payload = read_payload(Body::from_string("hello".to_string()))
            .await
            .unwrap();
        assert!(payload.replayable());
        match payload {
            RelayPayload::Buffered(bytes) => assert_eq!(&bytes[..], b"hello"),
            RelayPayload::Streaming(_) => panic!("small body must be buffered"),
        }
    }

    #[test]
    async fn large_bodies_switch_to_streaming() {
        let big = vec![0u8; REPLAY_THRESHOLD + 1];
        let payload = read_payload(Body::from_vec(big)).await.unwrap();
        assert!(!payload.replayable());
    }
}
