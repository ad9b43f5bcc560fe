//! Forwarded-request envelope.
//!
//! An HTTP-like request relayed from the host to a plugin. The serialized form
//! is a one-byte header followed by the payload:
//!
//! ```text
//! +--------+-----------------------------+
//! | header |  protobuf | json (gzip?)    |
//! +--------+-----------------------------+
//!  bit 7      : payload is gzip compressed
//!  bits 0..=6 : 0x01 protobuf, 0x02 json
//! ```
//!
//! Decoding reads the header, so it never depends on the process-wide mode.

use super::{encode_message_as, Encoding};
use crate::errors::{Result, WardenError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::SocketAddr;

const FORMAT_BINARY: u8 = 0x01;
const FORMAT_JSON: u8 = 0x02;
const FORMAT_MASK: u8 = 0x7f;
const COMPRESSED: u8 = 0x80;

/// Decompressed envelopes larger than this are rejected
pub const MAX_DECOMPRESSED_BYTES: u64 = 32 * 1024 * 1024;

/// Parsed request target
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestUrl {
    #[prost(string, tag = "1")]
    pub scheme: String,
    #[prost(string, tag = "2")]
    pub opaque: String,
    #[prost(string, tag = "3")]
    pub host: String,
    #[prost(string, tag = "4")]
    pub path: String,
    /// Encoded path when it differs from `path`
    #[prost(string, tag = "5")]
    pub raw_path: String,
    #[prost(string, tag = "6")]
    pub raw_query: String,
    #[prost(string, tag = "7")]
    pub fragment: String,
}

/// All values of one header, in order
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderValues {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardedRequest {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(message, optional, tag = "2")]
    pub url: Option<RequestUrl>,
    #[prost(btree_map = "string, message", tag = "3")]
    pub headers: BTreeMap<String, HeaderValues>,
    #[prost(bytes = "vec", tag = "4")]
    #[serde(with = "crate::codec::base64_bytes")]
    pub body: Vec<u8>,
    #[prost(string, tag = "5")]
    pub host: String,
    #[prost(string, tag = "6")]
    pub remote_addr: String,
    /// DER certificates presented by the client, leaf first
    #[prost(bytes = "vec", repeated, tag = "7")]
    #[serde(with = "crate::codec::base64_bytes_list")]
    pub peer_certificates: Vec<Vec<u8>>,
}

impl ForwardedRequest {
    /// Capture an `http` request
    pub fn from_http(request: &http::Request<Vec<u8>>, remote_addr: Option<SocketAddr>) -> Self {
        let uri = request.uri();
        let path = uri.path().to_string();
        let decoded_path = percent_decode(&path);
        let (path, raw_path) = match decoded_path {
            Some(decoded) if decoded != path => (decoded, path),
            _ => (path, String::new()),
        };

        let url = RequestUrl {
            scheme: uri.scheme_str().unwrap_or_default().to_string(),
            host: uri.authority().map(|a| a.to_string()).unwrap_or_default(),
            path,
            raw_path,
            raw_query: uri.query().unwrap_or_default().to_string(),
            ..Default::default()
        };

        let mut headers: BTreeMap<String, HeaderValues> = BTreeMap::new();
        for (name, value) in request.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .values
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let host = request
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| url.host.clone());

        Self {
            method: request.method().as_str().to_string(),
            url: Some(url),
            headers,
            body: request.body().clone(),
            host,
            remote_addr: remote_addr.map(|a| a.to_string()).unwrap_or_default(),
            peer_certificates: Vec::new(),
        }
    }

    /// Rebuild an `http` request. The fragment is not representable and is dropped.
    pub fn to_http(&self) -> Result<http::Request<Vec<u8>>> {
        let target = self.request_target();
        let mut builder = http::Request::builder().method(self.method.as_str()).uri(target.as_str());

        for (name, values) in &self.headers {
            for value in &values.values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        builder
            .body(self.body.clone())
            .map_err(|e| WardenError::codec(format!("Invalid forwarded request: {}", e)))
    }

    fn request_target(&self) -> String {
        let Some(url) = &self.url else {
            return "/".to_string();
        };

        let path = if !url.raw_path.is_empty() { &url.raw_path } else { &url.path };
        let mut target = String::new();
        if !url.scheme.is_empty() && !url.host.is_empty() {
            target.push_str(&url.scheme);
            target.push_str("://");
            target.push_str(&url.host);
        }
        if path.is_empty() {
            target.push('/');
        } else {
            target.push_str(path);
        }
        if !url.raw_query.is_empty() {
            target.push('?');
            target.push_str(&url.raw_query);
        }
        target
    }
}

fn percent_decode(input: &str) -> Option<String> {
    if !input.contains('%') {
        return None;
    }

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Serialize with the process-wide encoding
pub fn encode_forwarded_request(request: &ForwardedRequest, compress: bool) -> Result<Vec<u8>> {
    encode_forwarded_request_as(request, super::current_encoding(), compress)
}

/// Serialize with an explicit encoding
pub fn encode_forwarded_request_as(
    request: &ForwardedRequest,
    encoding: Encoding,
    compress: bool,
) -> Result<Vec<u8>> {
    let payload = encode_message_as(request, encoding)?;
    let mut header = match encoding {
        Encoding::Binary => FORMAT_BINARY,
        Encoding::Json => FORMAT_JSON,
    };

    let body = if compress {
        header |= COMPRESSED;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).map_err(|e| WardenError::io(e, "Failed to compress envelope"))?;
        encoder.finish().map_err(|e| WardenError::io(e, "Failed to compress envelope"))?
    } else {
        payload
    };

    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(header);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize an envelope produced by [`encode_forwarded_request`]
pub fn decode_forwarded_request(bytes: &[u8]) -> Result<ForwardedRequest> {
    let (&header, body) =
        bytes.split_first().ok_or_else(|| WardenError::codec("Empty forwarded request envelope"))?;

    let format = header & FORMAT_MASK;
    if format != FORMAT_BINARY && format != FORMAT_JSON {
        return Err(WardenError::codec(format!("Unknown envelope format 0x{:02x}", format)));
    }

    let payload = if header & COMPRESSED != 0 {
        let mut decoded = Vec::new();
        GzDecoder::new(body)
            .take(MAX_DECOMPRESSED_BYTES + 1)
            .read_to_end(&mut decoded)
            .map_err(|e| WardenError::codec(format!("Invalid gzip payload: {}", e)))?;
        if decoded.len() as u64 > MAX_DECOMPRESSED_BYTES {
            return Err(WardenError::codec("Forwarded request exceeds size limit"));
        }
        decoded
    } else {
        body.to_vec()
    };

    if format == FORMAT_JSON {
        serde_json::from_slice(&payload)
            .map_err(|e| WardenError::codec(format!("JSON decode failed: {}", e)))
    } else {
        Ok(<ForwardedRequest as prost::Message>::decode(payload.as_slice())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> ForwardedRequest {
        let mut headers = BTreeMap::new();
        headers.insert(
            "x-forwarded-for".to_string(),
            HeaderValues { values: vec!["10.0.0.1".into(), "10.0.0.2".into()] },
        );
        ForwardedRequest {
            method: "POST".into(),
            url: Some(RequestUrl {
                scheme: "https".into(),
                host: "warden.internal:8200".into(),
                path: "/v1/database/creds/readonly".into(),
                raw_query: "version=2".into(),
                fragment: "frag".into(),
                ..Default::default()
            }),
            headers,
            body: br#"{"ttl":"1h"}"#.to_vec(),
            host: "warden.internal:8200".into(),
            remote_addr: "10.0.0.9:51234".into(),
            peer_certificates: vec![vec![0x30, 0x82, 0x01], vec![0x30, 0x82, 0x02]],
        }
    }

    #[test]
    fn test_envelope_in_every_mode() {
        let request = sample();
        for encoding in [Encoding::Binary, Encoding::Json] {
            for compress in [false, true] {
                let bytes = encode_forwarded_request_as(&request, encoding, compress).unwrap();
                assert_eq!(bytes[0] & COMPRESSED != 0, compress);
                assert_eq!(decode_forwarded_request(&bytes).unwrap(), request);
            }
        }
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert!(decode_forwarded_request(&[]).is_err());
        assert!(decode_forwarded_request(&[0x05, 1, 2]).is_err());
        assert!(decode_forwarded_request(&[FORMAT_BINARY | COMPRESSED, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_http_conversion() {
        let request = http::Request::builder()
            .method("PUT")
            .uri("https://warden.internal/v1/sys/leases/renew%2Fx?force=true")
            .header("x-token", "abc")
            .header("x-multi", "one")
            .header("x-multi", "two")
            .body(b"payload".to_vec())
            .unwrap();

        let forwarded = ForwardedRequest::from_http(&request, "127.0.0.1:9000".parse().ok());
        let url = forwarded.url.clone().unwrap();
        assert_eq!(url.path, "/v1/sys/leases/renew/x");
        assert_eq!(url.raw_path, "/v1/sys/leases/renew%2Fx");
        assert_eq!(url.raw_query, "force=true");
        assert_eq!(forwarded.headers["x-multi"].values, vec!["one", "two"]);
        assert_eq!(forwarded.remote_addr, "127.0.0.1:9000");

        let rebuilt = forwarded.to_http().unwrap();
        assert_eq!(rebuilt.method(), http::Method::PUT);
        assert_eq!(rebuilt.uri().path(), "/v1/sys/leases/renew%2Fx");
        assert_eq!(rebuilt.uri().query(), Some("force=true"));
        assert_eq!(rebuilt.headers().get_all("x-multi").iter().count(), 2);
        assert_eq!(rebuilt.body(), b"payload");
    }

    fn header_values() -> impl Strategy<Value = HeaderValues> {
        prop::collection::vec("[ -~]{0,16}", 0..3).prop_map(|values| HeaderValues { values })
    }

    proptest! {
        #[test]
        fn prop_envelope_round_trip(
            method in "[A-Z]{3,7}",
            path in "/[a-z0-9/]{0,24}",
            query in "[a-z=&]{0,12}",
            headers in prop::collection::btree_map("[a-z-]{1,12}", header_values(), 0..4),
            body in prop::collection::vec(any::<u8>(), 0..256),
            certs in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 0..3),
            json in any::<bool>(),
            compress in any::<bool>(),
        ) {
            let request = ForwardedRequest {
                method,
                url: Some(RequestUrl { path, raw_query: query, ..Default::default() }),
                headers,
                body,
                host: "h".into(),
                remote_addr: String::new(),
                peer_certificates: certs,
            };
            let encoding = if json { Encoding::Json } else { Encoding::Binary };
            let bytes = encode_forwarded_request_as(&request, encoding, compress).unwrap();
            prop_assert_eq!(decode_forwarded_request(&bytes).unwrap(), request);
        }
    }
}
