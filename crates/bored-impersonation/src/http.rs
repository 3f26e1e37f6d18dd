//! HTTP/1.x request rewriting
//!
//! The rewriter follows request framing across a stream so that every
//! request of a keep-alive sequence gets its head rewritten, while bodies
//! are forwarded untouched. Once a request asks for a protocol upgrade the
//! rest of the stream is no longer HTTP and passes through as is.

use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

use crate::{ImpersonationError, ImpersonationResult, ImpersonationStage, TokenVerifier};

/// Largest request head accepted
pub const MAX_HEAD_LEN: usize = 64 * 1024;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// Longest chunk-size or trailer line accepted
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a complete request head
    Head,
    /// Forwarding a Content-Length body
    Body { remaining: u64 },
    /// Expecting a chunk-size line
    ChunkSize,
    /// Forwarding chunk data
    ChunkData { remaining: u64 },
    /// Expecting the CRLF after chunk data
    ChunkEnd,
    /// Forwarding trailer lines until the empty line
    Trailer,
    /// Upgraded: everything passes through
    Passthrough,
}

/// Per-stream impersonation stage for HTTP/1.x traffic
pub struct RequestRewriter {
    verifier: Arc<TokenVerifier>,
    service_account_token: Arc<str>,
    phase: Phase,
    buffer: BytesMut,
    requests: u64,
}

impl RequestRewriter {
    pub fn new(verifier: Arc<TokenVerifier>, service_account_token: Arc<str>) -> Self {
        Self {
            verifier,
            service_account_token,
            phase: Phase::Head,
            buffer: BytesMut::new(),
            requests: 0,
        }
    }

    /// Number of request heads rewritten so far
    pub fn requests_rewritten(&self) -> u64 {
        self.requests
    }

    /// Advance the state machine once; returns false when more input is needed
    fn step(&mut self, out: &mut BytesMut) -> ImpersonationResult<bool> {
        match self.phase {
            Phase::Head => self.rewrite_head(out),
            Phase::Body { remaining } => {
                let take = forward(&mut self.buffer, out, remaining);
                if take == remaining {
                    self.phase = Phase::Head;
                } else {
                    self.phase = Phase::Body {
                        remaining: remaining - take,
                    };
                }
                Ok(take > 0 || remaining == 0)
            }
            Phase::ChunkSize => {
                let Some(line) = take_line(&mut self.buffer)? else {
                    return Ok(false);
                };
                let size = parse_chunk_size(&line)?;
                out.extend_from_slice(&line);
                self.phase = if size == 0 {
                    Phase::Trailer
                } else {
                    Phase::ChunkData { remaining: size }
                };
                Ok(true)
            }
            Phase::ChunkData { remaining } => {
                let take = forward(&mut self.buffer, out, remaining);
                if take == remaining {
                    self.phase = Phase::ChunkEnd;
                } else {
                    self.phase = Phase::ChunkData {
                        remaining: remaining - take,
                    };
                }
                Ok(take > 0)
            }
            Phase::ChunkEnd => {
                if self.buffer.len() < 2 {
                    return Ok(false);
                }
                if &self.buffer[..2] != b"\r\n" {
                    return Err(ImpersonationError::MalformedRequest(
                        "chunk data not followed by CRLF".to_string(),
                    ));
                }
                out.extend_from_slice(&self.buffer.split_to(2));
                self.phase = Phase::ChunkSize;
                Ok(true)
            }
            Phase::Trailer => {
                let Some(line) = take_line(&mut self.buffer)? else {
                    return Ok(false);
                };
                out.extend_from_slice(&line);
                if line.as_ref() == b"\r\n" {
                    self.phase = Phase::Head;
                }
                Ok(true)
            }
            Phase::Passthrough => {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                out.extend_from_slice(&self.buffer.split());
                Ok(false)
            }
        }
    }

    fn rewrite_head(&mut self, out: &mut BytesMut) -> ImpersonationResult<bool> {
        if self.buffer.is_empty() {
            return Ok(false);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(&self.buffer) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if self.buffer.len() > MAX_HEAD_LEN {
                    return Err(ImpersonationError::HeadTooLarge(MAX_HEAD_LEN));
                }
                return Ok(false);
            }
            Err(e) => return Err(ImpersonationError::MalformedRequest(e.to_string())),
        };
        if head_len > MAX_HEAD_LEN {
            return Err(ImpersonationError::HeadTooLarge(MAX_HEAD_LEN));
        }

        let method = req.method.unwrap_or("");
        let path = req.path.unwrap_or("");
        let version = req.version.unwrap_or(1);

        let mut token = None;
        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        let mut upgrade = method.eq_ignore_ascii_case("CONNECT");

        for header in req.headers.iter() {
            let name = header.name;
            if name.eq_ignore_ascii_case("authorization") {
                token = bearer_token(header.value);
            } else if name.eq_ignore_ascii_case("content-length") {
                let value = std::str::from_utf8(header.value)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or_else(|| {
                        ImpersonationError::MalformedRequest("invalid Content-Length".to_string())
                    })?;
                content_length = Some(value);
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = String::from_utf8_lossy(header.value)
                    .to_ascii_lowercase()
                    .contains("chunked");
            } else if name.eq_ignore_ascii_case("upgrade") {
                upgrade = true;
            }
        }

        let token = token.ok_or(ImpersonationError::MissingToken)?;
        let claims = self.verifier.verify(&token)?;
        if !is_header_safe(&claims.sub) || !claims.groups.iter().all(|g| is_header_safe(g)) {
            return Err(ImpersonationError::InvalidToken(
                "claims contain characters not allowed in headers".to_string(),
            ));
        }

        out.extend_from_slice(format!("{} {} HTTP/1.{}\r\n", method, path, version).as_bytes());
        for header in req.headers.iter() {
            let lower = header.name.to_ascii_lowercase();
            if lower == "authorization" || lower.starts_with("impersonate-") {
                continue;
            }
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(
            format!("Authorization: Bearer {}\r\n", self.service_account_token).as_bytes(),
        );
        out.extend_from_slice(format!("Impersonate-User: {}\r\n", claims.sub).as_bytes());
        for group in &claims.groups {
            out.extend_from_slice(format!("Impersonate-Group: {}\r\n", group).as_bytes());
        }
        out.extend_from_slice(b"\r\n");

        debug!(
            method = %method,
            path = %path,
            user = %claims.sub,
            groups = claims.groups.len(),
            "Rewrote request for impersonation"
        );

        self.requests += 1;
        self.buffer.advance(head_len);
        self.phase = if upgrade {
            Phase::Passthrough
        } else if chunked {
            Phase::ChunkSize
        } else {
            match content_length {
                Some(0) | None => Phase::Head,
                Some(remaining) => Phase::Body { remaining },
            }
        };

        Ok(true)
    }
}

impl ImpersonationStage for RequestRewriter {
    fn process(&mut self, data: &[u8]) -> ImpersonationResult<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut out = BytesMut::with_capacity(data.len() + 256);
        while self.step(&mut out)? {}
        Ok(out.freeze())
    }
}

/// Move up to `limit` bytes from `buf` to `out`, returning how many moved
fn forward(buf: &mut BytesMut, out: &mut BytesMut, limit: u64) -> u64 {
    let take = (buf.len() as u64).min(limit);
    out.extend_from_slice(&buf.split_to(take as usize));
    take
}

/// Split off one CRLF-terminated line, including the terminator
fn take_line(buf: &mut BytesMut) -> ImpersonationResult<Option<BytesMut>> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => Ok(Some(buf.split_to(pos + 2))),
        None if buf.len() > MAX_CHUNK_LINE => Err(ImpersonationError::MalformedRequest(
            "chunk line too long".to_string(),
        )),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> ImpersonationResult<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ImpersonationError::MalformedRequest("non-ascii chunk size".to_string()))?;
    let size = text.trim_end().split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| ImpersonationError::MalformedRequest(format!("bad chunk size '{}'", size)))
}

fn bearer_token(value: &[u8]) -> Option<String> {
    let value = std::str::from_utf8(value).ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn is_header_safe(value: &str) -> bool {
    !value.is_empty() && !value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

    struct Fixture {
        key_pair: rcgen::KeyPair,
        verifier: Arc<TokenVerifier>,
    }

    impl Fixture {
        fn new() -> Self {
            let key_pair = rcgen::KeyPair::generate().unwrap();
            let verifier = Arc::new(TokenVerifier::from_pem(&key_pair.public_key_pem()).unwrap());
            Self { key_pair, verifier }
        }

        fn token(&self, sub: &str, groups: &[&str]) -> String {
            let claims = serde_json::json!({
                "sub": sub,
                "exp": chrono::Utc::now().timestamp() + 3600,
                "groups": groups,
            });
            let key = EncodingKey::from_ec_pem(self.key_pair.serialize_pem().as_bytes()).unwrap();
            encode(&Header::new(Algorithm::ES256), &claims, &key).unwrap()
        }

        fn rewriter(&self) -> RequestRewriter {
            RequestRewriter::new(self.verifier.clone(), Arc::from("sa-token"))
        }
    }

    fn text(bytes: &Bytes) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_head_is_rewritten() {
        let fixture = Fixture::new();
        let mut rewriter = fixture.rewriter();

        let request = format!(
            "GET /api/v1/pods HTTP/1.1\r\nHost: k8s\r\nAuthorization: Bearer {}\r\nImpersonate-User: admin\r\nimpersonate-group: system:masters\r\n\r\n",
            fixture.token("alice", &["dev", "ops"])
        );
        let out = text(&rewriter.process(request.as_bytes()).unwrap());

        assert!(out.starts_with("GET /api/v1/pods HTTP/1.1\r\nHost: k8s\r\n"));
        assert!(out.contains("Authorization: Bearer sa-token\r\n"));
        assert!(out.contains("Impersonate-User: alice\r\n"));
        assert!(out.contains("Impersonate-Group: dev\r\nImpersonate-Group: ops\r\n"));
        assert!(!out.contains("admin"));
        assert!(!out.contains("system:masters"));
        assert!(out.ends_with("\r\n\r\n"));
        assert_eq!(out.matches("Authorization").count(), 1);
    }

    #[test]
    fn test_head_split_across_reads() {
        let fixture = Fixture::new();
        let mut rewriter = fixture.rewriter();

        let request = format!(
            "GET /version HTTP/1.1\r\nAuthorization: Bearer {}\r\n\r\n",
            fixture.token("alice", &[])
        );
        let (first, second) = request.as_bytes().split_at(20);

        assert!(rewriter.process(first).unwrap().is_empty());
        let out = text(&rewriter.process(second).unwrap());
        assert!(out.contains("Impersonate-User: alice"));
    }

    #[test]
    fn test_content_length_body_then_next_request() {
        let fixture = Fixture::new();
        let mut rewriter = fixture.rewriter();
        let token = fixture.token("alice", &[]);

        // The body looks like a request head with a forged identity
        let body = "GET / HTTP/1.1\r\nImpersonate-User: x\r\n\r\n";
        let request = format!(
            "POST /apply HTTP/1.1\r\nAuthorization: Bearer {}\r\nContent-Length: {}\r\n\r\n{}GET /next HTTP/1.1\r\nAuthorization: Bearer {}\r\n\r\n",
            token,
            body.len(),
            body,
            token
        );
        let out = text(&rewriter.process(request.as_bytes()).unwrap());

        assert!(out.contains(body));
        assert!(out.contains("GET /next HTTP/1.1\r\n"));
        assert_eq!(out.matches("Impersonate-User: alice").count(), 2);
        assert_eq!(rewriter.requests_rewritten(), 2);
    }

    #[test]
    fn test_chunked_body_is_forwarded() {
        let fixture = Fixture::new();
        let mut rewriter = fixture.rewriter();

        let head = format!(
            "POST /upload HTTP/1.1\r\nAuthorization: Bearer {}\r\nTransfer-Encoding: chunked\r\n\r\n",
            fixture.token("alice", &[])
        );
        let body = "5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n";

        let mut out = text(&rewriter.process(head.as_bytes()).unwrap());
        for byte in body.as_bytes() {
            out.push_str(&text(&rewriter.process(std::slice::from_ref(byte)).unwrap()));
        }

        assert!(out.ends_with(body));
        assert_eq!(rewriter.phase, Phase::Head);
    }

    #[test]
    fn test_upgrade_switches_to_passthrough() {
        let fixture = Fixture::new();
        let mut rewriter = fixture.rewriter();

        let request = format!(
            "GET /exec HTTP/1.1\r\nAuthorization: Bearer {}\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\n\r\n",
            fixture.token("alice", &[])
        );
        rewriter.process(request.as_bytes()).unwrap();

        let raw = b"GET /not-http HTTP/1.1\r\n\r\n";
        assert_eq!(rewriter.process(raw).unwrap().as_ref(), raw);
    }

    #[test]
    fn test_missing_token_is_rejected() {
        let fixture = Fixture::new();
        let mut rewriter = fixture.rewriter();

        let result = rewriter.process(b"GET / HTTP/1.1\r\nHost: k8s\r\n\r\n");
        assert!(matches!(result, Err(ImpersonationError::MissingToken)));
    }

    #[test]
    fn test_invalid_token_is_rejected() {
        let fixture = Fixture::new();
        let mut rewriter = fixture.rewriter();

        let result = rewriter.process(b"GET / HTTP/1.1\r\nAuthorization: Bearer abc.def.ghi\r\n\r\n");
        assert!(matches!(result, Err(ImpersonationError::InvalidToken(_))));
    }

    #[test]
    fn test_oversized_head_is_rejected() {
        let fixture = Fixture::new();
        let mut rewriter = fixture.rewriter();

        let mut request = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
        request.extend(std::iter::repeat(b'a').take(MAX_HEAD_LEN + 1));
        assert!(matches!(
            rewriter.process(&request),
            Err(ImpersonationError::HeadTooLarge(_))
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let fixture = Fixture::new();
        let mut rewriter = fixture.rewriter();

        assert!(matches!(
            rewriter.process(b"\x16\x03\x01 not http\r\n\r\n"),
            Err(ImpersonationError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(b"Bearer abc"), Some("abc".to_string()));
        assert_eq!(bearer_token(b"bearer  abc "), Some("abc".to_string()));
        assert_eq!(bearer_token(b"Basic abc"), None);
        assert_eq!(bearer_token(b"Bearer "), None);
    }
}
