//! Minimal one-shot HTTP/1.1 framing over any `Read + Write` stream —
//! TCP or a Unix domain socket.
//!
//! `reqwest` has no first-class way to dial an arbitrary Unix socket
//! path, which is exactly what talking to the Docker daemon requires.
//! This crate doesn't attempt to be a general HTTP client: every
//! connection carries exactly one request/response pair and is then
//! done, matching how the proxy treats Docker API connections.

use std::io::{BufRead, BufReader, Read, Write};

use anyhow::{Context, Result, bail};

/// An HTTP request in relative-URL form (no scheme or host), the only
/// form the Docker daemon accepts over its socket.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    /// Replace (or insert) a header, matching case-insensitively.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        set_header(&mut self.headers, name, value.into());
    }
}

/// An HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        set_header(&mut self.headers, name, value.into());
    }

    pub fn is_upgrade(&self) -> bool {
        self.status == 101
    }
}

fn header_lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    if let Some(existing) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        existing.1 = value;
    } else {
        headers.push((name.to_string(), value));
    }
}

/// A single-use HTTP/1.1 connection wrapper. Reads are line-buffered
/// internally; [`Connection::into_parts`] hands back the underlying
/// stream plus any bytes already buffered past the framed message, so
/// callers can hand off to a raw byte pump after a protocol upgrade.
pub struct Connection<S> {
    reader: BufReader<S>,
}

const MAX_HEADER_LINE: usize = 8 * 1024;
const MAX_HEADERS: usize = 256;

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Split into the underlying stream and any bytes the internal
    /// buffer had already read ahead of the last framed message.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        let leftover = self.reader.buffer().to_vec();
        (self.reader.into_inner(), leftover)
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.reader.get_mut()
    }

    pub fn read_request(&mut self) -> Result<Request> {
        let request_line = read_line(&mut self.reader)?;
        let mut parts = request_line.splitn(3, ' ');
        let method = parts.next().context("http: missing method")?.to_string();
        let target = parts.next().context("http: missing target")?.to_string();
        let _version = parts.next().context("http: missing version")?;

        let headers = read_headers(&mut self.reader)?;
        let body = read_body(&mut self.reader, &headers, RequestOrResponse::Request)?;

        Ok(Request {
            method,
            target,
            headers,
            body,
        })
    }

    pub fn read_response(&mut self) -> Result<Response> {
        let status_line = read_line(&mut self.reader)?;
        let mut parts = status_line.splitn(3, ' ');
        let _version = parts.next().context("http: missing version")?;
        let status: u16 = parts
            .next()
            .context("http: missing status code")?
            .parse()
            .context("http: malformed status code")?;
        let reason = parts.next().unwrap_or("").to_string();

        let headers = read_headers(&mut self.reader)?;
        let body = if response_has_no_body(status) {
            Vec::new()
        } else {
            read_body(&mut self.reader, &headers, RequestOrResponse::Response)?
        };

        Ok(Response {
            status,
            reason,
            headers,
            body,
        })
    }

    pub fn write_request(&mut self, req: &Request) -> Result<()> {
        let stream = self.reader.get_mut();
        write!(stream, "{} {} HTTP/1.1\r\n", req.method, req.target)?;
        write_headers_and_body(stream, &req.headers, &req.body)
    }

    pub fn write_response(&mut self, resp: &Response) -> Result<()> {
        let stream = self.reader.get_mut();
        let reason = if resp.reason.is_empty() {
            default_reason(resp.status)
        } else {
            resp.reason.as_str()
        };
        write!(stream, "HTTP/1.1 {} {}\r\n", resp.status, reason)?;
        write_headers_and_body(stream, &resp.headers, &resp.body)
    }
}

fn write_headers_and_body<W: Write>(
    stream: &mut W,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<()> {
    for (name, value) in headers {
        write!(stream, "{name}: {value}\r\n")?;
    }
    write!(stream, "\r\n")?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

fn default_reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        500 => "Internal Server Error",
        _ => "",
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    let n = reader
        .take(MAX_HEADER_LINE as u64)
        .read_line(&mut line)
        .context("http: failed to read line")?;
    if n == 0 {
        bail!("http: connection closed before a complete line was read");
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            bail!("http: too many headers");
        }
        let (name, value) = line
            .split_once(':')
            .context("http: malformed header line")?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// Statuses that never carry a body per RFC 7230 §3.3.3, notably
/// `101 Switching Protocols` — reading "to EOF" on those would
/// swallow the raw bytes the upgrade tunnel is about to pump.
fn response_has_no_body(status: u16) -> bool {
    matches!(status, 100..=199 | 204 | 304)
}

enum RequestOrResponse {
    Request,
    Response,
}

fn read_body<R: BufRead>(
    reader: &mut R,
    headers: &[(String, String)],
    kind: RequestOrResponse,
) -> Result<Vec<u8>> {
    let transfer_encoding = header_lookup(headers, "transfer-encoding");
    let content_length = header_lookup(headers, "content-length");

    if transfer_encoding.is_some_and(|v| v.eq_ignore_ascii_case("chunked")) {
        return read_chunked_body(reader);
    }

    if let Some(len) = content_length {
        let len: usize = len.trim().parse().context("http: malformed Content-Length")?;
        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .context("http: truncated body")?;
        return Ok(buf);
    }

    match kind {
        // No framing info on a request means no body (Docker daemon
        // never sends chunked/unlengthed request bodies to us).
        RequestOrResponse::Request => Ok(Vec::new()),
        // A response with neither header reads to EOF, the
        // traditional HTTP/1.0 "close delimits the body" behavior.
        RequestOrResponse::Response => {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).context("http: failed to read body to EOF")?;
            Ok(buf)
        }
    }
}

fn read_chunked_body<R: BufRead>(reader: &mut R) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(reader)?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).context("http: malformed chunk size")?;
        if size == 0 {
            // Trailing headers (rare, unused by the Docker daemon) then the final CRLF.
            loop {
                let trailer = read_line(reader)?;
                if trailer.is_empty() {
                    break;
                }
            }
            break;
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).context("http: truncated chunk")?;
        body.extend_from_slice(&chunk);
        let crlf = read_line(reader)?;
        if !crlf.is_empty() {
            bail!("http: malformed chunk terminator");
        }
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream_of(bytes: &[u8]) -> impl Read + Write + use<> {
        struct ReadOnly(Cursor<Vec<u8>>);
        impl Read for ReadOnly {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.0.read(buf)
            }
        }
        impl Write for ReadOnly {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        ReadOnly(Cursor::new(bytes.to_vec()))
    }

    #[test]
    fn reads_request_with_content_length() {
        let raw = b"GET /containers/json HTTP/1.1\r\nHost: docker\r\nContent-Length: 5\r\n\r\nhello";
        let mut conn = Connection::new(stream_of(raw));
        let req = conn.read_request().expect("parse request");
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/containers/json");
        assert_eq!(req.body, b"hello");
        assert_eq!(req.header("host"), Some("docker"));
    }

    #[test]
    fn reads_chunked_response_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut conn = Connection::new(stream_of(raw));
        let resp = conn.read_response().expect("parse response");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"Wikipedia");
    }

    #[test]
    fn reads_response_to_eof_without_length() {
        let raw = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nplain body, no length";
        let mut conn = Connection::new(stream_of(raw));
        let resp = conn.read_response().expect("parse response");
        assert_eq!(resp.body, b"plain body, no length");
    }

    #[test]
    fn header_helpers_are_case_insensitive() {
        let mut req = Request::new("GET", "/x").with_header("Content-Type", "application/json");
        assert_eq!(req.header("content-type"), Some("application/json"));
        req.set_header("content-type", "text/plain");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn upgrade_response_has_no_body_and_leaves_bytes_for_the_pump() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: tcp\r\n\r\nLEFTOVER-UPGRADE-BYTES";
        let mut conn = Connection::new(stream_of(raw));
        let resp = conn.read_response().expect("parse response");
        assert!(resp.is_upgrade());
        assert!(resp.body.is_empty());

        let (_, leftover) = conn.into_parts();
        assert_eq!(leftover, b"LEFTOVER-UPGRADE-BYTES");
    }
}
