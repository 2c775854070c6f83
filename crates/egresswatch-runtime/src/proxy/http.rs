//! Minimal HTTP/1.1 request-head parsing for the forward proxy.
//!
//! The proxy only needs the request line and headers; bodies and
//! responses are streamed through untouched. Parsing is deliberately
//! strict about the two request forms a forward proxy sees: the
//! absolute-URI form (`GET http://host/path HTTP/1.1`) and the authority
//! form (`CONNECT host:port HTTP/1.1`).

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use super::ProxyError;

/// Upper bound on the request head; anything larger is rejected.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// A parsed request line plus headers.
#[derive(Debug)]
pub(super) struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Headers to replay upstream: everything except proxy-control ones.
    pub fn forwarded_headers(&self) -> impl Iterator<Item = &(String, String)> {
        self.headers.iter().filter(|(name, _)| {
            !name.eq_ignore_ascii_case("proxy-connection")
                && !name.eq_ignore_ascii_case("proxy-authorization")
        })
    }
}

/// Reads from the client until the blank line ending the request head.
///
/// Returns the head bytes and any body bytes already buffered past it.
pub(super) async fn read_request_head(
    stream: &mut TcpStream,
) -> Result<(Vec<u8>, Vec<u8>), ProxyError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::BadRequest("request head too large".to_string()));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::BadRequest(
                "connection closed before request head completed".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Index one past the `\r\n\r\n` terminator, when present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parses the request line and headers out of the head bytes.
pub(super) fn parse_request_head(head: &[u8]) -> Result<RequestHead, ProxyError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::BadRequest("request head is not valid UTF-8".to_string()))?;

    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| ProxyError::BadRequest("empty request".to_string()))?;

    let mut parts = request_line.split_ascii_whitespace();
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::BadRequest(format!(
            "malformed request line: {request_line}"
        )));
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProxyError::BadRequest(format!("malformed header: {line}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        headers,
    })
}

/// Splits an absolute `http://` URI into `(host, port, path_and_query)`.
///
/// Only plain HTTP appears in absolute form; HTTPS arrives as `CONNECT`.
pub(super) fn parse_absolute_uri(target: &str) -> Result<(String, u16, String), ProxyError> {
    let rest = strip_scheme(target, "http://").ok_or_else(|| {
        ProxyError::BadRequest(format!("expected absolute http:// URI, got {target}"))
    })?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };

    let (host, port) = split_host_port(authority, 80)?;
    Ok((host, port, path))
}

/// Splits a `CONNECT` authority into `(host, port)`, defaulting to 443.
pub(super) fn parse_connect_target(target: &str) -> Result<(String, u16), ProxyError> {
    split_host_port(target, 443)
}

fn strip_scheme<'a>(target: &'a str, scheme: &str) -> Option<&'a str> {
    if target.len() >= scheme.len() && target[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(&target[scheme.len()..])
    } else {
        None
    }
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    if authority.is_empty() {
        return Err(ProxyError::BadRequest("empty authority".to_string()));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                ProxyError::BadRequest(format!("invalid port in authority: {authority}"))
            })?;
            Ok((host.to_string(), port))
        },
        None => Ok((authority.to_string(), default_port)),
    }
}
