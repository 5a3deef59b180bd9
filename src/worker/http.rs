//! HTTP/1.1 upgrade handshake
//!
//! A deliberately small parser: buffer the request head, check the handful
//! of headers RFC 6455 requires, and answer 101 with the accept digest.
//! Anything else gets a terse 400 and the shutdown progression.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{ Digest, Sha1 };

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

static BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

/// Outcome of examining the buffered request head.
#[derive(Debug, PartialEq, Eq)]
pub enum Upgrade {
    /// The head is not complete yet
    Incomplete,
    /// Upgrade accepted: send `response`, then treat `inbuf[consumed..]`
    /// as WebSocket bytes
    Accepted { response: Vec<u8>, consumed: usize },
    /// Not a valid upgrade request: send the canned response and shut down
    Rejected { response: &'static [u8] },
}

/// Compute the `Sec-WebSocket-Accept` digest for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.trim().as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    for line in head.split("\r\n").skip(1) {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim());
            }
        }
    }
    None
}

fn token_list_contains(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Try to complete the upgrade against the buffered request head.
pub fn try_upgrade(inbuf: &[u8]) -> Upgrade {
    let Some(head_end) = inbuf
        .windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
    else {
        return Upgrade::Incomplete;
    };
    let consumed = head_end + HEAD_TERMINATOR.len();

    let Ok(head) = std::str::from_utf8(&inbuf[..head_end]) else {
        return Upgrade::Rejected { response: BAD_REQUEST };
    };

    let request_line = head.split("\r\n").next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let _target = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    if method != "GET" || version != "HTTP/1.1" {
        return Upgrade::Rejected { response: BAD_REQUEST };
    }

    if header_value(head, "Host").is_none() {
        return Upgrade::Rejected { response: BAD_REQUEST };
    }
    let upgrade_ok = header_value(head, "Upgrade")
        .map(|v| token_list_contains(v, "websocket"))
        .unwrap_or(false);
    let connection_ok = header_value(head, "Connection")
        .map(|v| token_list_contains(v, "Upgrade"))
        .unwrap_or(false);
    let version_ok = header_value(head, "Sec-WebSocket-Version")
        .map(|v| v == "13")
        .unwrap_or(false);
    let Some(key) = header_value(head, "Sec-WebSocket-Key") else {
        return Upgrade::Rejected { response: BAD_REQUEST };
    };
    if !upgrade_ok || !connection_ok || !version_ok || key.is_empty() {
        return Upgrade::Rejected { response: BAD_REQUEST };
    }

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    Upgrade::Accepted {
        response: response.into_bytes(),
        consumed,
    }
}
