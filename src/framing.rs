//! LSP `Content-Length` framing codec (§4.1).
//!
//! Decoding is pulled out of the read loop (unlike the teacher's inline
//! `reader_loop`, which assumes one well-formed header per read) because the
//! sidecar additionally has to tolerate a garbage prefix before the header
//! and resync when no header ever shows up.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes of unrecognized buffer tolerated before resyncing by dropping it.
const GARBAGE_RESYNC_THRESHOLD: usize = 1024;

const HEADER_SENTINEL: &[u8] = b"\r\n\r\n";

/// Attempt to pull one complete frame's body out of `buf`, consuming the
/// header and body bytes it covers (including any garbage prefix).
///
/// Returns `None` if `buf` does not yet contain a complete frame. Returns
/// `Some(body)` and advances `buf` past the consumed bytes otherwise.
pub fn try_decode_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let header_pos = find_header(buf)?;

    if header_pos > 0 {
        // Discard garbage preceding the header (§4.1: "servers occasionally
        // emit warnings").
        buf.drain(..header_pos);
    }

    let sentinel_pos = find_subslice(buf, HEADER_SENTINEL)?;
    let content_length = parse_content_length(&buf[..sentinel_pos])?;

    let body_start = sentinel_pos + HEADER_SENTINEL.len();
    let body_end = body_start.checked_add(content_length)?;
    if buf.len() < body_end {
        return None;
    }

    let body = buf[body_start..body_end].to_vec();
    buf.drain(..body_end);
    Some(body)
}

/// Find the offset of a case-insensitive `content-length:` header, or, if
/// none has appeared and the buffer has grown past the resync threshold,
/// drop the buffer entirely and report no header found.
fn find_header(buf: &mut Vec<u8>) -> Option<usize> {
    match find_header_ci(buf) {
        Some(pos) => Some(pos),
        None => {
            if buf.len() > GARBAGE_RESYNC_THRESHOLD {
                buf.clear();
            }
            None
        }
    }
}

fn find_header_ci(buf: &[u8]) -> Option<usize> {
    const NEEDLE: &[u8] = b"content-length:";
    if buf.len() < NEEDLE.len() {
        return None;
    }
    (0..=buf.len() - NEEDLE.len()).find(|&start| {
        buf[start..start + NEEDLE.len()]
            .iter()
            .zip(NEEDLE)
            .all(|(a, b)| a.to_ascii_lowercase() == *b)
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&start| &haystack[start..start + needle.len()] == needle)
}

/// Parse the decimal byte count out of a `content-length: N` header line
/// (the header value may be followed by other header lines; we only need
/// the length).
fn parse_content_length(header_block: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(header_block).ok()?;
    text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })
}

/// Encode a UTF-8 JSON body as a `Content-Length`-framed packet.
#[must_use]
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut out = Vec::with_capacity(header.len() + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out
}

/// Read bytes from `reader` into `buf` and decode as many frames as are
/// available, invoking `on_frame` for each. Returns when the stream hits
/// EOF (`Ok(false)`) or after one successful read (`Ok(true)`), so callers
/// can interleave this with other suspension points in a `select!`.
pub async fn read_and_decode<R, F>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    mut on_frame: F,
) -> std::io::Result<bool>
where
    R: AsyncRead + Unpin,
    F: FnMut(Vec<u8>),
{
    let mut chunk = [0u8; 8192];
    let n = reader.read(&mut chunk).await?;
    if n == 0 {
        return Ok(false);
    }
    buf.extend_from_slice(&chunk[..n]);
    while let Some(body) = try_decode_frame(buf) {
        on_frame(body);
    }
    Ok(true)
}
