// Copyright 2022 Ryan Seipp
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

//! Minimal request peek for hash-based routing
//!
//! The forwarder treats payloads as opaque; the only application-layer
//! knowledge in the core is the handful of byte scans here, used to derive
//! keys for the uri / url-parameter / header hash algorithms. Anything not
//! yet parseable returns `None` so the caller can wait for more bytes or
//! fall back to source hashing.

/// Limit on how far into the stream the peek will look for a header block.
const HEAD_LIMIT: usize = 8192;

/// Returns the request path of the first line, truncated at `?`.
///
/// `None` until a complete request line (terminated by CRLF or LF) is
/// buffered.
pub fn request_path(buf: &[u8]) -> Option<&[u8]> {
    let line = first_line(buf)?;
    let target = line.split(|&b| b == b' ').nth(1)?;
    let end = target.iter().position(|&b| b == b'?').unwrap_or(target.len());
    if end == 0 {
        return None;
    }
    Some(&target[..end])
}

/// Returns the value of the named query parameter from the request target.
pub fn query_param<'a>(buf: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let line = first_line(buf)?;
    let target = line.split(|&b| b == b' ').nth(1)?;
    let qs_at = target.iter().position(|&b| b == b'?')?;
    let query = &target[qs_at + 1..];

    for pair in query.split(|&b| b == b'&') {
        let eq = pair.iter().position(|&b| b == b'=').unwrap_or(pair.len());
        if eq == name.len() && pair[..eq].eq_ignore_ascii_case(name.as_bytes()) {
            return Some(&pair[(eq + 1).min(pair.len())..]);
        }
    }
    None
}

/// Returns the value of the named header, case-insensitively.
///
/// `None` until the full header block (terminated by an empty line) is
/// buffered, or if the header is absent.
pub fn header_value<'a>(buf: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let head = header_block(buf)?;
    let mut lines = head.split(|&b| b == b'\n');
    lines.next()?; // request line

    for line in lines {
        let line = trim_cr(line);
        let colon = match line.iter().position(|&b| b == b':') {
            Some(c) => c,
            None => continue,
        };
        if colon == name.len() && line[..colon].eq_ignore_ascii_case(name.as_bytes()) {
            let mut value = &line[colon + 1..];
            while let [b' ' | b'\t', rest @ ..] = value {
                value = rest;
            }
            return Some(value);
        }
    }
    None
}

/// True once enough bytes are buffered that waiting for more cannot change
/// the answer of any peek.
pub fn head_complete(buf: &[u8]) -> bool {
    header_block(buf).is_some() || buf.len() >= HEAD_LIMIT
}

fn first_line(buf: &[u8]) -> Option<&[u8]> {
    let scan = &buf[..buf.len().min(HEAD_LIMIT)];
    let nl = scan.iter().position(|&b| b == b'\n')?;
    Some(trim_cr(&scan[..nl]))
}

fn header_block(buf: &[u8]) -> Option<&[u8]> {
    let scan = &buf[..buf.len().min(HEAD_LIMIT)];
    scan.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| &scan[..at + 2])
        .or_else(|| {
            scan.windows(2)
                .position(|w| w == b"\n\n")
                .map(|at| &scan[..at + 1])
        })
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line {
        [head @ .., b'\r'] => head,
        other => other,
    }
}

#[cfg(test)]
mod test {
    use super::{head_complete, header_value, query_param, request_path};

    const REQ: &[u8] =
        b"GET /api/v1/users?id=42&tok=xyz HTTP/1.1\r\nHost: app.example\r\nX-Shard: eu-7\r\n\r\n";

    #[test]
    fn path_stops_at_query() {
        assert_eq!(Some(b"/api/v1/users" as &[u8]), request_path(REQ));
    }

    #[test]
    fn path_needs_a_complete_line() {
        assert_eq!(None, request_path(b"GET /part"));
        assert_eq!(Some(b"/part" as &[u8]), request_path(b"GET /part HTTP/1.1\r\n"));
    }

    #[test]
    fn query_param_is_found_by_name() {
        assert_eq!(Some(b"42" as &[u8]), query_param(REQ, "id"));
        assert_eq!(Some(b"xyz" as &[u8]), query_param(REQ, "tok"));
        assert_eq!(None, query_param(REQ, "missing"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        assert_eq!(Some(b"eu-7" as &[u8]), header_value(REQ, "x-shard"));
        assert_eq!(Some(b"app.example" as &[u8]), header_value(REQ, "HOST"));
        assert_eq!(None, header_value(REQ, "cookie"));
    }

    #[test]
    fn header_lookup_waits_for_full_block() {
        assert_eq!(None, header_value(b"GET / HTTP/1.1\r\nHost: a", "host"));
        assert!(!head_complete(b"GET / HTTP/1.1\r\nHost: a"));
        assert!(head_complete(REQ));
    }

    #[test]
    fn bare_lf_lines_are_accepted() {
        let req = b"GET /x HTTP/1.0\nHost: h\n\n";
        assert_eq!(Some(b"/x" as &[u8]), request_path(req));
        assert_eq!(Some(b"h" as &[u8]), header_value(req, "host"));
    }
}
