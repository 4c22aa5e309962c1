/*
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Parsing of captured response header streams.
//!
//! A probe of a single request may see several responses: zero or more
//! interim (1xx) responses followed by the final one. The header stream
//! holds all of their header blocks back to back, each terminated by an
//! empty line. [`parse_chain`] turns such a stream into a [`Response`]
//! whose head is the final response and whose `previous` links walk back
//! through the interim ones.

use log::trace;
use std::iter;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid status line {line}: {text:?}")]
    InvalidStatusLine { line: usize, text: String },

    #[error("invalid header line {line}: {text:?}")]
    InvalidHeaderLine { line: usize, text: String },
}

/// Response headers keyed by lowercase name, in order of first appearance.
///
/// A repeated name replaces the earlier value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();

        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((name, value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// The status line of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub protocol: String,
    pub code: u16,
    pub reason: String,
}

/// One response of a chain. The head of a chain is the final response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    protocol: String,
    status: u16,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
    previous: Option<Box<Response>>,
}

impl Response {
    fn open(status: StatusLine, previous: Option<Response>) -> Self {
        Self {
            protocol: status.protocol,
            status: status.code,
            reason: status.reason,
            headers: Headers::new(),
            body: Vec::new(),
            previous: previous.map(Box::new),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The response received just before this one, if any.
    pub fn previous(&self) -> Option<&Response> {
        self.previous.as_deref()
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// Iterates from this response back to the oldest one.
    pub fn chain(&self) -> impl Iterator<Item = &Response> {
        iter::successors(Some(self), |r| r.previous())
    }

    pub fn chain_len(&self) -> usize {
        self.chain().count()
    }
}

// PROTOCOL SP CODE SP REASON
//
// the separator before an empty reason is optional too, so a bare
// `HTTP/2 103` parses with reason "". curl itself always writes it.
pub fn parse_status_line(line: &str) -> Option<StatusLine> {
    let (protocol, rest) = line.split_once(' ')?;

    if protocol.is_empty() || protocol.chars().any(char::is_whitespace) {
        return None;
    }

    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };

    if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(StatusLine {
        protocol: protocol.to_string(),
        code: code.parse().ok()?,
        reason: reason.to_string(),
    })
}

// NAME ":" OWS VALUE
pub fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;

    if name.is_empty() {
        return None;
    }

    Some((name, value.trim()))
}

enum State {
    ExpectStatus,
    ExpectHeaderOrBlank,
}

/// Parses a raw header stream into a response chain, attaching `body` to
/// the final response.
///
/// Returns `Ok(None)` when the stream holds no responses at all, which is
/// what a probe sees when the connection was reset before any reply. Any
/// malformed line fails the whole parse.
pub fn parse_chain(header_data: &[u8], body: &[u8]) -> Result<Option<Response>, ParseError> {
    let text = String::from_utf8_lossy(header_data);

    let mut state = State::ExpectStatus;
    let mut head: Option<Response> = None;

    for (index, line) in text.lines().enumerate() {
        let lineno = index + 1;

        match state {
            State::ExpectStatus => {
                trace!("reading status line: {}", line);

                let status = match parse_status_line(line) {
                    Some(status) => status,
                    None => {
                        return Err(ParseError::InvalidStatusLine {
                            line: lineno,
                            text: line.to_string(),
                        })
                    }
                };

                head = Some(Response::open(status, head.take()));
                state = State::ExpectHeaderOrBlank;
            }
            State::ExpectHeaderOrBlank => {
                if line.is_empty() {
                    state = State::ExpectStatus;
                    continue;
                }

                trace!("reading header line: {}", line);

                let (name, value) = match parse_header_line(line) {
                    Some(h) => h,
                    None => {
                        return Err(ParseError::InvalidHeaderLine {
                            line: lineno,
                            text: line.to_string(),
                        })
                    }
                };

                if let Some(resp) = head.as_mut() {
                    resp.headers.insert(name, value);
                }
            }
        }
    }

    if let Some(resp) = head.as_mut() {
        resp.body = body.to_vec();
    }

    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn status_lines() {
        let s = parse_status_line("HTTP/1.1 200 OK").unwrap();
        assert_eq!(s.protocol, "HTTP/1.1");
        assert_eq!(s.code, 200);
        assert_eq!(s.reason, "OK");

        let s = parse_status_line("HTTP/1.1 404 Not Found").unwrap();
        assert_eq!(s.reason, "Not Found");

        // curl prints http/2 status lines with an empty reason
        let s = parse_status_line("HTTP/2 200 ").unwrap();
        assert_eq!(s.protocol, "HTTP/2");
        assert_eq!(s.reason, "");

        assert!(parse_status_line("HTTP/2 103").is_some());

        assert!(parse_status_line("").is_none());
        assert!(parse_status_line("HTTP/1.1").is_none());
        assert!(parse_status_line("HTTP/1.1 OK 200").is_none());
        assert!(parse_status_line(" 200 OK").is_none());
        assert!(parse_status_line("HTTP/1.1 99999 Big").is_none());
        assert!(parse_status_line("content-type: text/html").is_none());
    }

    #[test]
    fn header_lines() {
        assert_eq!(
            parse_header_line("Content-Type: text/plain"),
            Some(("Content-Type", "text/plain"))
        );
        assert_eq!(parse_header_line("X-Empty:"), Some(("X-Empty", "")));
        assert_eq!(
            parse_header_line("Link:   </a.css>; rel=preload  "),
            Some(("Link", "</a.css>; rel=preload"))
        );
        assert_eq!(
            parse_header_line("Date: Mon, 01 Jan 2024 10:00:00 GMT"),
            Some(("Date", "Mon, 01 Jan 2024 10:00:00 GMT"))
        );
        assert_eq!(parse_header_line("no colon here"), None);
        assert_eq!(parse_header_line(": no name"), None);
    }

    #[test]
    fn single_response() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\n";

        let resp = parse_chain(data, b"hello").unwrap().unwrap();

        assert_eq!(resp.protocol(), "HTTP/1.1");
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.reason(), "OK");
        assert_eq!(resp.header("content-type"), Some("text/plain"));
        assert_eq!(resp.header("Content-Length"), Some("5"));
        assert_eq!(resp.body(), b"hello");
        assert!(resp.previous().is_none());
        assert_eq!(resp.chain_len(), 1);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let resp = parse_chain(b"HTTP/1.1 200 OK\r\nX-Foo: 1\r\n\r\n", b"")
            .unwrap()
            .unwrap();

        assert_eq!(resp.header("x-foo"), Some("1"));
        assert_eq!(resp.header("X-FOO"), Some("1"));
        assert_eq!(resp.headers().iter().next(), Some(("x-foo", "1")));
    }

    #[test]
    fn repeated_header_last_wins() {
        let data = b"HTTP/1.1 200 OK\r\nVary: a\r\nServer: x\r\nvary: b\r\n\r\n";

        let resp = parse_chain(data, b"").unwrap().unwrap();

        assert_eq!(resp.header("vary"), Some("b"));
        assert_eq!(resp.headers().len(), 2);

        let names: Vec<&str> = resp.headers().iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["vary", "server"]);
    }

    #[test]
    fn interim_responses_are_chained() {
        let data = b"HTTP/1.1 100 Continue\r\n\r\n\
                     HTTP/1.1 103 Early Hints\r\nLink: </006/006.css>; rel=preload\r\n\r\n\
                     HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n";

        let resp = parse_chain(data, b"XYZ").unwrap().unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), b"XYZ");
        assert_eq!(resp.chain_len(), 3);

        let hints = resp.previous().unwrap();
        assert_eq!(hints.status(), 103);
        assert!(hints.is_informational());
        assert_eq!(hints.header("link"), Some("</006/006.css>; rel=preload"));
        assert!(hints.header("content-length").is_none());
        assert!(hints.body().is_empty());

        let cont = hints.previous().unwrap();
        assert_eq!(cont.status(), 100);
        assert!(cont.headers().is_empty());
        assert!(cont.previous().is_none());

        let codes: Vec<u16> = resp.chain().map(|r| r.status()).collect();
        assert_eq!(codes, vec![200, 103, 100]);
    }

    #[test]
    fn k_interim_responses_give_k_plus_one_nodes() {
        for k in 0..5 {
            let mut data = Vec::new();
            for _ in 0..k {
                data.extend_from_slice(b"HTTP/2 100 \r\n\r\n");
            }
            data.extend_from_slice(b"HTTP/2 204 \r\nserver: test\r\n\r\n");

            let resp = parse_chain(&data, b"").unwrap().unwrap();
            assert_eq!(resp.status(), 204);
            assert_eq!(resp.chain_len(), k + 1);

            let last = resp.chain().last().unwrap();
            assert!(last.previous().is_none());
            assert_eq!(last.status(), if k == 0 { 204 } else { 100 });
        }
    }

    #[test]
    fn bare_newlines_and_missing_terminator() {
        let resp = parse_chain(b"HTTP/1.1 200 OK\nServer: a\n", b"")
            .unwrap()
            .unwrap();

        assert_eq!(resp.header("server"), Some("a"));
    }

    #[test]
    fn empty_stream_has_no_response() {
        assert_eq!(parse_chain(b"", b""), Ok(None));
        assert_eq!(parse_chain(b"", b"body without headers"), Ok(None));
    }

    #[test]
    fn malformed_lines_are_fatal() {
        assert_eq!(
            parse_chain(b"garbage\r\n\r\n", b""),
            Err(ParseError::InvalidStatusLine {
                line: 1,
                text: "garbage".to_string()
            })
        );

        assert_eq!(
            parse_chain(b"HTTP/1.1 200 OK\r\nbroken header\r\n\r\n", b""),
            Err(ParseError::InvalidHeaderLine {
                line: 2,
                text: "broken header".to_string()
            })
        );

        // a bad line after a good interim response still aborts everything
        let data = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 2xx Bad\r\n\r\n";
        assert!(matches!(
            parse_chain(data, b""),
            Err(ParseError::InvalidStatusLine { line: 3, .. })
        ));
    }
}
