// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Client side of the control protocol.
//!
//! Responses are one or more lines of the form `DDDc<text>`, where
//! `DDD` is a three-digit code and `c` is `-` for continuation or a
//! space for the final line. Lines whose text is `KEY=VALUE` with an
//! uppercase key publish that pair to the caller.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use std::collections::HashMap;
use std::io::BufRead;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Connect to a manager's control socket in blocking mode.
pub fn connect(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path)
        .with_context(|| format!("Failed to connect to manager at {}", path.display()))
}

/// One line of a response. `code` is absent for free-text lines, which
/// are treated as continuations.
#[derive(Clone, Debug)]
pub struct ResponseLine {
    pub code: Option<u32>,
    pub cont: bool,
    pub text: String,
}

/// A complete response: everything up to and including the first
/// non-continuation coded line.
#[derive(Clone, Debug, Default)]
pub struct Response {
    pub code: Option<u32>,
    pub lines: Vec<ResponseLine>,
    pub kv: HashMap<String, String>,
}

/// Split a formatted line into code, continuation flag and text.
pub fn parse_coded_line(line: &str) -> Option<(u32, bool, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 || !bytes[..3].iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let cont = match bytes[3] {
        b'-' => true,
        b' ' => false,
        _ => return None,
    };
    let code = line[..3].parse().ok()?;
    Some((code, cont, &line[4..]))
}

fn capture_kv(kv: &mut HashMap<String, String>, text: &str) {
    let Some((key, value)) = text.split_once('=') else {
        return;
    };
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_uppercase() || b == b'_') {
        return;
    }
    kv.insert(key.to_string(), value.to_string());
}

/// Read one full response. Fails if the connection closes before a
/// final line arrives.
pub fn read_response(reader: &mut impl BufRead) -> Result<Response> {
    let mut resp = Response::default();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 || !line.ends_with('\n') {
            bail!("Connection closed by the manager");
        }
        let line = line.trim_end_matches(['\n', '\r']);
        match parse_coded_line(line) {
            Some((code, cont, text)) => {
                resp.code = Some(code);
                capture_kv(&mut resp.kv, text);
                resp.lines.push(ResponseLine {
                    code: Some(code),
                    cont,
                    text: text.to_string(),
                });
                if !cont {
                    return Ok(resp);
                }
            }
            None => {
                // Free text before a coded line; the response is not
                // over yet.
                resp.lines.push(ResponseLine {
                    code: None,
                    cont: true,
                    text: line.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_coded_line() {
        assert_eq!(
            parse_coded_line("220-Task Manager."),
            Some((220, true, "Task Manager."))
        );
        assert_eq!(
            parse_coded_line("221 End of session."),
            Some((221, false, "End of session."))
        );
        assert_eq!(parse_coded_line("hi there"), None);
        assert_eq!(parse_coded_line("22x ugh"), None);
        assert_eq!(parse_coded_line("220"), None);
    }

    #[test]
    fn test_read_response_with_kv() {
        let text = "200-Task allocated\n200-MODE=THREAD\n200-INDEX=3\n200-CPU=5\n200 OK\n";
        let resp = read_response(&mut Cursor::new(text)).unwrap();
        assert_eq!(resp.code, Some(200));
        assert_eq!(resp.lines.len(), 5);
        assert_eq!(resp.kv.get("MODE").map(String::as_str), Some("THREAD"));
        assert_eq!(resp.kv.get("INDEX").map(String::as_str), Some("3"));
        assert_eq!(resp.kv.get("CPU").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_read_response_truncated() {
        assert!(read_response(&mut Cursor::new("220-hello\n")).is_err());
    }
}
