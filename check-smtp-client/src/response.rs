//! SMTP reply parsing.

use std::ops::RangeInclusive;

use ahash::AHashMap;

use crate::error::{ClientError, Result};

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The SMTP status code.
    pub code: u16,
    /// The text of every line, without code and separator.
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// Returns the complete message with lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// Returns `true` for a 4xx or 5xx reply.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.code >= 400 && self.code < 600
    }

    /// Turns a reply whose code falls outside `accepted` into an error.
    ///
    /// 4xx/5xx replies become [`ClientError::SmtpError`], anything else
    /// [`ClientError::UnexpectedResponse`].
    ///
    /// # Errors
    ///
    /// Returns an error if the reply code is not in `accepted`.
    pub fn expect(self, accepted: RangeInclusive<u16>) -> Result<Self> {
        if accepted.contains(&self.code) {
            return Ok(self);
        }

        let code = self.code;
        let message = self.message();
        if self.is_error() {
            Err(ClientError::SmtpError { code, message })
        } else {
            Err(ClientError::UnexpectedResponse { code, message })
        }
    }

    /// Collects the service extensions of an EHLO reply.
    ///
    /// The first line is the server greeting and is skipped. Keywords are
    /// upper-cased, any remainder of the line is kept as the parameter.
    #[must_use]
    pub fn extensions(&self) -> AHashMap<String, String> {
        self.lines
            .iter()
            .skip(1)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let (keyword, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));
                (keyword.to_ascii_uppercase(), params.to_string())
            })
            .collect()
    }

    /// Parses one complete reply from the front of `buffer`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a full reply,
    /// otherwise the reply and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ParseError`] for malformed lines or when the
    /// lines of a multi-line reply disagree on the status code.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let (line_code, last, text) = parse_line(std::str::from_utf8(raw)?)?;
            match code {
                Some(expected) if expected != line_code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {expected}, got {line_code}"
                    )));
                }
                _ => code = Some(line_code),
            }
            lines.push(text.to_string());

            if last {
                return Ok(code.map(|code| (Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

/// Splits `250-text` / `250 text` / `250` into code, last-line flag and text.
fn parse_line(line: &str) -> Result<(u16, bool, &str)> {
    let Some(code) = line.get(..3) else {
        return Err(ClientError::ParseError(format!(
            "Response line too short: '{line}'"
        )));
    };
    let code = code
        .parse::<u16>()
        .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code}'")))?;

    match line.as_bytes().get(3) {
        None => Ok((code, true, "")),
        Some(b' ') => Ok((code, true, &line[4..])),
        Some(b'-') => Ok((code, false, &line[4..])),
        Some(_) => Err(ClientError::ParseError(format!(
            "Invalid separator in response line: '{line}'"
        ))),
    }
}
