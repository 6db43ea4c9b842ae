//! SMTP reply types.
//!
//! A [`Reply`] is built one line at a time with [`Reply::parse_line`], so a
//! reader can feed it lines as they arrive and stop as soon as the reply is
//! complete or has stopped being well formed.

/// One line of a reply, without the code prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// True if the line used the `-` separator (more lines follow).
    pub continuation: bool,
    /// Text after the separator.
    pub text: String,
}

/// SMTP reply from server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: Option<ReplyCode>,
    lines: Vec<ReplyLine>,
    well_formed: bool,
    complete: bool,
}

impl Default for Reply {
    fn default() -> Self {
        Self::new()
    }
}

impl Reply {
    /// Creates an empty reply, ready for [`parse_line`](Self::parse_line).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            code: None,
            lines: Vec::new(),
            well_formed: true,
            complete: false,
        }
    }

    /// Creates a complete single-line reply. Mostly useful in tests.
    #[must_use]
    pub fn single(code: ReplyCode, text: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            lines: vec![ReplyLine {
                continuation: false,
                text: text.into(),
            }],
            well_formed: true,
            complete: true,
        }
    }

    /// Parses one line of server input into this reply.
    ///
    /// `line` may carry its `CRLF` (or bare `LF`) terminator. A line that
    /// does not match `^\d{3}([- ].*)?$`, whose code differs from the first
    /// line's, whose code is outside 100..=599, or that arrives after the
    /// final line marks the reply as not well formed. The raw text of an
    /// unrecognizable line is kept for diagnostics.
    pub fn parse_line(&mut self, line: &[u8]) {
        let line = strip_line_ending(line);

        if self.complete {
            self.well_formed = false;
            self.push_raw(line);
            return;
        }

        let Some(code) = line.get(..3).and_then(parse_code) else {
            self.well_formed = false;
            self.push_raw(line);
            return;
        };

        if !(100..=599).contains(&code.as_u16()) {
            self.well_formed = false;
        }
        match self.code {
            Some(first) if first != code => self.well_formed = false,
            Some(_) => {}
            None => self.code = Some(code),
        }

        let continuation = match line.get(3) {
            // A bare code is accepted as a final line.
            None => false,
            Some(b'-') => true,
            Some(b' ') => false,
            Some(_) => {
                self.well_formed = false;
                self.push_raw(line);
                return;
            }
        };

        let text = line.get(4..).unwrap_or_default();
        self.lines.push(ReplyLine {
            continuation,
            text: String::from_utf8_lossy(text).into_owned(),
        });
        self.complete = !continuation;
    }

    fn push_raw(&mut self, line: &[u8]) {
        self.lines.push(ReplyLine {
            continuation: false,
            text: String::from_utf8_lossy(line).into_owned(),
        });
    }

    /// Returns the reply code, or `None` if no line carried one.
    #[must_use]
    pub const fn code(&self) -> Option<ReplyCode> {
        self.code
    }

    /// Returns the parsed lines.
    #[must_use]
    pub fn lines(&self) -> &[ReplyLine] {
        &self.lines
    }

    /// Returns true once the final line has been parsed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// Returns true while every line so far has been valid.
    #[must_use]
    pub const fn is_well_formed(&self) -> bool {
        self.well_formed
    }

    /// Returns true for a well-formed 2xx or 3xx reply.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.well_formed
            && self
                .code
                .is_some_and(|c| c.is_success() || c.is_intermediate())
    }

    /// Returns true for a 4xx or 5xx reply.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.code
            .is_some_and(|c| c.is_transient() || c.is_permanent())
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.well_formed && self.code.is_some_and(ReplyCode::is_success)
    }

    /// Returns true if the reply code equals `code`.
    #[must_use]
    pub fn is(&self, code: ReplyCode) -> bool {
        self.well_formed && self.code == Some(code)
    }

    /// Returns the full message as a single string.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Human-readable description of the reply for error reports.
    #[must_use]
    pub fn error_message(&self) -> String {
        if !self.well_formed {
            let code = self
                .code
                .map_or_else(|| "???".to_string(), |c| c.to_string());
            return format!("Invalid SMTP response ({code}) received.");
        }
        let text = self.message_text();
        if text.is_empty() {
            "The server did not give an explanation.".to_string()
        } else {
            format!("The server responded: \"{text}\"")
        }
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_code(digits: &[u8]) -> Option<ReplyCode> {
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = digits
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
    Some(ReplyCode::new(code))
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true if this is a success code (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Common reply codes
impl ReplyCode {
    /// 220 Service ready
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel
    pub const CLOSING: Self = Self(221);
    /// 235 Authentication succeeded
    pub const AUTH_SUCCESS: Self = Self(235);
    /// 250 Requested mail action okay, completed
    pub const OK: Self = Self(250);
    /// 251 User not local; will forward
    pub const FORWARD: Self = Self(251);
    /// 334 Continue with authentication
    pub const AUTH_CONTINUE: Self = Self(334);
    /// 354 Start mail input
    pub const START_DATA: Self = Self(354);
    /// 421 Service not available, closing transmission channel
    pub const SERVICE_UNAVAILABLE: Self = Self(421);
    /// 450 Mailbox unavailable (busy)
    pub const MAILBOX_BUSY: Self = Self(450);
    /// 451 Local error in processing
    pub const LOCAL_ERROR: Self = Self(451);
    /// 452 Insufficient system storage
    pub const INSUFFICIENT_STORAGE: Self = Self(452);
    /// 500 Syntax error, command unrecognized
    pub const SYNTAX_ERROR: Self = Self(500);
    /// 501 Syntax error in parameters or arguments
    pub const PARAMETER_ERROR: Self = Self(501);
    /// 502 Command not implemented
    pub const NOT_IMPLEMENTED: Self = Self(502);
    /// 503 Bad sequence of commands
    pub const BAD_SEQUENCE: Self = Self(503);
    /// 504 Command parameter not implemented
    pub const PARAMETER_NOT_IMPLEMENTED: Self = Self(504);
    /// 535 Authentication credentials invalid
    pub const AUTH_FAILED: Self = Self(535);
    /// 550 Mailbox unavailable (not found, access denied)
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);
    /// 551 User not local
    pub const USER_NOT_LOCAL: Self = Self(551);
    /// 552 Exceeded storage allocation
    pub const EXCEEDED_STORAGE: Self = Self(552);
    /// 553 Mailbox name not allowed
    pub const MAILBOX_NAME_INVALID: Self = Self(553);
    /// 554 Transaction failed
    pub const TRANSACTION_FAILED: Self = Self(554);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    fn parse(lines: &[&[u8]]) -> Reply {
        let mut reply = Reply::new();
        for line in lines {
            reply.parse_line(line);
        }
        reply
    }

    mod reply_code_tests {
        use super::*;

        #[test]
        fn classes() {
            assert!(ReplyCode::OK.is_success());
            assert!(ReplyCode::AUTH_CONTINUE.is_intermediate());
            assert!(ReplyCode::START_DATA.is_intermediate());
            assert!(ReplyCode::SERVICE_UNAVAILABLE.is_transient());
            assert!(ReplyCode::AUTH_FAILED.is_permanent());
            assert!(!ReplyCode::OK.is_transient());
        }

        #[test]
        fn display() {
            assert_eq!(format!("{}", ReplyCode::OK), "250");
            assert_eq!(ReplyCode::new(554).as_u16(), 554);
        }
    }

    mod parse_line_tests {
        use super::*;

        #[test]
        fn multi_line_reply() {
            let reply = parse(&[b"250-foo\r\n", b"250 bar\r\n"]);
            assert!(reply.is_complete());
            assert!(reply.is_well_formed());
            assert_eq!(reply.code(), Some(ReplyCode::OK));
            assert_eq!(
                reply.lines(),
                &[
                    ReplyLine {
                        continuation: true,
                        text: "foo".into()
                    },
                    ReplyLine {
                        continuation: false,
                        text: "bar".into()
                    },
                ]
            );
        }

        #[test]
        fn mismatched_code_is_malformed() {
            let reply = parse(&[b"250-foo\r\n", b"251 bar\r\n"]);
            assert!(!reply.is_well_formed());
            assert!(!reply.is_ok());
        }

        #[test]
        fn incomplete_until_space_separator() {
            let mut reply = Reply::new();
            reply.parse_line(b"250-first\r\n");
            assert!(!reply.is_complete());
            assert!(reply.is_well_formed());
            reply.parse_line(b"250 last\r\n");
            assert!(reply.is_complete());
        }

        #[test]
        fn bare_code_is_final() {
            let reply = parse(&[b"250\r\n"]);
            assert!(reply.is_complete());
            assert!(reply.is_well_formed());
            assert_eq!(reply.message_text(), "");
        }

        #[test]
        fn garbage_keeps_raw_text() {
            let reply = parse(&[b"hello world\r\n"]);
            assert!(!reply.is_well_formed());
            assert_eq!(reply.code(), None);
            assert_eq!(reply.message_text(), "hello world");
            assert_eq!(
                reply.error_message(),
                "Invalid SMTP response (???) received."
            );
        }

        #[test]
        fn short_line_is_malformed() {
            assert!(!parse(&[b"25\r\n"]).is_well_formed());
        }

        #[test]
        fn bad_separator_is_malformed() {
            assert!(!parse(&[b"250/ok\r\n"]).is_well_formed());
        }

        #[test]
        fn out_of_range_code_is_malformed() {
            assert!(!parse(&[b"099 low\r\n"]).is_well_formed());
            assert!(!parse(&[b"600 high\r\n"]).is_well_formed());
        }

        #[test]
        fn line_after_final_is_malformed() {
            let reply = parse(&[b"250 ok\r\n", b"250 again\r\n"]);
            assert!(!reply.is_well_formed());
        }

        #[test]
        fn bare_lf_accepted() {
            let reply = parse(&[b"220 ready\n"]);
            assert!(reply.is_complete());
            assert_eq!(reply.message_text(), "ready");
        }

        #[test]
        fn ok_and_negative() {
            assert!(parse(&[b"354 go ahead\r\n"]).is_ok());
            assert!(parse(&[b"550 no\r\n"]).is_negative());
            assert!(parse(&[b"421 bye\r\n"]).is_negative());
            assert!(!parse(&[b"250 fine\r\n"]).is_negative());
        }

        #[test]
        fn error_message_quotes_server() {
            let reply = parse(&[b"550-No such user\r\n", b"550 here\r\n"]);
            assert_eq!(
                reply.error_message(),
                "The server responded: \"No such user\nhere\""
            );
        }
    }
}
