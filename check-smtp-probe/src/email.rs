//! Messages submitted by the delivery probe.

use core::fmt::{self, Display};

use chrono::Utc;
use ulid::Ulid;

/// A message the delivery probe can submit.
///
/// The rendered form (via [`Display`]) is sent as the DATA payload after
/// [`ProbeMessage::prepare_headers`] has run.
pub trait ProbeMessage: Display {
    /// The envelope sender.
    fn from_address(&self) -> &str;

    /// Fills in headers that depend on the submission, such as `Date` and
    /// `Message-ID`. Called once, right before the content is written.
    fn prepare_headers(&mut self, local_name: &str);
}

/// A plain-text test message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEmail {
    from: String,
    to: String,
    subject: String,
    body: String,
    headers: Vec<(String, String)>,
}

impl TestEmail {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: "SMTP delivery check".to_string(),
            body: "This message was sent to verify that the server accepts mail.\r\n".to_string(),
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl ProbeMessage for TestEmail {
    fn from_address(&self) -> &str {
        &self.from
    }

    fn prepare_headers(&mut self, local_name: &str) {
        self.headers = vec![
            ("Date".to_string(), Utc::now().to_rfc2822()),
            (
                "Message-ID".to_string(),
                format!("<{}@{local_name}>", Ulid::new()),
            ),
            ("From".to_string(), format!("<{}>", self.from)),
            ("To".to_string(), format!("<{}>", self.to)),
            ("Subject".to_string(), self.subject.clone()),
            ("MIME-Version".to_string(), "1.0".to_string()),
            (
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            ),
            ("Content-Transfer-Encoding".to_string(), "8bit".to_string()),
        ];
    }
}

impl Display for TestEmail {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            write!(fmt, "{name}: {value}\r\n")?;
        }
        fmt.write_str("\r\n")?;
        fmt.write_str(&self.body)
    }
}
