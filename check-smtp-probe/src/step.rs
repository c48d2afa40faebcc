use core::fmt::{self, Display};

/// The protocol phase a probe was executing, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Establishing the protocol session over the new connection.
    Connect,
    /// Dialling the server, or arming a step deadline.
    Timeout,
    /// EHLO, with HELO fallback.
    Greet,
    StartTls,
    MailFrom,
    RcptTo,
    /// DATA, message content and the end-of-data marker.
    Data,
    Quit,
    /// Either envelope command of the spoofing probe.
    SpfFail,
}

impl Step {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Timeout => "TIMEOUT",
            Self::Greet => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::MailFrom => "MAIL FROM",
            Self::RcptTo => "RCPT TO",
            Self::Data => "DATA",
            Self::Quit => "QUIT",
            Self::SpfFail => "SPF FAIL",
        }
    }
}

impl Display for Step {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}
