//! Signals the harness forwards to supervised processes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HarnessError;

/// A POSIX signal the harness knows how to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// SIGINT
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
    /// SIGHUP
    Hangup,
    /// SIGQUIT
    Quit,
    /// SIGUSR1
    User1,
    /// SIGUSR2
    User2,
}

impl Signal {
    /// Raw signal number for `kill(2)`
    pub fn as_raw(self) -> i32 {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Hangup => libc::SIGHUP,
            Signal::Quit => libc::SIGQUIT,
            Signal::User1 => libc::SIGUSR1,
            Signal::User2 => libc::SIGUSR2,
        }
    }

    /// Exit code a shell would report for a process killed by this signal
    pub fn exit_code(self) -> i32 {
        128 + self.as_raw()
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Hangup => "SIGHUP",
            Signal::Quit => "SIGQUIT",
            Signal::User1 => "SIGUSR1",
            Signal::User2 => "SIGUSR2",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signal {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "INT" | "INTERRUPT" => Ok(Signal::Interrupt),
            "TERM" | "TERMINATE" => Ok(Signal::Terminate),
            "KILL" => Ok(Signal::Kill),
            "HUP" | "HANGUP" => Ok(Signal::Hangup),
            "QUIT" => Ok(Signal::Quit),
            "USR1" | "USER1" => Ok(Signal::User1),
            "USR2" | "USER2" => Ok(Signal::User2),
            _ => Err(HarnessError::Config(format!("unknown signal: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_names() {
        assert_eq!("SIGTERM".parse::<Signal>().unwrap(), Signal::Terminate);
        assert_eq!("int".parse::<Signal>().unwrap(), Signal::Interrupt);
        assert_eq!("kill".parse::<Signal>().unwrap(), Signal::Kill);
        assert!("SIGWINCH".parse::<Signal>().is_err());
    }

    #[test]
    fn test_signal_exit_code() {
        assert_eq!(Signal::Kill.exit_code(), 137);
        assert_eq!(Signal::Terminate.exit_code(), 143);
    }

    #[test]
    fn test_signal_serde() {
        let json = serde_json::to_string(&Signal::Interrupt).unwrap();
        assert_eq!(json, "\"interrupt\"");
        let parsed: Signal = serde_json::from_str("\"kill\"").unwrap();
        assert_eq!(parsed, Signal::Kill);
    }
}
