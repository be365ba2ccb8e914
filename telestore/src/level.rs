//! Log levels and their default namespaces.

use std::fmt;

/// Namespace used for level codes outside the known range.
pub const UNKNOWN_NAMESPACE: &str = "text_logs/unknown";

/// Severity of a text log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum Level {
    /// Diagnostic detail.
    Debug = 0,
    /// Normal operation.
    Info = 1,
    /// Something unexpected but recoverable.
    Warning = 2,
    /// A failed operation.
    Error = 3,
    /// The process cannot continue.
    Critical = 4,
}

impl Level {
    /// Every level, in ascending severity.
    pub const ALL: [Level; 5] = [
        Level::Debug,
        Level::Info,
        Level::Warning,
        Level::Error,
        Level::Critical,
    ];

    /// Numeric code stored in log records.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Namespace that [`Logger::log_text`](crate::Logger::log_text) writes
    /// this level to.
    pub const fn default_namespace(self) -> &'static str {
        match self {
            Level::Debug => "text_logs/debug",
            Level::Info => "text_logs/info",
            Level::Warning => "text_logs/warnings",
            Level::Error => "text_logs/errors",
            Level::Critical => "text_logs/critical",
        }
    }

    /// Upper-case name of the level.
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }
}

impl TryFrom<i32> for Level {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, i32> {
        Level::ALL
            .into_iter()
            .find(|level| level.code() == code)
            .ok_or(code)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default namespace for a raw level code.
///
/// Codes that are not a [`Level`] map to [`UNKNOWN_NAMESPACE`].
pub fn default_namespace_for_code(code: i32) -> &'static str {
    Level::try_from(code).map_or(UNKNOWN_NAMESPACE, Level::default_namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_namespaces() {
        assert_eq!(Level::Debug.default_namespace(), "text_logs/debug");
        assert_eq!(Level::Info.default_namespace(), "text_logs/info");
        assert_eq!(Level::Warning.default_namespace(), "text_logs/warnings");
        assert_eq!(Level::Error.default_namespace(), "text_logs/errors");
        assert_eq!(Level::Critical.default_namespace(), "text_logs/critical");
    }

    #[test]
    fn test_codes_round_trip_and_unknown() {
        for level in Level::ALL {
            assert_eq!(Level::try_from(level.code()), Ok(level));
        }
        assert_eq!(Level::try_from(5), Err(5));
        assert_eq!(default_namespace_for_code(2), "text_logs/warnings");
        assert_eq!(default_namespace_for_code(-1), UNKNOWN_NAMESPACE);
        assert_eq!(default_namespace_for_code(42), UNKNOWN_NAMESPACE);
    }

    #[test]
    fn test_display() {
        assert_eq!(Level::Warning.to_string(), "WARNING");
    }
}
