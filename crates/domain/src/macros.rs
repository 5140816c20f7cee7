//! Display and FromStr for status enums
//!
//! Status values travel through logs, snapshot files and the work-item
//! source as lowercase strings. This macro keeps the two directions in one
//! place and parses case-insensitively.
//!
//! # Example
//!
//! ```rust
//! use relaysync_domain::impl_domain_status_conversions;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! pub enum RunState {
//!     Idle,
//!     Running,
//! }
//!
//! impl_domain_status_conversions!(RunState {
//!     Idle => "idle",
//!     Running => "running",
//! });
//!
//! assert_eq!(RunState::Running.to_string(), "running");
//! assert_eq!("IDLE".parse::<RunState>().unwrap(), RunState::Idle);
//! ```

/// Implements Display and FromStr traits for status enums
///
/// * `$enum_name` - The name of the enum type
/// * `$variant => $str` - Mapping of enum variants to their lowercase string
///   representations
#[macro_export]
macro_rules! impl_domain_status_conversions {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => f.write_str($str),)+
                }
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($enum_name), s)),
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestStatus {
        Queued,
        Done,
    }

    impl_domain_status_conversions!(TestStatus {
        Queued => "queued",
        Done => "done",
    });

    #[test]
    fn test_display_conversion() {
        assert_eq!(TestStatus::Queued.to_string(), "queued");
        assert_eq!(TestStatus::Done.to_string(), "done");
    }

    #[test]
    fn test_fromstr_is_case_insensitive() {
        assert_eq!(TestStatus::from_str("queued").unwrap(), TestStatus::Queued);
        assert_eq!(TestStatus::from_str("DONE").unwrap(), TestStatus::Done);
        assert_eq!(TestStatus::from_str("QuEuEd").unwrap(), TestStatus::Queued);
    }

    #[test]
    fn test_fromstr_invalid() {
        let err = TestStatus::from_str("archived").unwrap_err();
        assert_eq!(err, "Invalid TestStatus: archived");
    }
}
