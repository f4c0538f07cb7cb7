// Error taxonomy shared by every component of the station core.
//
// The `Display` text of each variant is what the shell shows to the
// operator, so transport details never leak into it.

use std::fmt;

use thiserror::Error;

/// The measurement input that fell outside table coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Temperature,
    Density,
    Dip,
    InvoiceDensity,
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Input::Temperature => "Temperature",
            Input::Density => "Density",
            Input::Dip => "Dip reading",
            Input::InvoiceDensity => "Invoice density",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The remote collaborator definitively reported the record as absent.
    /// This is the only failure allowed to invalidate a session.
    #[error("Station record not found")]
    NotFound,

    /// Network unreachable, timeout or server error. `detail` is kept for
    /// logs only.
    #[error("Connection failed. Check internet.")]
    Transient { detail: String },

    #[error("Invalid ID or Password")]
    Unauthenticated,

    #[error("{0} out of range")]
    OutOfRange(Input),

    #[error("System assets not loaded. Please refresh.")]
    AssetUnavailable,

    #[error("Chart data missing for tank type {0}")]
    ChartMissing(String),

    #[error("Unknown tank {0}")]
    UnknownTank(String),
}

impl Error {
    pub fn transient(detail: impl Into<String>) -> Self {
        Error::Transient {
            detail: detail.into(),
        }
    }

    /// True for failures that must never destroy persisted session state.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_names_the_input() {
        assert_eq!(
            Error::OutOfRange(Input::Temperature).to_string(),
            "Temperature out of range"
        );
        assert_eq!(
            Error::OutOfRange(Input::Density).to_string(),
            "Density out of range"
        );
        assert_eq!(
            Error::OutOfRange(Input::Dip).to_string(),
            "Dip reading out of range"
        );
    }

    #[test]
    fn transient_display_hides_transport_detail() {
        let err = Error::transient("tcp connect error: 10.0.0.1:443 refused");
        assert!(err.is_transient());
        assert!(!err.to_string().contains("10.0.0.1"));
    }

    #[test]
    fn login_failure_message_is_literal() {
        assert_eq!(Error::Unauthenticated.to_string(), "Invalid ID or Password");
    }
}
