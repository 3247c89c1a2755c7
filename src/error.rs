//! Error types for the DQMC engine.
//!
//! Fatal conditions are returned as [`DqmcError`]. Recoverable numerical
//! drift is not an error: it travels as a [`Consistency::Warning`] inside a
//! resynchronization report and the caller decides what to do with it.

use std::fmt;

use thiserror::Error;

/// Diagnostic payload for a weight whose phase disagrees with the tracked sign.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseDiagnostic {
    /// Last proposed flip as `(time, site)`, if any flip was proposed before the rebuild.
    pub flip: Option<(usize, usize)>,
    /// Log-weight tracked before the rebuild (cached + pending).
    pub current_log_weight: f64,
    /// Log-weight of the freshly rebuilt factorization.
    pub rebuilt_log_weight: f64,
    /// cos(phase) of the eigenvalue route multiplied by the SVD sign.
    pub phase_cosine: f64,
}

impl fmt::Display for PhaseDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.flip {
            Some((t, x)) => write!(f, "last flip (t={t}, x={x}), ")?,
            None => write!(f, "no flip proposed, ")?,
        }
        write!(
            f,
            "current log-weight {:.9}, rebuilt log-weight {:.9}, cos(phase) {:.6}",
            self.current_log_weight, self.rebuilt_log_weight, self.phase_cosine
        )
    }
}

/// Canonical error type of the crate.
#[derive(Debug, Error)]
pub enum DqmcError {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameters { name: &'static str, reason: String },

    #[error("non-physical weight after rebuild: {0}")]
    NonPhysicalWeight(Box<PhaseDiagnostic>),

    #[error("{stage}: decomposition did not converge or produced a zero or non-finite scale")]
    Decomposition { stage: &'static str },

    #[error("checkpoint i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DqmcError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        DqmcError::InvalidParameters { name, reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, DqmcError>;

/// Drift between incrementally tracked and rebuilt acceptance state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftReport {
    pub tracked_log_weight: f64,
    pub rebuilt_log_weight: f64,
    pub tracked_sign: f64,
    pub rebuilt_sign: f64,
}

impl DriftReport {
    pub fn log_weight_error(&self) -> f64 {
        self.rebuilt_log_weight - self.tracked_log_weight
    }

    pub fn sign_agrees(&self) -> bool {
        self.tracked_sign == self.rebuilt_sign
    }
}

/// Outcome of checking a rebuilt factorization against the tracked state.
#[derive(Debug, Clone, PartialEq)]
pub enum Consistency {
    Ok,
    Warning(DriftReport),
    Fatal(Box<PhaseDiagnostic>),
}

impl Consistency {
    pub fn is_ok(&self) -> bool {
        matches!(self, Consistency::Ok)
    }

    /// Turns a fatal outcome into an error, passing the others through.
    pub fn into_result(self) -> Result<Consistency> {
        match self {
            Consistency::Fatal(diagnostic) => Err(DqmcError::NonPhysicalWeight(diagnostic)),
            other => Ok(other),
        }
    }
}
