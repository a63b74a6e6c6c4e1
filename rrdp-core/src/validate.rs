//! Object validation seam.
//!
//! RRDP only guarantees that the repository was mirrored as published.
//! Whether a published object is a well-formed, correctly signed RPKI
//! object is decided by an [`ObjectValidator`] supplied by the caller.

/// Verdict on a single published object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    /// Rejected, with the validator's reason
    Invalid(String),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

/// Object validator trait
///
/// Called for every object admitted by a snapshot or delta, after its
/// RRDP integrity checks passed. Implementations must not block for long;
/// they run on the worker task.
pub trait ObjectValidator: Send + Sync {
    fn validate(&self, uri: &str, content: &[u8]) -> ValidationResult;
}

/// Validator that accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ObjectValidator for AcceptAll {
    fn validate(&self, _uri: &str, _content: &[u8]) -> ValidationResult {
        ValidationResult::Valid
    }
}

/// Accepts objects whose URI ends with one of the given extensions
///
/// A cheap structural filter for repositories that should only carry RPKI
/// object types.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.into().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }
}

impl ObjectValidator for ExtensionFilter {
    fn validate(&self, uri: &str, _content: &[u8]) -> ValidationResult {
        let ext = uri
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if self.extensions.iter().any(|e| *e == ext) {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid(format!("unexpected object type for {}", uri))
        }
    }
}
