//! Outcome → feedback pattern table.
//!
//! The default table is embedded at compile time from `contrib/signals.toml`;
//! deployments can point `ROLLCALL_SIGNAL_MAP` at their own file.

use crate::feedback::{Beep, FeedbackKind, FeedbackPattern, LedColor};
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

const DEFAULT_SIGNAL_MAP: &str = include_str!("../contrib/signals.toml");

static EMBEDDED: OnceLock<SignalMap> = OnceLock::new();

#[derive(Debug, Error)]
pub enum SignalMapError {
    #[error("failed to read {0}: {1}")]
    Read(String, std::io::Error),
    #[error("bad signal map TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SignalMap {
    pub matched: FeedbackPattern,
    pub unmatched: FeedbackPattern,
    pub error: FeedbackPattern,
}

impl SignalMap {
    pub fn from_toml_str(src: &str) -> Result<Self, SignalMapError> {
        Ok(toml::from_str(src)?)
    }

    pub fn load(path: &Path) -> Result<Self, SignalMapError> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| SignalMapError::Read(path.display().to_string(), e))?;
        Self::from_toml_str(&src)
    }

    /// The embedded table, falling back to built-in patterns if it fails to parse.
    pub fn embedded() -> &'static SignalMap {
        EMBEDDED.get_or_init(|| match Self::from_toml_str(DEFAULT_SIGNAL_MAP) {
            Ok(map) => map,
            Err(e) => {
                tracing::error!(error = %e, "embedded signal map is invalid; using built-in patterns");
                Self::builtin()
            }
        })
    }

    fn builtin() -> Self {
        Self {
            matched: FeedbackPattern::new(LedColor::Green, Beep::Short),
            unmatched: FeedbackPattern::new(LedColor::Red, Beep::Long),
            error: FeedbackPattern::new(LedColor::Amber, Beep::None),
        }
    }

    pub fn pattern(&self, kind: FeedbackKind) -> FeedbackPattern {
        match kind {
            FeedbackKind::Matched => self.matched,
            FeedbackKind::Unmatched => self.unmatched,
            FeedbackKind::Error => self.error,
        }
    }
}

impl Default for SignalMap {
    fn default() -> Self {
        *Self::embedded()
    }
}
