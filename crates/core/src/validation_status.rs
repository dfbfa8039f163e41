//! Persisted validation status of a reference artifact.
//!
//! These strings are what the manifest stores; the validate-and-fix
//! workflow re-derives its next action from them after a restart.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::agent::FailureKind;

/// Prefix for terminal-for-this-pass error statuses, e.g. `error_unauthorized`.
pub const ERROR_STATUS_PREFIX: &str = "error_";

/// Validation status of one reference artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ValidationStatus {
    #[default]
    Untested,
    Verified,
    Violated,
    /// Old handle cleared, rewrite/regeneration in progress.
    Fixing,
    VerifiedFixed,
    /// Retest failed after a rewrite. Needs an operator.
    ViolatedUnfixable,
    /// A non-policy failure during testing; carries the failure kind.
    Error(String),
}

impl ValidationStatus {
    pub fn error(kind: FailureKind) -> Self {
        ValidationStatus::Error(kind.as_str().to_string())
    }

    pub fn as_string(&self) -> String {
        match self {
            ValidationStatus::Untested => "untested".to_string(),
            ValidationStatus::Verified => "verified".to_string(),
            ValidationStatus::Violated => "violated".to_string(),
            ValidationStatus::Fixing => "fixing".to_string(),
            ValidationStatus::VerifiedFixed => "verified_fixed".to_string(),
            ValidationStatus::ViolatedUnfixable => "violated_unfixable".to_string(),
            ValidationStatus::Error(kind) => format!("{ERROR_STATUS_PREFIX}{kind}"),
        }
    }

    /// Parse a persisted status. Empty or unknown values read as `Untested`.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "verified" => ValidationStatus::Verified,
            "violated" => ValidationStatus::Violated,
            "fixing" => ValidationStatus::Fixing,
            "verified_fixed" => ValidationStatus::VerifiedFixed,
            "violated_unfixable" => ValidationStatus::ViolatedUnfixable,
            other => match other.strip_prefix(ERROR_STATUS_PREFIX) {
                Some(kind) if !kind.is_empty() => ValidationStatus::Error(kind.to_string()),
                _ => ValidationStatus::Untested,
            },
        }
    }

    /// A violation is known and the item should go straight to the fix path.
    pub fn needs_fix(&self) -> bool {
        matches!(self, ValidationStatus::Violated | ValidationStatus::Fixing)
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl Serialize for ValidationStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for ValidationStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ValidationStatus::parse(&s))
    }
}

// ---------------------------------------------------------------------------
// RoleHint
// ---------------------------------------------------------------------------

/// What a reference depicts; selects the rewriting rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleHint {
    Character,
    Location,
}

impl RoleHint {
    /// Derive the role from a reference id: `loc*` is a location,
    /// everything else a character.
    pub fn from_ref_id(ref_id: &str) -> Self {
        if ref_id.to_ascii_lowercase().starts_with("loc") {
            RoleHint::Location
        } else {
            RoleHint::Character
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleHint::Character => "character",
            RoleHint::Location => "location",
        }
    }
}
