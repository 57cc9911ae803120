//! Endpoint identity, status, and the status transition table.
//!
//! Two model variants are deployed: the 120B primary and the 20B fallback.
//! Each variant maps to exactly one managed endpoint whose status walks the
//! machine below. The tracker enforces the table; the manager drives it.
//!
//! ```text
//!                 ┌──────────┐
//!    sleeping ───▶│ starting │───▶ running ───▶ stopping ───▶ sleeping
//!    error ──────▶│          │───▶ error           │
//!    unknown ────▶└──────────┘                     └─────────▶ error
//! ```
//!
//! `unknown` is the post-restart state: the first management probe may move
//! it anywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Model variants
// ---------------------------------------------------------------------------

/// The configured model deployments, largest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVariant {
    #[serde(rename = "120b")]
    Gpt120b,
    #[serde(rename = "20b")]
    Gpt20b,
}

impl ModelVariant {
    /// Short tag used in URLs, logs, and the REST surface.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::Gpt120b => "120b",
            ModelVariant::Gpt20b => "20b",
        }
    }

    /// Model name as the inference provider knows it.
    pub fn api_name(&self) -> &'static str {
        match self {
            ModelVariant::Gpt120b => "gpt-oss-120b",
            ModelVariant::Gpt20b => "gpt-oss-20b",
        }
    }

    /// Every configured variant, preference order.
    pub fn all() -> [ModelVariant; 2] {
        [ModelVariant::Gpt120b, ModelVariant::Gpt20b]
    }

    /// The variant to retry on when this one fails. A single hop: the 20B
    /// model is the end of the line.
    pub fn fallback(&self) -> Option<ModelVariant> {
        match self {
            ModelVariant::Gpt120b => Some(ModelVariant::Gpt20b),
            ModelVariant::Gpt20b => None,
        }
    }

    /// Parse the short tag. `None` for anything else.
    pub fn from_tag(tag: &str) -> Option<ModelVariant> {
        match tag {
            "120b" => Some(ModelVariant::Gpt120b),
            "20b" => Some(ModelVariant::Gpt20b),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returned when a string names no configured variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl std::fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown model variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl std::str::FromStr for ModelVariant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelVariant::from_tag(s).ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Endpoint status
// ---------------------------------------------------------------------------

/// Lifecycle state of a managed endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Running,
    Sleeping,
    Starting,
    Stopping,
    Unknown,
    Error,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Running => "running",
            EndpointStatus::Sleeping => "sleeping",
            EndpointStatus::Starting => "starting",
            EndpointStatus::Stopping => "stopping",
            EndpointStatus::Unknown => "unknown",
            EndpointStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Legality table for endpoint status transitions.
///
/// Self-transitions are no-ops and always legal. `Unknown` is the
/// post-restart state, so the first probe may move it anywhere.
pub fn is_legal_status_transition(from: EndpointStatus, to: EndpointStatus) -> bool {
    use EndpointStatus::*;

    if from == to {
        return true;
    }
    if from == Unknown {
        return true;
    }
    matches!(
        (from, to),
        (Sleeping, Starting)
            | (Error, Starting)
            | (Starting, Running)
            | (Starting, Error)
            | (Starting, Stopping)
            | (Running, Stopping)
            | (Stopping, Sleeping)
            | (Stopping, Error)
    )
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Owned point-in-time view of one endpoint, as handed out by the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub id: ModelVariant,
    pub url: String,
    pub status: EndpointStatus,
    pub last_activity: Option<DateTime<Utc>>,
    pub wake_time: Option<DateTime<Utc>>,
    pub sleep_time: Option<DateTime<Utc>>,
    pub auto_sleep_deadline: Option<DateTime<Utc>>,
    pub in_flight: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use EndpointStatus::*;

    #[test]
    fn test_variant_tags_roundtrip() {
        for variant in ModelVariant::all() {
            assert_eq!(ModelVariant::from_tag(variant.as_str()), Some(variant));
            assert_eq!(variant.as_str().parse::<ModelVariant>().unwrap(), variant);
        }
        assert_eq!(ModelVariant::from_tag("70b"), None);
        assert!("70b".parse::<ModelVariant>().is_err());
    }

    #[test]
    fn test_variant_serializes_as_tag() {
        assert_eq!(
            serde_json::to_value(ModelVariant::Gpt120b).unwrap(),
            serde_json::json!("120b")
        );
    }

    #[test]
    fn test_fallback_is_a_single_hop() {
        assert_eq!(
            ModelVariant::Gpt120b.fallback(),
            Some(ModelVariant::Gpt20b)
        );
        assert_eq!(ModelVariant::Gpt20b.fallback(), None);
    }

    #[test]
    fn test_self_transitions_are_legal() {
        for status in [Running, Sleeping, Starting, Stopping, Unknown, Error] {
            assert!(is_legal_status_transition(status, status));
        }
    }

    #[test]
    fn test_wake_path_is_legal() {
        assert!(is_legal_status_transition(Sleeping, Starting));
        assert!(is_legal_status_transition(Error, Starting));
        assert!(is_legal_status_transition(Starting, Running));
        assert!(is_legal_status_transition(Starting, Error));
    }

    #[test]
    fn test_sleep_path_is_legal() {
        assert!(is_legal_status_transition(Running, Stopping));
        assert!(is_legal_status_transition(Starting, Stopping));
        assert!(is_legal_status_transition(Stopping, Sleeping));
        assert!(is_legal_status_transition(Stopping, Error));
    }

    #[test]
    fn test_unknown_moves_anywhere() {
        for status in [Running, Sleeping, Starting, Stopping, Error] {
            assert!(is_legal_status_transition(Unknown, status));
        }
    }

    #[test]
    fn test_illegal_jumps_rejected() {
        assert!(!is_legal_status_transition(Sleeping, Running));
        assert!(!is_legal_status_transition(Running, Sleeping));
        assert!(!is_legal_status_transition(Running, Starting));
        assert!(!is_legal_status_transition(Sleeping, Stopping));
        assert!(!is_legal_status_transition(Error, Running));
    }
}
