//! # Conditions
//!
//! Condition type shared by all resources, and [`Conditions`], the ordered list that holds
//! at most one entry per condition type.

use serde::{Deserialize, Serialize};

/// Condition type reporting overall readiness
pub const CONDITION_READY: &str = "Ready";
/// Module condition whose `status` stores the content hash of the last synced source
pub const CONDITION_SOURCE_HASH: &str = "SourceHash";

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

/// Condition represents a condition of a resource
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown; a hash for SourceHash)
    pub status: String,
    /// Last transition time (RFC3339)
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Ordered condition list keyed by type.
///
/// Serialized as a plain list. Insertion order is preserved, and `upsert` replaces in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, condition_type: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.r#type == condition_type)
    }

    /// True when the condition exists with status `True`
    pub fn is_true(&self, condition_type: &str) -> bool {
        self.find(condition_type)
            .is_some_and(|c| c.status == CONDITION_TRUE)
    }

    /// Insert or update the condition of `condition_type`.
    ///
    /// `lastTransitionTime` only moves when status, reason or message changes.
    /// Returns whether anything changed.
    pub fn upsert(
        &mut self,
        condition_type: &str,
        status: &str,
        reason: &str,
        message: &str,
    ) -> bool {
        let now = chrono::Utc::now().to_rfc3339();
        self.upsert_at(condition_type, status, reason, message, &now)
    }

    /// [`Conditions::upsert`] with an explicit timestamp
    pub fn upsert_at(
        &mut self,
        condition_type: &str,
        status: &str,
        reason: &str,
        message: &str,
        now: &str,
    ) -> bool {
        let Some(index) = self.0.iter().position(|c| c.r#type == condition_type) else {
            self.0.push(Condition {
                r#type: condition_type.to_string(),
                status: status.to_string(),
                last_transition_time: Some(now.to_string()),
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
            });
            return true;
        };

        // Collapse duplicates that may have been written by other clients
        let mut seen = false;
        let before = self.0.len();
        self.0.retain(|c| {
            if c.r#type != condition_type {
                return true;
            }
            let keep = !seen;
            seen = true;
            keep
        });
        let deduplicated = self.0.len() != before;

        let existing = &mut self.0[index];
        let unchanged = existing.status == status
            && existing.reason.as_deref() == Some(reason)
            && existing.message.as_deref() == Some(message);
        if unchanged {
            return deduplicated;
        }

        existing.status = status.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
        existing.last_transition_time = Some(now.to_string());
        true
    }

    /// Remove the condition of `condition_type`, returning it if present
    pub fn remove(&mut self, condition_type: &str) -> Option<Condition> {
        let index = self.0.iter().position(|c| c.r#type == condition_type)?;
        let removed = self.0.remove(index);
        self.0.retain(|c| c.r#type != condition_type);
        Some(removed)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(conditions: Vec<Condition>) -> Self {
        Self(conditions)
    }
}

impl<'a> IntoIterator for &'a Conditions {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
