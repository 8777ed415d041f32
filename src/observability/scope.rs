//! ObservationScope for automatic begin/complete logging
//!
//! - Logs `{name}_BEGIN` on creation
//! - Logs `{name}_COMPLETE` or `{name}_FAILED` when resolved
//! - Logs `{name}_INCOMPLETE` on drop if never resolved

use std::time::Instant;

use super::logger::Logger;

/// A scope that logs the begin and the resolution of one operation.
///
/// ```ignore
/// let scope = ObservationScope::with_fields("ROUND_COMMIT", &[("round", "req1")]);
/// // ... do work ...
/// scope.complete(); // logs ROUND_COMMIT_COMPLETE with elapsed_ms
/// ```
pub struct ObservationScope {
    name: &'static str,
    fields: Vec<(&'static str, String)>,
    started: Instant,
    resolved: bool,
}

impl ObservationScope {
    /// Create a new scope, logging `{name}_BEGIN`
    pub fn new(name: &'static str) -> Self {
        Self::with_fields(name, &[])
    }

    /// Create a new scope carrying fields repeated on every line
    pub fn with_fields(name: &'static str, fields: &[(&'static str, &str)]) -> Self {
        Logger::info(&format!("{}_BEGIN", name), fields);
        Self {
            name,
            fields: fields.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            started: Instant::now(),
            resolved: false,
        }
    }

    fn field_refs(&self) -> Vec<(&str, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }

    /// Mark the scope as completed
    pub fn complete(mut self) {
        self.resolved = true;
        let elapsed = self.started.elapsed().as_millis().to_string();
        let mut fields = self.field_refs();
        fields.push(("elapsed_ms", elapsed.as_str()));
        Logger::info(&format!("{}_COMPLETE", self.name), &fields);
    }

    /// Mark the scope as failed
    pub fn fail(mut self, reason: &str) {
        self.resolved = true;
        let mut fields = self.field_refs();
        fields.push(("reason", reason));
        Logger::error(&format!("{}_FAILED", self.name), &fields);
    }

    /// Check if the scope has been resolved
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.resolved {
            let mut fields = self.field_refs();
            fields.push(("reason", "scope dropped without resolution"));
            Logger::warn(&format!("{}_INCOMPLETE", self.name), &fields);
        }
    }
}
