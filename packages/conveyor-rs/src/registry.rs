//! Job type registry.
//!
//! The registry is the runtime source of truth for which type names exist,
//! which of them may start a chain from the outside (**entry** types), what
//! their payloads must look like, and which continuation/blocker edges each
//! type declares. Validation failures surface as
//! [`JobTypeValidationError`] with a stable code; nothing is persisted on a
//! validation failure.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{JobTypeValidationError, ValidationErrorCode};

/// Whether a type may start a chain from outside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTypeKind {
    /// May be used with `start_job_chain`.
    Entry,
    /// Reachable only as a continuation or a blocker.
    Internal,
}

/// Payload validator. Returns a human-readable reason on rejection.
pub type PayloadValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Declaration of one job type.
pub struct JobTypeSpec {
    name: String,
    kind: JobTypeKind,
    input_validator: Option<PayloadValidator>,
    output_validator: Option<PayloadValidator>,
    continuations: Vec<String>,
    blockers: Vec<String>,
}

impl JobTypeSpec {
    pub fn entry(name: impl Into<String>) -> Self {
        Self::new(name, JobTypeKind::Entry)
    }

    pub fn internal(name: impl Into<String>) -> Self {
        Self::new(name, JobTypeKind::Internal)
    }

    fn new(name: impl Into<String>, kind: JobTypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            input_validator: None,
            output_validator: None,
            continuations: Vec::new(),
            blockers: Vec::new(),
        }
    }

    pub fn with_input_validator(
        mut self,
        f: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.input_validator = Some(Arc::new(f));
        self
    }

    pub fn with_output_validator(
        mut self,
        f: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.output_validator = Some(Arc::new(f));
        self
    }

    /// Declare the type names this type may continue into.
    pub fn with_continuations<I, S>(mut self, continuations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.continuations = continuations.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the type names this type may start as blockers.
    pub fn with_blockers<I, S>(mut self, blockers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blockers = blockers.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> JobTypeKind {
        self.kind
    }
}

impl std::fmt::Debug for JobTypeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTypeSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("continuations", &self.continuations)
            .field("blockers", &self.blockers)
            .finish()
    }
}

/// Registry of job type declarations, keyed by name.
#[derive(Debug, Default)]
pub struct JobTypeRegistry {
    types: HashMap<String, JobTypeSpec>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type.
    ///
    /// # Panics
    ///
    /// Panics if the name is already registered; duplicate registrations are
    /// a wiring bug, not a runtime condition.
    pub fn register(&mut self, spec: JobTypeSpec) {
        if self.types.contains_key(spec.name()) {
            panic!("job type already registered: {}", spec.name());
        }
        self.types.insert(spec.name.clone(), spec);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, spec: JobTypeSpec) -> Self {
        self.register(spec);
        self
    }

    pub fn get(&self, type_name: &str) -> Option<&JobTypeSpec> {
        self.types.get(type_name)
    }

    pub fn has(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn known(&self, type_name: &str) -> Result<&JobTypeSpec, JobTypeValidationError> {
        self.get(type_name).ok_or_else(|| {
            JobTypeValidationError::new(
                ValidationErrorCode::UnknownType,
                type_name,
                "type is not registered",
            )
        })
    }

    /// Validate that `type_name` may start a chain from outside a job.
    pub fn validate_entry(&self, type_name: &str) -> Result<&JobTypeSpec, JobTypeValidationError> {
        let spec = self.known(type_name)?;
        if spec.kind != JobTypeKind::Entry {
            return Err(JobTypeValidationError::new(
                ValidationErrorCode::NotEntry,
                type_name,
                "only entry types may start a chain from outside",
            ));
        }
        Ok(spec)
    }

    /// Validate an input payload against the type's validator, if any.
    pub fn validate_input(
        &self,
        type_name: &str,
        input: &Value,
    ) -> Result<(), JobTypeValidationError> {
        let spec = self.known(type_name)?;
        if let Some(validator) = &spec.input_validator {
            validator(input).map_err(|detail| {
                JobTypeValidationError::new(ValidationErrorCode::InputInvalid, type_name, detail)
            })?;
        }
        Ok(())
    }

    /// Validate a terminal output against the type's validator, if any.
    ///
    /// Unlike input validation this tolerates an unregistered type: a chain
    /// may legitimately outlive the registration of its type, and refusing
    /// completion would wedge it forever.
    pub fn validate_output(
        &self,
        type_name: &str,
        output: &Value,
    ) -> Result<(), JobTypeValidationError> {
        if let Some(spec) = self.get(type_name) {
            if let Some(validator) = &spec.output_validator {
                validator(output).map_err(|detail| {
                    JobTypeValidationError::new(
                        ValidationErrorCode::OutputInvalid,
                        type_name,
                        detail,
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Validate that `from` declares `to` as a continuation edge.
    pub fn validate_continuation(
        &self,
        from: &str,
        to: &str,
    ) -> Result<&JobTypeSpec, JobTypeValidationError> {
        let from_spec = self.known(from)?;
        if !from_spec.continuations.iter().any(|c| c == to) {
            return Err(JobTypeValidationError::new(
                ValidationErrorCode::ContinuationInvalid,
                to,
                format!("'{from}' does not declare '{to}' as a continuation"),
            ));
        }
        self.known(to)
    }

    /// Validate that `from` declares `to` as a blocker edge.
    pub fn validate_blocker(
        &self,
        from: &str,
        to: &str,
    ) -> Result<&JobTypeSpec, JobTypeValidationError> {
        let from_spec = self.known(from)?;
        if !from_spec.blockers.iter().any(|b| b == to) {
            return Err(JobTypeValidationError::new(
                ValidationErrorCode::BlockerInvalid,
                to,
                format!("'{from}' does not declare '{to}' as a blocker"),
            ));
        }
        self.known(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JobTypeRegistry {
        JobTypeRegistry::new()
            .with(
                JobTypeSpec::entry("order:validate")
                    .with_continuations(["order:process"])
                    .with_input_validator(|input| {
                        if input.get("order_id").is_some() {
                            Ok(())
                        } else {
                            Err("missing order_id".to_string())
                        }
                    }),
            )
            .with(JobTypeSpec::internal("order:process").with_continuations(["order:complete"]))
            .with(JobTypeSpec::internal("order:complete"))
            .with(
                JobTypeSpec::entry("aggregate")
                    .with_blockers(["fetch-user", "fetch-permissions"]),
            )
            .with(JobTypeSpec::internal("fetch-user"))
            .with(JobTypeSpec::internal("fetch-permissions"))
    }

    #[test]
    fn entry_validation_accepts_entry_types() {
        let registry = registry();
        assert!(registry.validate_entry("order:validate").is_ok());
    }

    #[test]
    fn entry_validation_rejects_internal_types() {
        let registry = registry();
        let err = registry.validate_entry("order:process").unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::NotEntry);
    }

    #[test]
    fn entry_validation_rejects_unknown_types() {
        let registry = registry();
        let err = registry.validate_entry("nope").unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::UnknownType);
    }

    #[test]
    fn input_validator_runs() {
        let registry = registry();
        assert!(registry
            .validate_input("order:validate", &serde_json::json!({ "order_id": "ORD-1" }))
            .is_ok());

        let err = registry
            .validate_input("order:validate", &serde_json::json!({}))
            .unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::InputInvalid);
        assert_eq!(err.detail, "missing order_id");
    }

    #[test]
    fn types_without_validator_accept_anything() {
        let registry = registry();
        assert!(registry
            .validate_input("order:process", &serde_json::json!(null))
            .is_ok());
    }

    #[test]
    fn continuation_edges_are_enforced() {
        let registry = registry();
        assert!(registry
            .validate_continuation("order:validate", "order:process")
            .is_ok());

        let err = registry
            .validate_continuation("order:validate", "order:complete")
            .unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::ContinuationInvalid);
    }

    #[test]
    fn blocker_edges_are_enforced() {
        let registry = registry();
        assert!(registry.validate_blocker("aggregate", "fetch-user").is_ok());

        let err = registry
            .validate_blocker("aggregate", "order:process")
            .unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::BlockerInvalid);
    }

    #[test]
    fn output_validation_tolerates_unregistered_types() {
        let registry = registry();
        assert!(registry
            .validate_output("gone:type", &serde_json::json!({ "ok": true }))
            .is_ok());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut registry = registry();
        registry.register(JobTypeSpec::entry("order:validate"));
    }
}
