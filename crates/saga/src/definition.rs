//! Declarative saga definitions and the registry they are looked up in.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use state_store::Direction;

use crate::error::{Result, SagaError};

/// A command addressed to one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCommand {
    pub participant: String,
    pub action: String,
}

impl StepCommand {
    pub fn new(participant: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            participant: participant.into(),
            action: action.into(),
        }
    }
}

/// One step of a saga: a forward command and an optional compensating command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub forward: StepCommand,
    /// `None` makes the step non-compensable.
    pub compensation: Option<StepCommand>,
    /// Payload fields the participant needs to execute the step.
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl StepDefinition {
    pub fn new(
        name: impl Into<String>,
        participant: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            forward: StepCommand::new(participant, action),
            compensation: None,
            required_fields: Vec::new(),
        }
    }

    /// Sets the compensating command.
    pub fn compensated_by(
        mut self,
        participant: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.compensation = Some(StepCommand::new(participant, action));
        self
    }

    /// Adds payload fields the step requires.
    pub fn requires<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields
            .extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn is_compensable(&self) -> bool {
        self.compensation.is_some()
    }

    /// Returns the command for a direction, if the step has one.
    pub fn command(&self, direction: Direction) -> Option<&StepCommand> {
        match direction {
            Direction::Forward => Some(&self.forward),
            Direction::Compensate => self.compensation.as_ref(),
        }
    }
}

/// An immutable, ordered description of a multi-step transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub name: String,
    pub steps: Vec<StepDefinition>,
}

impl SagaDefinition {
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|step| step.name.as_str())
    }

    /// Checks the structural invariants of the definition.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SagaError::InvalidDefinition(
                "definition name must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "definition '{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "definition '{}' has duplicate step '{}'",
                    self.name, step.name
                )));
            }
        }
        Ok(())
    }

    /// Checks a start payload against the fields the steps require.
    pub fn validate_payload(&self, payload: &Value) -> Result<()> {
        let object = payload.as_object().ok_or_else(|| {
            SagaError::InvalidPayload("payload must be a JSON object".to_string())
        })?;
        if object.is_empty() {
            return Err(SagaError::InvalidPayload(
                "payload must not be empty".to_string(),
            ));
        }

        for step in &self.steps {
            for field in &step.required_fields {
                if object.get(field).is_none_or(Value::is_null) {
                    return Err(SagaError::InvalidPayload(format!(
                        "missing field '{}' required by step '{}'",
                        field, step.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`SagaDefinition`].
#[derive(Debug)]
pub struct SagaDefinitionBuilder {
    name: String,
    steps: Vec<StepDefinition>,
}

impl SagaDefinitionBuilder {
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Builds and validates the definition.
    pub fn build(self) -> Result<SagaDefinition> {
        let definition = SagaDefinition {
            name: self.name,
            steps: self.steps,
        };
        definition.validate()?;
        Ok(definition)
    }
}

/// Read-only lookup of definitions by name, populated at configuration time.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, Arc<SagaDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition, rejecting invalid or duplicate ones.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<()> {
        definition.validate()?;
        if self.definitions.contains_key(&definition.name) {
            return Err(SagaError::InvalidDefinition(format!(
                "definition '{}' is already registered",
                definition.name
            )));
        }

        tracing::info!(
            definition = %definition.name,
            steps = definition.steps.len(),
            "saga definition registered"
        );
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<SagaDefinition>> {
        self.definitions.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
