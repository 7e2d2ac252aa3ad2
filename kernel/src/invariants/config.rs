// Policy Configuration
//
// Declarative description of the policy set, loaded from the arbiter
// config file and turned into an `InvariantEngine`.

use serde::{Deserialize, Serialize};

use super::builtin::{
    NoDestructiveSchemaChange, NoRewriteDuringIngestion, SchemaCompatibility,
    SingleWriterExclusion, WriterAllowlist,
};
use super::compose::{AllOf, AnyOf};
use super::{InvariantEngine, Policy, PolicyError};
use crate::log::payload::Environment;
use crate::log::EngineId;

fn production_only() -> Vec<Environment> {
    vec![Environment::Production]
}

/// One configured policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum PolicySpec {
    NoDestructiveSchemaChange {
        #[serde(default = "production_only")]
        protected_environments: Vec<Environment>,
    },
    SingleWriterExclusion,
    NoRewriteDuringIngestion,
    SchemaCompatibility,
    WriterAllowlist {
        name: String,
        table_prefix: String,
        engines: Vec<EngineId>,
    },
    AllOf {
        name: String,
        policies: Vec<PolicySpec>,
    },
    AnyOf {
        name: String,
        policies: Vec<PolicySpec>,
    },
}

impl PolicySpec {
    /// The built-in policy set, in evaluation order.
    pub fn defaults() -> Vec<PolicySpec> {
        vec![
            PolicySpec::SchemaCompatibility,
            PolicySpec::NoDestructiveSchemaChange {
                protected_environments: production_only(),
            },
            PolicySpec::SingleWriterExclusion,
            PolicySpec::NoRewriteDuringIngestion,
        ]
    }

    pub fn build(&self) -> Box<dyn Policy> {
        match self {
            PolicySpec::NoDestructiveSchemaChange {
                protected_environments,
            } => Box::new(NoDestructiveSchemaChange::new(
                protected_environments.clone(),
            )),
            PolicySpec::SingleWriterExclusion => Box::new(SingleWriterExclusion),
            PolicySpec::NoRewriteDuringIngestion => Box::new(NoRewriteDuringIngestion),
            PolicySpec::SchemaCompatibility => Box::new(SchemaCompatibility),
            PolicySpec::WriterAllowlist {
                name,
                table_prefix,
                engines,
            } => Box::new(WriterAllowlist::new(
                name.clone(),
                table_prefix.clone(),
                engines.iter().cloned(),
            )),
            PolicySpec::AllOf { name, policies } => Box::new(AllOf::new(
                name.clone(),
                policies.iter().map(PolicySpec::build).collect(),
            )),
            PolicySpec::AnyOf { name, policies } => Box::new(AnyOf::new(
                name.clone(),
                policies.iter().map(PolicySpec::build).collect(),
            )),
        }
    }

    /// Structural checks that do not depend on the rest of the set.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |name: &str, reason: &str| PolicyError::Invalid {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        match self {
            PolicySpec::NoDestructiveSchemaChange {
                protected_environments,
            } if protected_environments.is_empty() => Err(invalid(
                super::builtin::NO_DESTRUCTIVE_SCHEMA_CHANGE,
                "protected_environments is empty; remove the policy instead",
            )),
            PolicySpec::WriterAllowlist { name, engines, .. } => {
                if name.trim().is_empty() {
                    return Err(invalid(name.as_str(), "name must not be empty"));
                }
                if engines.is_empty() {
                    return Err(invalid(name.as_str(), "engines must not be empty"));
                }
                Ok(())
            }
            PolicySpec::AllOf { name, policies } | PolicySpec::AnyOf { name, policies } => {
                if name.trim().is_empty() {
                    return Err(invalid(name.as_str(), "name must not be empty"));
                }
                if policies.is_empty() {
                    return Err(PolicyError::AppliesToNothing(name.clone()));
                }
                policies.iter().try_for_each(PolicySpec::validate)
            }
            _ => Ok(()),
        }
    }
}

/// Build an engine from configured policies, in the given order.
pub fn build_engine(policies: &[PolicySpec]) -> Result<InvariantEngine, PolicyError> {
    let mut engine = InvariantEngine::new();
    for policy in policies {
        policy.validate()?;
        engine.register_boxed(policy.build())?;
    }
    Ok(engine)
}
