//! Tool descriptor value object.

use super::FleetDomainError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata for a tool exposed by a connected server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawToolDescriptor")]
pub struct ToolDescriptor {
    name: String,
    description: String,
    input_schema: Value,
}

/// Wire shape of a tool descriptor before validation.
#[derive(Deserialize)]
struct RawToolDescriptor {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    input_schema: Value,
}

impl TryFrom<RawToolDescriptor> for ToolDescriptor {
    type Error = FleetDomainError;

    fn try_from(raw: RawToolDescriptor) -> Result<Self, Self::Error> {
        Self::new(raw.name, raw.description.unwrap_or_default(), raw.input_schema)
    }
}

impl ToolDescriptor {
    /// Creates a tool descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`FleetDomainError::EmptyToolName`] when the name is empty
    /// after trimming.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Result<Self, FleetDomainError> {
        let normalized_name = name.into().trim().to_owned();
        if normalized_name.is_empty() {
            return Err(FleetDomainError::EmptyToolName);
        }

        Ok(Self {
            name: normalized_name,
            description: description.into().trim().to_owned(),
            input_schema,
        })
    }

    /// Returns the tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tool description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the parameter schema.
    #[must_use]
    pub const fn input_schema(&self) -> &Value {
        &self.input_schema
    }
}
