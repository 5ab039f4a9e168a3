//! Device identity and registry naming
//!
//! Every topic string and the broker client identifier are derived from the
//! four-part device identity, so it is validated once at construction and
//! then never changes for the life of the process.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Registry half of a device identity: `projects/{p}/locations/{r}/registries/{g}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryPath {
    pub project_id: String,
    pub region: String,
    pub registry_id: String,
}

impl RegistryPath {
    pub fn new(
        project_id: impl Into<String>,
        region: impl Into<String>,
        registry_id: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let path = Self {
            project_id: project_id.into(),
            region: region.into(),
            registry_id: registry_id.into(),
        };
        validate_identity_segment("project_id", &path.project_id)?;
        validate_identity_segment("region", &path.region)?;
        validate_identity_segment("registry_id", &path.registry_id)?;
        Ok(path)
    }

    /// Full resource name of a device inside this registry
    pub fn device_name(&self, device_id: &str) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.region, self.registry_id, device_id
        )
    }
}

/// The single device this agent speaks for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub project_id: String,
    pub region: String,
    pub registry_id: String,
    pub device_id: String,
}

impl DeviceIdentity {
    pub fn new(
        project_id: impl Into<String>,
        region: impl Into<String>,
        registry_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let registry = RegistryPath::new(project_id, region, registry_id)?;
        Self::in_registry(&registry, device_id)
    }

    pub fn in_registry(
        registry: &RegistryPath,
        device_id: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let device_id = device_id.into();
        validate_identity_segment("device_id", &device_id)?;
        Ok(Self {
            project_id: registry.project_id.clone(),
            region: registry.region.clone(),
            registry_id: registry.registry_id.clone(),
            device_id,
        })
    }

    pub fn registry(&self) -> RegistryPath {
        RegistryPath {
            project_id: self.project_id.clone(),
            region: self.region.clone(),
            registry_id: self.registry_id.clone(),
        }
    }

    /// MQTT client identifier expected by the broker
    pub fn client_id(&self) -> String {
        self.registry().device_name(&self.device_id)
    }

    /// JWT audience claim
    pub fn audience(&self) -> &str {
        &self.project_id
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.client_id())
    }
}

/// Reject segments that would corrupt the client id or a topic string.
pub fn validate_identity_segment(field: &'static str, value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::Empty { field });
    }

    for ch in value.chars() {
        if ch == '/' || ch == '+' || ch == '#' || ch.is_whitespace() || ch.is_control() {
            return Err(IdentityError::InvalidChar { field, ch });
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("identity field `{field}` cannot be empty")]
    Empty { field: &'static str },
    #[error("identity field `{field}` contains invalid character: '{ch}'")]
    InvalidChar { field: &'static str, ch: char },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("proj-a", "us-central1", "reg-1", "dev-1").unwrap()
    }

    #[test]
    fn test_client_id_format() {
        assert_eq!(
            identity().client_id(),
            "projects/proj-a/locations/us-central1/registries/reg-1/devices/dev-1"
        );
    }

    #[test]
    fn test_registry_device_name_matches_client_id() {
        let id = identity();
        assert_eq!(id.registry().device_name("dev-1"), id.client_id());
        assert_eq!(id.audience(), "proj-a");
    }

    #[test]
    fn test_empty_fields_rejected() {
        assert_eq!(
            DeviceIdentity::new("", "r", "g", "d"),
            Err(IdentityError::Empty {
                field: "project_id"
            })
        );
        assert_eq!(
            DeviceIdentity::new("p", "r", "g", ""),
            Err(IdentityError::Empty { field: "device_id" })
        );
    }

    #[test]
    fn test_topic_breaking_characters_rejected() {
        for bad in ["dev/1", "dev+1", "dev#1", "dev 1"] {
            assert!(
                DeviceIdentity::new("p", "r", "g", bad).is_err(),
                "{bad} should be rejected"
            );
        }
    }

    proptest! {
        #[test]
        fn valid_segments_always_accepted(id in "[a-zA-Z0-9._-]{1,64}") {
            prop_assert!(validate_identity_segment("device_id", &id).is_ok());
        }

        #[test]
        fn client_id_ends_with_device(id in "[a-zA-Z0-9._-]{1,32}") {
            let identity = DeviceIdentity::new("p", "r", "g", id.clone()).unwrap();
            let expected_suffix = format!("/devices/{}", id);
            prop_assert!(identity.client_id().ends_with(&expected_suffix));
        }
    }
}
