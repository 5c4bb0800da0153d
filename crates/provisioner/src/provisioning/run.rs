use std::collections::BTreeMap;
use std::fmt;

/// Parameters of one provisioning attempt. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct ProvisioningRun {
    pub instance_name: String,
    pub ip_address: Option<String>,
    pub compose_documents: Vec<String>,
    pub files: Vec<InstanceFile>,
    pub authentication: Vec<RegistryAuthentication>,
    pub build_arguments: BTreeMap<String, String>,
}

/// A file written next to the compose documents, relative to the provisioning directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFile {
    pub path: String,
    pub contents: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuthentication {
    /// Registry host. `None` signs in to Docker Hub.
    pub registry: Option<String>,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuthentication")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
