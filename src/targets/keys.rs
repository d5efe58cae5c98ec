//! Identity keys for tenants and targets.
//!
//! Each key has two string forms:
//! - persistence form, stable and parseable, used as map keys and in paths
//! - debug form (`Display`), for humans only and never parsed back

use std::fmt;
use std::str::FromStr;

use super::{CellTenantType, TargetsError};

const SEPARATOR: char = '/';

/// Identity of a logical broker/channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellTenantKey {
    tenant_type: CellTenantType,
    namespace: String,
    name: String,
}

impl CellTenantKey {
    pub fn new(
        tenant_type: CellTenantType,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            tenant_type,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for the default tenant type.
    pub fn broker(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(CellTenantType::Broker, namespace, name)
    }

    pub fn tenant_type(&self) -> CellTenantType {
        self.tenant_type
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_key(&self, target: impl Into<String>) -> TargetKey {
        TargetKey {
            cell_tenant: self.clone(),
            name: target.into(),
        }
    }

    /// `<ns>/<name>` for brokers (kept short for backward compatibility),
    /// `<type>/<ns>/<name>` otherwise.
    pub fn persistence_string(&self) -> String {
        match self.tenant_type {
            CellTenantType::Broker => format!("{}/{}", self.namespace, self.name),
            other => format!("{}/{}/{}", other.as_str(), self.namespace, self.name),
        }
    }

    pub fn parse(s: &str) -> Result<Self, TargetsError> {
        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid(s, "empty segment"));
        }
        match parts.as_slice() {
            [namespace, name] => Ok(Self::broker(*namespace, *name)),
            [tenant_type, namespace, name] => {
                let tenant_type = CellTenantType::from_name(tenant_type)
                    .ok_or_else(|| invalid(s, "unknown cell tenant type"))?;
                Ok(Self::new(tenant_type, *namespace, *name))
            }
            _ => Err(invalid(s, "expected <ns>/<name> or <type>/<ns>/<name>")),
        }
    }
}

impl fmt::Display for CellTenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.tenant_type.as_str(),
            self.namespace,
            self.name
        )
    }
}

impl FromStr for CellTenantKey {
    type Err = TargetsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identity of a target: its tenant plus the target name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    cell_tenant: CellTenantKey,
    name: String,
}

impl TargetKey {
    pub fn cell_tenant(&self) -> &CellTenantKey {
        &self.cell_tenant
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn persistence_string(&self) -> String {
        format!(
            "{}{}{}",
            self.cell_tenant.persistence_string(),
            SEPARATOR,
            self.name
        )
    }

    /// The target name is always the last segment, so it is split off before
    /// the tenant prefix is parsed.
    pub fn parse(s: &str) -> Result<Self, TargetsError> {
        let (tenant, name) = s
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| invalid(s, "missing target name"))?;
        if name.is_empty() {
            return Err(invalid(s, "empty segment"));
        }
        Ok(CellTenantKey::parse(tenant)?.target_key(name))
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.cell_tenant, self.name)
    }
}

impl FromStr for TargetKey {
    type Err = TargetsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn invalid(key: &str, reason: &'static str) -> TargetsError {
    TargetsError::InvalidKey {
        key: key.to_string(),
        reason,
    }
}
