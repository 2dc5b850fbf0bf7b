//! Key encoding and decoding for storage layer.
//!
//! Key format: `{prefix}:{tenant}:{suffix}`
//! - prefix: identifies the key type (agent, outbox)
//! - tenant: tenant identifier, never contains `:`
//! - suffix: ULID for agents, zero-padded sequence for events
//!
//! Both suffixes sort lexicographically in their natural order, so a prefix
//! scan over one tenant yields agents ordered by id and events ordered by
//! sequence.

use outbox_types::AgentId;

use crate::error::StorageError;

/// Reject tenant identifiers that would break key parsing.
pub fn validate_tenant(tenant: &str) -> Result<(), StorageError> {
    if tenant.is_empty() {
        return Err(StorageError::InvalidTenant("tenant id is empty".to_string()));
    }
    if tenant.contains(':') {
        return Err(StorageError::InvalidTenant(format!(
            "tenant id must not contain ':': {}",
            tenant
        )));
    }
    Ok(())
}

/// Key for agent rows
/// Format: agent:{tenant}:{ulid}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentKey {
    pub tenant: String,
    pub id: AgentId,
}

impl AgentKey {
    pub fn new(tenant: impl Into<String>, id: AgentId) -> Self {
        Self {
            tenant: tenant.into(),
            id,
        }
    }

    /// Encode key to bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("agent:{}:{}", self.tenant, self.id).into_bytes()
    }

    /// Scan prefix covering every agent of a tenant
    pub fn tenant_prefix(tenant: &str) -> Vec<u8> {
        format!("agent:{}:", tenant).into_bytes()
    }

    /// Decode key from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        let parts: Vec<&str> = s.splitn(3, ':').collect();
        if parts.len() != 3 || parts[0] != "agent" {
            return Err(StorageError::Key(format!("Invalid agent key format: {}", s)));
        }

        let id: AgentId = parts[2]
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid agent id: {}", e)))?;

        Ok(Self {
            tenant: parts[1].to_string(),
            id,
        })
    }
}

/// Key for outbox events, shared by the pending and poison column families
/// Format: outbox:{tenant}:{sequence:020}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxKey {
    pub tenant: String,
    /// Monotonic sequence number
    pub sequence: u64,
}

impl OutboxKey {
    pub fn new(tenant: impl Into<String>, sequence: u64) -> Self {
        Self {
            tenant: tenant.into(),
            sequence,
        }
    }

    /// Encode key to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        // Zero-pad sequence to 20 digits for lexicographic sorting
        format!("outbox:{}:{:020}", self.tenant, self.sequence).into_bytes()
    }

    /// Scan prefix covering every event of a tenant
    pub fn tenant_prefix(tenant: &str) -> Vec<u8> {
        format!("outbox:{}:", tenant).into_bytes()
    }

    /// Decode key from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        let parts: Vec<&str> = s.splitn(3, ':').collect();
        if parts.len() != 3 || parts[0] != "outbox" {
            return Err(StorageError::Key(format!("Invalid outbox key format: {}", s)));
        }

        let sequence: u64 = parts[2]
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid sequence: {}", e)))?;

        Ok(Self {
            tenant: parts[1].to_string(),
            sequence,
        })
    }
}

/// Key of the persisted outbox sequence counter
pub const OUTBOX_SEQUENCE_KEY: &[u8] = b"meta:outbox_sequence";
