use serde::{Deserialize, Serialize};

use crate::{PackingPolicy, StorageKind};

/// Settings shared by every tensor created for a compute graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store every tensor with this storage kind instead of the one requested
    pub storage_kind_override: Option<StorageKind>,
    /// Pack every tensor with this policy instead of the one requested
    pub packing_override: Option<PackingPolicy>,
    /// Commit memory to resources when they are created. If false, memory is committed later
    /// by an external allocator.
    pub reserve_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_kind_override: None,
            packing_override: None,
            reserve_memory: true,
        }
    }
}

impl StorageConfig {
    pub fn with_storage_kind_override(mut self, kind: StorageKind) -> Self {
        self.storage_kind_override = Some(kind);
        self
    }

    pub fn with_packing_override(mut self, packing: PackingPolicy) -> Self {
        self.packing_override = Some(packing);
        self
    }

    pub fn with_reserve_memory(mut self, reserve_memory: bool) -> Self {
        self.reserve_memory = reserve_memory;
        self
    }

    /// Apply the overrides to a requested storage kind and packing policy.
    pub fn resolve(
        &self,
        kind: StorageKind,
        packing: PackingPolicy,
    ) -> (StorageKind, PackingPolicy) {
        (
            self.storage_kind_override.unwrap_or(kind),
            self.packing_override.unwrap_or(packing),
        )
    }
}

#[test]
fn overrides_replace_requested_layout() {
    let config = StorageConfig::default().with_packing_override(PackingPolicy::WidthPacked);
    assert_eq!(
        config.resolve(StorageKind::Image3D, PackingPolicy::ChannelsPacked),
        (StorageKind::Image3D, PackingPolicy::WidthPacked)
    );

    let config = config.with_storage_kind_override(StorageKind::Linear);
    assert_eq!(
        config.resolve(StorageKind::Image3D, PackingPolicy::ChannelsPacked),
        (StorageKind::Linear, PackingPolicy::WidthPacked)
    );
}

#[test]
fn deserialize_partial_config() {
    let config: StorageConfig =
        serde_json::from_str(r#"{ "packing_override": "HeightPacked" }"#).unwrap();
    assert_eq!(config.packing_override, Some(PackingPolicy::HeightPacked));
    assert_eq!(config.storage_kind_override, None);
    assert!(config.reserve_memory);
}
