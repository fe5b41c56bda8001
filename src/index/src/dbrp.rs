//! Database and retention-policy to bucket resolution.
//!
//! Legacy queries name a `database.retention_policy` pair; modern storage
//! is addressed by bucket. The query translation layer resolves the pair
//! through this interface before it ever touches the index. The index
//! core itself never consumes it.

use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;

pub type OrgId = u64;
pub type BucketId = u64;

#[derive(Clone, Debug, PartialEq)]
pub struct BucketMapping {
    pub organization_id: OrgId,
    pub bucket_id: BucketId,
    pub database: String,
    pub retention_policy: String,
    /// Whether this mapping answers for the database when no retention
    /// policy is given.
    pub default: bool,
}

#[async_trait]
pub trait BucketResolver: Send + Sync {
    /// Resolves a database and retention policy to its bucket mapping. An
    /// empty retention policy selects the database's default mapping.
    async fn find(
        &self,
        organization_id: OrgId,
        database: &str,
        retention_policy: &str,
    ) -> Result<Option<BucketMapping>>;
}

/// Resolver backed by an in-process mapping table.
#[derive(Default)]
pub struct InMemoryBucketResolver {
    mappings: RwLock<Vec<BucketMapping>>,
}

impl InMemoryBucketResolver {
    pub fn new() -> InMemoryBucketResolver {
        InMemoryBucketResolver::default()
    }

    pub fn add(&self, mapping: BucketMapping) -> Result<()> {
        self.mappings.write()?.push(mapping);
        Ok(())
    }
}

#[async_trait]
impl BucketResolver for InMemoryBucketResolver {
    async fn find(
        &self,
        organization_id: OrgId,
        database: &str,
        retention_policy: &str,
    ) -> Result<Option<BucketMapping>> {
        let mappings = self.mappings.read()?;
        let found = mappings
            .iter()
            .filter(|m| m.organization_id == organization_id && m.database == database)
            .find(|m| {
                if retention_policy.is_empty() {
                    m.default
                } else {
                    m.retention_policy == retention_policy
                }
            })
            .cloned();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(org: OrgId, bucket: BucketId, rp: &str, default: bool) -> BucketMapping {
        BucketMapping {
            organization_id: org,
            bucket_id: bucket,
            database: "db0".to_string(),
            retention_policy: rp.to_string(),
            default,
        }
    }

    #[tokio::test]
    async fn test_find_by_retention_policy() {
        let resolver = InMemoryBucketResolver::new();
        resolver.add(mapping(1, 100, "autogen", true)).unwrap();
        resolver.add(mapping(1, 101, "alternate", false)).unwrap();

        let m = resolver.find(1, "db0", "autogen").await.unwrap().unwrap();
        assert_eq!(m.bucket_id, 100);
        let m = resolver.find(1, "db0", "alternate").await.unwrap().unwrap();
        assert_eq!(m.bucket_id, 101);
        assert!(resolver.find(1, "db0", "nope").await.unwrap().is_none());
        assert!(resolver.find(1, "db1", "autogen").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_policy_selects_default() {
        let resolver = InMemoryBucketResolver::new();
        resolver.add(mapping(1, 101, "alternate", false)).unwrap();
        resolver.add(mapping(1, 100, "autogen", true)).unwrap();

        let m = resolver.find(1, "db0", "").await.unwrap().unwrap();
        assert_eq!(m.bucket_id, 100);
    }

    #[tokio::test]
    async fn test_organizations_are_isolated() {
        let resolver = InMemoryBucketResolver::new();
        resolver.add(mapping(1, 100, "autogen", true)).unwrap();
        resolver.add(mapping(2, 200, "autogen", true)).unwrap();

        let m = resolver.find(2, "db0", "").await.unwrap().unwrap();
        assert_eq!(m.bucket_id, 200);
        assert!(resolver.find(3, "db0", "").await.unwrap().is_none());
    }
}
