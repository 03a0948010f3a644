//! Required topic catalog and provisioning.
//!
//! The distributed transport provisions the catalog once per connection:
//! existing topics are listed, and the missing ones are created in a single
//! batch request.

use crate::broker::{Broker, BrokerError, BrokerResult, NewTopic};
use std::collections::HashSet;

/// A topic the application needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    /// Topic name (`<resource>.<action>`)
    pub name: String,
    /// Number of partitions
    pub partitions: u32,
}

impl TopicSpec {
    /// Create a topic spec.
    pub fn new(name: impl Into<String>, partitions: u32) -> Self {
        Self {
            name: name.into(),
            partitions,
        }
    }
}

/// Topics required by the file-storage application.
pub fn default_catalog() -> Vec<TopicSpec> {
    vec![
        TopicSpec::new("file.uploaded", 6),
        TopicSpec::new("file.updated", 3),
        TopicSpec::new("file.deleted", 3),
        TopicSpec::new("file.restored", 3),
        TopicSpec::new("file.shared", 3),
        TopicSpec::new("folder.created", 3),
        TopicSpec::new("folder.deleted", 3),
        TopicSpec::new("trash.emptied", 1),
    ]
}

/// Outcome of a provisioning run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Topics created by this run
    pub created: Vec<String>,
    /// Catalog topics that already existed
    pub existing: usize,
}

/// Ensures the required topics exist on the broker.
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    catalog: Vec<TopicSpec>,
    replication_factor: i16,
}

impl TopicRegistry {
    /// Create a registry for `catalog`.
    pub fn new(catalog: Vec<TopicSpec>, replication_factor: i16) -> Self {
        Self {
            catalog,
            replication_factor,
        }
    }

    /// The required catalog.
    pub fn catalog(&self) -> &[TopicSpec] {
        &self.catalog
    }

    /// Declared partition count of a catalog topic.
    pub fn partitions_for(&self, topic: &str) -> Option<u32> {
        self.catalog
            .iter()
            .find(|spec| spec.name == topic)
            .map(|spec| spec.partitions)
    }

    /// Create the catalog topics missing from the broker.
    ///
    /// Idempotent: with an unchanged catalog a second run issues no creation
    /// request. A failed creation is tolerated when a re-listing shows every
    /// topic exists anyway (another process won the race).
    ///
    /// # Arguments
    ///
    /// * `broker` - Broker to list and create topics on
    ///
    /// # Returns
    ///
    /// A [`ProvisionReport`] naming the topics this run created. Unreachable
    /// broker errors are returned as is.
    pub async fn provision(&self, broker: &dyn Broker) -> BrokerResult<ProvisionReport> {
        let existing: HashSet<String> = broker.list_topics().await?.into_iter().collect();

        let missing: Vec<NewTopic> = self
            .catalog
            .iter()
            .filter(|spec| !existing.contains(&spec.name))
            .map(|spec| NewTopic {
                name: spec.name.clone(),
                partitions: spec.partitions,
                replication_factor: self.replication_factor,
            })
            .collect();

        let report = ProvisionReport {
            created: missing.iter().map(|t| t.name.clone()).collect(),
            existing: self.catalog.len() - missing.len(),
        };

        if missing.is_empty() {
            tracing::debug!(topics = self.catalog.len(), "All required topics exist");
            return Ok(report);
        }

        if let Err(e) = broker.create_topics(&missing).await {
            if let BrokerError::Unreachable(_) = e {
                return Err(e);
            }

            let now: HashSet<String> = broker.list_topics().await?.into_iter().collect();
            let still_missing: Vec<&str> = missing
                .iter()
                .filter(|t| !now.contains(&t.name))
                .map(|t| t.name.as_str())
                .collect();
            if !still_missing.is_empty() {
                return Err(e);
            }

            tracing::warn!(error = %e, "Topic creation reported an error but all topics exist");
            return Ok(ProvisionReport {
                created: Vec::new(),
                existing: self.catalog.len(),
            });
        }

        tracing::info!(
            created = ?report.created,
            existing = report.existing,
            replication_factor = self.replication_factor,
            "Provisioned missing topics"
        );

        Ok(report)
    }
}
