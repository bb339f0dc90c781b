//! CEO escalation.
//!
//! When a workflow cannot proceed without human judgment, the dispatcher
//! asks the escalator for a P0 decision bead referencing the original.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use loom_core::store::{Store, StoreError};
use loom_core::types::{Bead, BeadType, Priority};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EscalatorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Escalator trait
// ---------------------------------------------------------------------------

/// Creates CEO decision beads. Implementations must mark the new bead P0
/// with type decision.
#[async_trait]
pub trait Escalator: Send + Sync {
    async fn create_ceo_decision_bead(
        &self,
        original: &Bead,
        title: &str,
        description: &str,
    ) -> Result<Uuid, EscalatorError>;
}

// ---------------------------------------------------------------------------
// StoreEscalator
// ---------------------------------------------------------------------------

/// Store-backed escalator: the decision bead lands in the same project as
/// the original and records its source in context.
pub struct StoreEscalator {
    store: Arc<Store>,
}

impl StoreEscalator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Escalator for StoreEscalator {
    async fn create_ceo_decision_bead(
        &self,
        original: &Bead,
        title: &str,
        description: &str,
    ) -> Result<Uuid, EscalatorError> {
        let mut decision = Bead::new(title, &original.project_id, BeadType::Decision, Priority::P0)
            .with_description(description);
        decision
            .context
            .insert("escalation_source_bead".into(), original.id.to_string());

        let id = self.store.create_bead(&decision).await?;
        info!(bead_id = %original.id, decision_bead_id = %id, "CEO decision bead created");
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::types::BeadStatus;

    #[tokio::test]
    async fn decision_bead_is_p0_decision_in_same_project() {
        let store = Arc::new(Store::new_in_memory().await.unwrap());
        let escalator = StoreEscalator::new(store.clone());

        let original = Bead::new("stuck work", "loom", BeadType::Feature, Priority::P2);
        store.upsert_bead(&original).await.unwrap();

        let id = escalator
            .create_ceo_decision_bead(&original, "[CEO-Escalation] Workflow stuck: x", "details")
            .await
            .unwrap();

        let decision = store.get_bead(id).await.unwrap().unwrap();
        assert_eq!(decision.bead_type, BeadType::Decision);
        assert_eq!(decision.priority, Priority::P0);
        assert_eq!(decision.status, BeadStatus::Open);
        assert_eq!(decision.project_id, "loom");
        assert_eq!(
            decision.context.get("escalation_source_bead").unwrap(),
            &original.id.to_string()
        );
    }
}
