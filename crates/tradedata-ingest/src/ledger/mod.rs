//! Durable per-release ingestion state
//!
//! The ledger is the single source of truth for where each release is in the
//! pipeline. Every write is checked against the state machine in
//! [`IngestionStatus::can_transition_to`], so a release can only move
//! forward, fail, or be explicitly reset from `Failed` to `Discovered`.

pub mod postgres;

pub use postgres::PgLedger;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::models::{IngestionState, IngestionStatus, Release, ReleaseId};

/// Storage for release descriptors and their ingestion state
#[async_trait]
pub trait IngestionLedger: Send + Sync {
    async fn get(&self, release_id: &ReleaseId) -> Result<Option<IngestionState>>;

    /// Record `state`. Fails with [`IngestError::InvalidTransition`] when the
    /// stored status cannot move to `state.status`, and with
    /// [`IngestError::UnknownRelease`] when the release was never registered.
    async fn upsert_state(&self, state: &IngestionState) -> Result<()>;

    async fn list_by_status(&self, status: IngestionStatus) -> Result<Vec<IngestionState>>;

    /// Register a discovered release; existing entries are left untouched.
    ///
    /// Returns the current state of the release.
    async fn register(&self, release: &Release) -> Result<IngestionState>;

    /// Release descriptor recorded at registration
    async fn release(&self, release_id: &ReleaseId) -> Result<Option<Release>>;
}

pub(crate) fn check_transition(release_id: &ReleaseId, from: IngestionStatus, to: IngestionStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(IngestError::InvalidTransition {
            release: release_id.to_string(),
            from,
            to,
        })
    }
}

pub(crate) fn check_detail(state: &IngestionState) -> Result<()> {
    let has_detail = state
        .error_detail
        .as_deref()
        .is_some_and(|d| !d.trim().is_empty());
    if state.status == IngestionStatus::Failed && !has_detail {
        return Err(IngestError::ledger(format!(
            "{}: failed state requires an error detail",
            state.release_id
        )));
    }
    Ok(())
}

/// Process-local ledger, used by tests and dry runs
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    releases: RwLock<HashMap<ReleaseId, Release>>,
    states: RwLock<HashMap<ReleaseId, IngestionState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IngestionLedger for InMemoryLedger {
    async fn get(&self, release_id: &ReleaseId) -> Result<Option<IngestionState>> {
        Ok(self.states.read().await.get(release_id).cloned())
    }

    async fn upsert_state(&self, state: &IngestionState) -> Result<()> {
        check_detail(state)?;

        let mut states = self.states.write().await;
        let current = states
            .get(&state.release_id)
            .ok_or_else(|| IngestError::UnknownRelease(state.release_id.to_string()))?;
        check_transition(&state.release_id, current.status, state.status)?;

        debug!(release = %state.release_id, from = %current.status, to = %state.status, "State change");
        states.insert(state.release_id.clone(), state.clone());
        Ok(())
    }

    async fn list_by_status(&self, status: IngestionStatus) -> Result<Vec<IngestionState>> {
        let mut matching: Vec<IngestionState> = self
            .states
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.release_id.as_str().cmp(b.release_id.as_str()));
        Ok(matching)
    }

    async fn register(&self, release: &Release) -> Result<IngestionState> {
        self.releases
            .write()
            .await
            .entry(release.id.clone())
            .or_insert_with(|| release.clone());

        let mut states = self.states.write().await;
        let state = states
            .entry(release.id.clone())
            .or_insert_with(|| IngestionState::discovered(release.id.clone()));
        Ok(state.clone())
    }

    async fn release(&self, release_id: &ReleaseId) -> Result<Option<Release>> {
        Ok(self.releases.read().await.get(release_id).cloned())
    }
}
