use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::AppResult;
use crate::store::models::{SessionStatus, SyncSession};
use crate::store::ReconStore;
use crate::sync::statistics::RunStatistics;

/// Tracks sync sessions so each run can request only provider data newer
/// than the last successful one.
pub struct SessionTracker {
    store: Arc<dyn ReconStore>,
}

impl SessionTracker {
    pub fn new(store: Arc<dyn ReconStore>) -> Self {
        Self { store }
    }

    /// Watermark for incremental sync. None means no run has ever
    /// completed: the caller performs a full historical sync. Failed and
    /// still-running sessions never advance the watermark, even when they
    /// are more recent in wall-clock time.
    pub async fn last_successful_sync(&self) -> AppResult<Option<DateTime<Utc>>> {
        self.store.last_successful_sync().await
    }

    pub async fn start_session(&self) -> AppResult<SyncSession> {
        let session = SyncSession {
            id: Uuid::new_v4(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            statistics: RunStatistics::new(),
        };
        self.store.insert_session(&session).await?;
        info!(session_id = %session.id, "Started sync session");
        Ok(session)
    }

    /// Close a session on a terminal status; `ended_at` is only ever set
    /// here, so a crashed run leaves a Running row that the watermark query
    /// ignores.
    pub async fn end_session(
        &self,
        mut session: SyncSession,
        status: SessionStatus,
        statistics: RunStatistics,
    ) -> AppResult<SyncSession> {
        debug_assert!(status.is_terminal());
        session.status = status;
        session.ended_at = Some(Utc::now());
        session.statistics = statistics;
        self.store.update_session(&session).await?;
        info!(
            session_id = %session.id,
            status = ?session.status,
            processed = session.statistics.processed,
            resolved = session.statistics.resolved,
            "Ended sync session"
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_first_ever_run_has_no_watermark() {
        let store = Arc::new(MemoryStore::new());
        let tracker = SessionTracker::new(store);
        assert_eq!(tracker.last_successful_sync().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_only_completed_sessions_advance_watermark() {
        let store = Arc::new(MemoryStore::new());
        let tracker = SessionTracker::new(store.clone());

        let first = tracker.start_session().await.unwrap();
        let first = tracker
            .end_session(first, SessionStatus::Completed, RunStatistics::new())
            .await
            .unwrap();
        let t1 = first.ended_at.unwrap();

        // A later failed session and a dangling running session
        let failed = tracker.start_session().await.unwrap();
        tracker
            .end_session(failed, SessionStatus::Failed, RunStatistics::new())
            .await
            .unwrap();
        tracker.start_session().await.unwrap();

        assert_eq!(tracker.last_successful_sync().await.unwrap(), Some(t1));
    }
}
