//! Demo session registry.
//!
//! Every state change is a compare-and-set on the expected prior state and is
//! recorded in `demo_session_transitions` within the same transaction.

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;
use std::collections::HashSet;

use super::models::{DemoSession, SessionState, SessionTransition};

const SESSION_COLUMNS: &str = r#"
    id, project_name, username, role, container_id, container_name, host_port,
    state, exclusive, frozen, route_pending, error_message,
    created_at, started_at, last_activity_at, last_switch_at, ended_at
"#;

const ACTIVE_STATES_SQL: &str =
    "('pending', 'creating', 'starting', 'running', 'switching', 'stopping')";

/// Columns written alongside a state change. `None` leaves a column as is.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    /// Only applied when the session has none yet.
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub host_port: Option<u16>,
    pub username: Option<String>,
    pub role: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub last_switch_at: Option<String>,
    pub ended_at: Option<String>,
    /// Refresh `last_activity_at` to this timestamp.
    pub touch: Option<String>,
    pub frozen: Option<bool>,
    /// Only apply if the session has been idle since before this timestamp.
    pub idle_before: Option<String>,
}

/// Repository for demo session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new PENDING session.
    ///
    /// Fails with a unique violation when the identity already holds an
    /// exclusive active session.
    pub async fn insert(&self, session: &DemoSession) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning transaction")?;

        sqlx::query(
            r#"
            INSERT INTO demo_sessions (
                id, project_name, username, role, container_id, container_name, host_port,
                state, exclusive, frozen, route_pending, error_message,
                created_at, started_at, last_activity_at, last_switch_at, ended_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.project_name)
        .bind(&session.username)
        .bind(&session.role)
        .bind(&session.container_id)
        .bind(&session.container_name)
        .bind(session.host_port)
        .bind(session.state.as_str())
        .bind(session.exclusive)
        .bind(session.frozen)
        .bind(session.route_pending)
        .bind(&session.error_message)
        .bind(&session.created_at)
        .bind(&session.started_at)
        .bind(&session.last_activity_at)
        .bind(&session.last_switch_at)
        .bind(&session.ended_at)
        .execute(&mut *tx)
        .await
        .context("inserting session")?;

        sqlx::query(
            r#"
            INSERT INTO demo_session_transitions (session_id, from_state, to_state, at, note)
            VALUES (?, NULL, ?, ?, 'registered')
            "#,
        )
        .bind(&session.id)
        .bind(session.state.as_str())
        .bind(&session.created_at)
        .execute(&mut *tx)
        .await
        .context("recording initial transition")?;

        tx.commit().await.context("committing session insert")?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<DemoSession>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM demo_sessions WHERE id = ?");
        sqlx::query_as::<_, DemoSession>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")
    }

    /// Active session holding `(project, username)`, if any.
    pub async fn find_active_for_identity(
        &self,
        project_name: &str,
        username: &str,
    ) -> Result<Option<DemoSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM demo_sessions
             WHERE project_name = ? AND username = ? AND state IN {ACTIVE_STATES_SQL}
             ORDER BY created_at DESC
             LIMIT 1"
        );
        sqlx::query_as::<_, DemoSession>(&query)
            .bind(project_name)
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("fetching active session for identity")
    }

    pub async fn list_active(&self) -> Result<Vec<DemoSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM demo_sessions
             WHERE state IN {ACTIVE_STATES_SQL}
             ORDER BY created_at DESC"
        );
        sqlx::query_as::<_, DemoSession>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing active sessions")
    }

    pub async fn list_by_state(&self, state: SessionState) -> Result<Vec<DemoSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM demo_sessions WHERE state = ? ORDER BY created_at DESC"
        );
        sqlx::query_as::<_, DemoSession>(&query)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .context("listing sessions by state")
    }

    /// RUNNING sessions of one project, most recently started first.
    pub async fn list_running_for_project(&self, project_name: &str) -> Result<Vec<DemoSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM demo_sessions
             WHERE project_name = ? AND state = 'running'
             ORDER BY started_at DESC, created_at DESC"
        );
        sqlx::query_as::<_, DemoSession>(&query)
            .bind(project_name)
            .fetch_all(&self.pool)
            .await
            .context("listing running sessions for project")
    }

    /// Non-terminated sessions with no activity since `cutoff`.
    pub async fn list_idle(&self, cutoff: &str) -> Result<Vec<DemoSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM demo_sessions
             WHERE state != 'terminated' AND last_activity_at < ?
             ORDER BY last_activity_at ASC"
        );
        sqlx::query_as::<_, DemoSession>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .context("listing idle sessions")
    }

    /// RUNNING, unfrozen sessions with no activity since `cutoff`.
    pub async fn list_freeze_candidates(&self, cutoff: &str) -> Result<Vec<DemoSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM demo_sessions
             WHERE state = 'running' AND frozen = 0 AND last_activity_at < ?
             ORDER BY last_activity_at ASC"
        );
        sqlx::query_as::<_, DemoSession>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .context("listing freeze candidates")
    }

    /// Ids of sessions that may still own a container.
    pub async fn live_session_ids(&self) -> Result<HashSet<String>> {
        let query = format!("SELECT id FROM demo_sessions WHERE state IN {ACTIVE_STATES_SQL}");
        let ids: Vec<(String,)> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing live session ids")?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Most recent sessions regardless of state.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<DemoSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM demo_sessions ORDER BY created_at DESC LIMIT ?"
        );
        sqlx::query_as::<_, DemoSession>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("listing recent sessions")
    }

    /// Record the container of a session. Never replaces an existing one.
    pub async fn bind_container(
        &self,
        id: &str,
        container_id: &str,
        container_name: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE demo_sessions
            SET container_id = COALESCE(container_id, ?),
                container_name = COALESCE(container_name, ?)
            WHERE id = ?
            "#,
        )
        .bind(container_id)
        .bind(container_name)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("binding container to session")?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a session from `from` to `to` if it is still in `from`.
    ///
    /// Returns `false` when the session changed (or went idle-fresh) in the
    /// meantime. Edges outside the lifecycle graph are rejected outright.
    pub async fn transition(
        &self,
        id: &str,
        from: SessionState,
        to: SessionState,
        patch: &TransitionPatch,
        note: Option<&str>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            bail!("invalid session transition {} -> {}", from, to);
        }

        let at = super::models::now_timestamp();
        let mut tx = self.pool.begin().await.context("beginning transaction")?;

        let result = sqlx::query(
            r#"
            UPDATE demo_sessions
            SET state = ?1,
                container_id = COALESCE(container_id, ?2),
                container_name = COALESCE(container_name, ?3),
                host_port = COALESCE(?4, host_port),
                username = COALESCE(?5, username),
                role = COALESCE(?6, role),
                error_message = COALESCE(?7, error_message),
                started_at = COALESCE(?8, started_at),
                last_switch_at = COALESCE(?9, last_switch_at),
                ended_at = COALESCE(?10, ended_at),
                last_activity_at = COALESCE(?11, last_activity_at),
                frozen = COALESCE(?12, frozen)
            WHERE id = ?13
              AND state = ?14
              AND (?15 IS NULL OR last_activity_at < ?15)
            "#,
        )
        .bind(to.as_str())
        .bind(&patch.container_id)
        .bind(&patch.container_name)
        .bind(patch.host_port.map(i64::from))
        .bind(&patch.username)
        .bind(&patch.role)
        .bind(&patch.error_message)
        .bind(&patch.started_at)
        .bind(&patch.last_switch_at)
        .bind(&patch.ended_at)
        .bind(&patch.touch)
        .bind(patch.frozen)
        .bind(id)
        .bind(from.as_str())
        .bind(&patch.idle_before)
        .execute(&mut *tx)
        .await
        .context("updating session state")?;

        if result.rows_affected() == 0 {
            tx.rollback().await.context("rolling back transition")?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO demo_session_transitions (session_id, from_state, to_state, at, note)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(&at)
        .bind(note)
        .execute(&mut *tx)
        .await
        .context("recording transition")?;

        tx.commit().await.context("committing transition")?;
        Ok(true)
    }

    /// Refresh the activity timestamp of a session that is not finished.
    pub async fn touch(&self, id: &str, now: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE demo_sessions
            SET last_activity_at = ?
            WHERE id = ? AND state NOT IN ('terminated', 'error') AND last_activity_at < ?
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("touching session")?;

        Ok(result.rows_affected() > 0)
    }

    /// Set the frozen flag of a RUNNING session.
    pub async fn set_frozen(&self, id: &str, frozen: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE demo_sessions SET frozen = ? WHERE id = ? AND state = 'running'",
        )
        .bind(frozen)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating frozen flag")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_route_pending(&self, id: &str, pending: bool) -> Result<()> {
        sqlx::query("UPDATE demo_sessions SET route_pending = ? WHERE id = ?")
            .bind(pending)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating route_pending flag")?;
        Ok(())
    }

    /// Total session count, active count, and start-to-end durations.
    pub async fn aggregate(&self) -> Result<(i64, i64, Vec<DemoSession>)> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM demo_sessions")
            .fetch_one(&self.pool)
            .await
            .context("counting sessions")?;

        let active_query =
            format!("SELECT COUNT(*) FROM demo_sessions WHERE state IN {ACTIVE_STATES_SQL}");
        let (active,): (i64,) = sqlx::query_as(&active_query)
            .fetch_one(&self.pool)
            .await
            .context("counting active sessions")?;

        let ended_query = format!(
            "SELECT {SESSION_COLUMNS} FROM demo_sessions
             WHERE started_at IS NOT NULL AND ended_at IS NOT NULL"
        );
        let ended = sqlx::query_as::<_, DemoSession>(&ended_query)
            .fetch_all(&self.pool)
            .await
            .context("listing completed sessions")?;

        Ok((total, active, ended))
    }

    /// Transitions of one session in the order they were applied.
    pub async fn history(&self, id: &str) -> Result<Vec<SessionTransition>> {
        sqlx::query_as::<_, SessionTransition>(
            r#"
            SELECT id, session_id, from_state, to_state, at, note
            FROM demo_session_transitions
            WHERE session_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("fetching session history")
    }

    /// Delete finished sessions that ended before `cutoff`.
    pub async fn purge_ended_before(&self, cutoff: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("beginning transaction")?;

        sqlx::query(
            r#"
            DELETE FROM demo_session_transitions
            WHERE session_id IN (
                SELECT id FROM demo_sessions
                WHERE state IN ('terminated', 'error') AND ended_at IS NOT NULL AND ended_at < ?
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .context("purging session transitions")?;

        let result = sqlx::query(
            r#"
            DELETE FROM demo_sessions
            WHERE state IN ('terminated', 'error') AND ended_at IS NOT NULL AND ended_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .context("purging sessions")?;

        tx.commit().await.context("committing purge")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::session::error::is_unique_violation;
    use crate::session::models::{now_timestamp, timestamp};
    use chrono::{Duration, Utc};

    async fn repo() -> SessionRepository {
        let db = Database::in_memory().await.unwrap();
        SessionRepository::new(db.pool().clone())
    }

    fn pending(id: &str, user: &str) -> DemoSession {
        DemoSession::pending(id, "shop", user, "admin", true, &now_timestamp())
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let repo = repo().await;
        repo.insert(&pending("s1", "alice")).await.unwrap();

        let session = repo.get("s1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Pending);
        assert!(session.exclusive);
        assert!(!session.frozen);
        assert!(repo.get("missing").await.unwrap().is_none());

        let history = repo.history("s1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_state, None);
        assert_eq!(history[0].to_state, "pending");
    }

    #[tokio::test]
    async fn test_exclusive_identity_is_unique_while_active() {
        let repo = repo().await;
        repo.insert(&pending("s1", "alice")).await.unwrap();

        let err = repo.insert(&pending("s2", "alice")).await.unwrap_err();
        assert!(is_unique_violation(&err));

        // Shared sessions do not take part in the index.
        let mut shared = pending("s3", "alice");
        shared.exclusive = false;
        repo.insert(&shared).await.unwrap();

        // Once the first one fails, the identity is free again.
        let failed = TransitionPatch {
            error_message: Some("boom".into()),
            ..Default::default()
        };
        assert!(
            repo.transition("s1", SessionState::Pending, SessionState::Error, &failed, None)
                .await
                .unwrap()
        );
        repo.insert(&pending("s4", "alice")).await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let repo = repo().await;
        repo.insert(&pending("s1", "alice")).await.unwrap();
        let none = TransitionPatch::default();

        assert!(
            repo.transition("s1", SessionState::Pending, SessionState::Creating, &none, None)
                .await
                .unwrap()
        );
        // Stale expectation.
        assert!(
            !repo
                .transition("s1", SessionState::Pending, SessionState::Creating, &none, None)
                .await
                .unwrap()
        );
        // Not an edge at all.
        assert!(
            repo.transition("s1", SessionState::Creating, SessionState::Running, &none, None)
                .await
                .is_err()
        );

        let history = repo.history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_container_id_is_never_replaced() {
        let repo = repo().await;
        repo.insert(&pending("s1", "alice")).await.unwrap();

        repo.bind_container("s1", "c-first", "vitrine-shop-s1")
            .await
            .unwrap();
        let patch = TransitionPatch {
            container_id: Some("c-second".into()),
            ..Default::default()
        };
        repo.transition("s1", SessionState::Pending, SessionState::Creating, &patch, None)
            .await
            .unwrap();

        let session = repo.get("s1").await.unwrap().unwrap();
        assert_eq!(session.container_id.as_deref(), Some("c-first"));
    }

    #[tokio::test]
    async fn test_idle_guard_blocks_refreshed_session() {
        let repo = repo().await;
        let old = timestamp(Utc::now() - Duration::minutes(30));
        let mut session = pending("s1", "alice");
        session.last_activity_at = old.clone();
        repo.insert(&session).await.unwrap();

        let cutoff = timestamp(Utc::now() - Duration::minutes(10));
        assert_eq!(repo.list_idle(&cutoff).await.unwrap().len(), 1);

        // Heartbeat lands after the listing.
        assert!(repo.touch("s1", &now_timestamp()).await.unwrap());

        let guarded = TransitionPatch {
            idle_before: Some(cutoff.clone()),
            ..Default::default()
        };
        assert!(
            !repo
                .transition("s1", SessionState::Pending, SessionState::Error, &guarded, None)
                .await
                .unwrap()
        );
        assert!(repo.list_idle(&cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_and_purge() {
        let repo = repo().await;
        let start = Utc::now() - Duration::days(3);

        let mut done = pending("s1", "alice");
        done.state = SessionState::Terminated;
        done.started_at = Some(timestamp(start));
        done.ended_at = Some(timestamp(start + Duration::seconds(120)));
        repo.insert(&done).await.unwrap();
        repo.insert(&pending("s2", "bob")).await.unwrap();

        let (total, active, ended) = repo.aggregate().await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(active, 1);
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].duration_seconds(), Some(120.0));

        let cutoff = timestamp(Utc::now() - Duration::days(1));
        assert_eq!(repo.purge_ended_before(&cutoff).await.unwrap(), 1);
        assert!(repo.get("s1").await.unwrap().is_none());
        assert!(repo.history("s1").await.unwrap().is_empty());
        assert!(repo.get("s2").await.unwrap().is_some());
        assert_eq!(
            repo.live_session_ids().await.unwrap(),
            HashSet::from(["s2".to_string()])
        );
    }
}
