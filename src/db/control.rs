// =============================================================================
// Control-plane persistence — config, audit, commands, heartbeats, models
// =============================================================================
//
// `write_system_config` performs the config mutation and its audit row inside
// one transaction: an unaudited config write cannot exist. Command claiming
// uses a conditional UPDATE on `status = 'NEW'` (the compact NEW→PROCESSED
// variant); a handler failure afterwards downgrades the row to ERROR with the
// failure reason.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::types::CommandStatus;

/// Recognized `system_config` keys.
pub mod config_keys {
    pub const HALT_TRADING: &str = "HALT_TRADING";
    pub const EMERGENCY_EXIT: &str = "EMERGENCY_EXIT";
    pub const SYMBOLS: &str = "SYMBOLS";
    pub const TIMEFRAME: &str = "TIMEFRAME";
    pub const FEATURE_VERSION: &str = "FEATURE_VERSION";
    pub const AI_MODEL_IMPL: &str = "AI_MODEL_IMPL";
}

/// One claimed control command.
#[derive(Debug, Clone)]
pub struct CommandRow {
    pub id: i64,
    pub command: String,
    pub payload: Option<String>,
    pub trace_id: String,
    pub actor: String,
    pub reason_code: Option<String>,
    pub reason: Option<String>,
}

/// A stored AI model row.
#[derive(Debug, Clone)]
pub struct ModelRow {
    pub model_name: String,
    pub version: i64,
    pub impl_tag: String,
    pub blob: String,
}

impl Database {
    // -------------------------------------------------------------------------
    // System config + audit
    // -------------------------------------------------------------------------

    /// Read one config value.
    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM system_config WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    /// Read a boolean config flag; absent keys are `false`.
    pub async fn get_config_flag(&self, key: &str) -> Result<bool> {
        Ok(self
            .get_config(key)
            .await?
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false))
    }

    /// Write one config value and its audit row in a single transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_system_config(
        &self,
        key: &str,
        value: &str,
        actor: &str,
        trace_id: &str,
        reason_code: &str,
        reason: &str,
        now_ms: i64,
    ) -> Result<()> {
        let (key, value, actor, trace_id, reason_code, reason) = (
            key.to_string(),
            value.to_string(),
            actor.to_string(),
            trace_id.to_string(),
            reason_code.to_string(),
            reason.to_string(),
        );
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let old: Option<String> = tx
                .query_row(
                    "SELECT value FROM system_config WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;

            tx.execute(
                "INSERT INTO system_config (key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, now_ms],
            )?;

            tx.execute(
                "INSERT INTO config_audit
                     (actor, action, key, old_value, new_value, trace_id,
                      reason_code, reason, created_at)
                 VALUES (?1, 'SET', ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![actor, key, old, value, trace_id, reason_code, reason, now_ms],
            )?;

            tx.commit().context("config write transaction failed")?;
            Ok(())
        })
        .await
    }

    #[cfg(test)]
    pub async fn config_audit_count(&self, key: &str) -> Result<i64> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM config_audit WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(n)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Control commands
    // -------------------------------------------------------------------------

    /// Enqueue a command; returns its id.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_control_command(
        &self,
        command: &str,
        payload: Option<&str>,
        actor: &str,
        trace_id: &str,
        reason_code: Option<&str>,
        reason: Option<&str>,
        now_ms: i64,
    ) -> Result<i64> {
        let (command, payload, actor, trace_id, reason_code, reason) = (
            command.to_string(),
            payload.map(str::to_string),
            actor.to_string(),
            trace_id.to_string(),
            reason_code.map(str::to_string),
            reason.map(str::to_string),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO control_commands
                     (command, payload, trace_id, actor, reason_code, reason,
                      status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'NEW', ?7)",
                params![command, payload, trace_id, actor, reason_code, reason, now_ms],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Claim the oldest NEW command. The conditional UPDATE transitions
    /// NEW→PROCESSED atomically; a concurrent claimer loses the race and
    /// returns `None`. Use [`Database::mark_command_error`] if applying the
    /// command subsequently fails.
    pub async fn claim_next_new_command(&self, now_ms: i64) -> Result<Option<CommandRow>> {
        self.with_conn(move |conn| {
            let row: Option<CommandRow> = conn
                .query_row(
                    "SELECT id, command, payload, trace_id, actor, reason_code, reason
                     FROM control_commands
                     WHERE status = 'NEW'
                     ORDER BY id
                     LIMIT 1",
                    [],
                    |row| {
                        Ok(CommandRow {
                            id: row.get(0)?,
                            command: row.get(1)?,
                            payload: row.get(2)?,
                            trace_id: row.get(3)?,
                            actor: row.get(4)?,
                            reason_code: row.get(5)?,
                            reason: row.get(6)?,
                        })
                    },
                )
                .optional()?;

            let Some(row) = row else { return Ok(None) };

            let claimed = conn.execute(
                "UPDATE control_commands
                 SET status = 'PROCESSED', processed_at = ?2
                 WHERE id = ?1 AND status = 'NEW'",
                params![row.id, now_ms],
            )?;

            Ok((claimed > 0).then_some(row))
        })
        .await
    }

    /// Downgrade a claimed command to ERROR with the failure reason.
    pub async fn mark_command_error(&self, id: i64, reason: &str, now_ms: i64) -> Result<()> {
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE control_commands
                 SET status = 'ERROR', reason = ?2, processed_at = ?3
                 WHERE id = ?1",
                params![id, reason, now_ms],
            )?;
            Ok(())
        })
        .await
    }

    /// Current status of one command (test and health support).
    pub async fn command_status(&self, id: i64) -> Result<Option<CommandStatus>> {
        self.with_conn(move |conn| {
            let s: Option<String> = conn
                .query_row(
                    "SELECT status FROM control_commands WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(s.as_deref().and_then(CommandStatus::parse))
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Service heartbeats
    // -------------------------------------------------------------------------

    /// UPSERT the heartbeat row for (service, instance).
    pub async fn upsert_service_status(
        &self,
        service: &str,
        instance: &str,
        status_json: &str,
        now_ms: i64,
    ) -> Result<()> {
        let (service, instance, status_json) = (
            service.to_string(),
            instance.to_string(),
            status_json.to_string(),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO service_status (service, instance, status_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(service, instance)
                 DO UPDATE SET status_json = ?3, updated_at = ?4",
                params![service, instance, status_json, now_ms],
            )?;
            Ok(())
        })
        .await
    }

    /// Latest heartbeat for one service instance.
    pub async fn service_status(
        &self,
        service: &str,
        instance: &str,
    ) -> Result<Option<(String, i64)>> {
        let (service, instance) = (service.to_string(), instance.to_string());
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT status_json, updated_at FROM service_status
                     WHERE service = ?1 AND instance = ?2",
                    params![service, instance],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // AI model store
    // -------------------------------------------------------------------------

    /// Persist a new model version and flip `is_current` to it in one
    /// transaction. Returns the new version number.
    pub async fn save_model(
        &self,
        model_name: &str,
        impl_tag: &str,
        blob: &str,
        metrics_json: Option<&str>,
        now_ms: i64,
    ) -> Result<i64> {
        let (model_name, impl_tag, blob, metrics_json) = (
            model_name.to_string(),
            impl_tag.to_string(),
            blob.to_string(),
            metrics_json.map(str::to_string),
        );
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let version: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM ai_models
                 WHERE model_name = ?1",
                params![model_name],
                |row| row.get(0),
            )?;

            tx.execute(
                "UPDATE ai_models SET is_current = 0 WHERE model_name = ?1",
                params![model_name],
            )?;
            tx.execute(
                "INSERT INTO ai_models
                     (model_name, version, impl_tag, metrics_json, blob,
                      is_current, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                params![model_name, version, impl_tag, metrics_json, blob, now_ms],
            )?;

            tx.commit().context("model save transaction failed")?;
            Ok(version)
        })
        .await
    }

    /// The current model row for `model_name`, if any.
    pub async fn load_current_model(&self, model_name: &str) -> Result<Option<ModelRow>> {
        let model_name = model_name.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT model_name, version, impl_tag, blob FROM ai_models
                     WHERE model_name = ?1 AND is_current = 1",
                    params![model_name],
                    |row| {
                        Ok(ModelRow {
                            model_name: row.get(0)?,
                            version: row.get(1)?,
                            impl_tag: row.get(2)?,
                            blob: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }
}
