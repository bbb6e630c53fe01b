//! Runtime setting overrides.
//!
//! Values are stored as JSON text keyed by the dotted setting name; they
//! override the file/env defaults of `DynamicConfig`.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::params;

use super::Database;
use super::models::format_timestamp;
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Get all settings as a map
    pub fn get_all_settings(&self) -> ServiceResult<HashMap<String, serde_json::Value>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare("SELECT key, value FROM settings")
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(DatabaseError::Query)?;

        let mut settings = HashMap::new();
        for row in rows {
            let (key, raw) = row.map_err(DatabaseError::Query)?;
            match serde_json::from_str(&raw) {
                Ok(value) => {
                    settings.insert(key, value);
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "Ignoring unparseable setting"),
            }
        }

        Ok(settings)
    }

    /// Write overrides in one transaction. A null value removes the override.
    pub fn set_settings(&self, settings: &HashMap<String, serde_json::Value>) -> ServiceResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(DatabaseError::Query)?;
        let now = format_timestamp(Utc::now());

        for (key, value) in settings {
            if value.is_null() {
                tx.execute("DELETE FROM settings WHERE key = ?1", params![key])
                    .map_err(DatabaseError::Query)?;
            } else {
                let raw = serde_json::to_string(value).map_err(DatabaseError::Serialization)?;
                tx.execute(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![key, raw, now],
                )
                .map_err(DatabaseError::Query)?;
            }
        }

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_removes_override() {
        let db = Database::open_in_memory().unwrap();
        let mut settings = HashMap::new();
        settings.insert("runner.poll_interval_ms".to_string(), serde_json::json!(500));
        db.set_settings(&settings).unwrap();
        assert_eq!(
            db.get_all_settings().unwrap().get("runner.poll_interval_ms"),
            Some(&serde_json::json!(500))
        );

        settings.insert("runner.poll_interval_ms".to_string(), serde_json::Value::Null);
        db.set_settings(&settings).unwrap();
        assert!(db.get_all_settings().unwrap().is_empty());
    }
}
