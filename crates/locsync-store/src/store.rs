//! Main store implementation.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::{debug, info};

use locsync_types::{Settings, millis_id, parse_timestamp_id, unix_millis};

use crate::error::{Error, Result};
use crate::models::{EventRecord, LocationRecord, ServiceStatus, keys};
use crate::schema;

/// SQLite-based store for pending records and agent settings.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

fn row_to_location(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocationRecord> {
    Ok(LocationRecord {
        id: row.get(0)?,
        access_token: row.get(1)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        other_data: row.get(4)?,
        create_date: row.get(5)?,
    })
}

const LOCATION_COLUMNS: &str = "id, access_token, latitude, longitude, other_data, create_date";

// Location record operations
impl Store {
    /// Append a record to the pending sequence.
    ///
    /// No deduplication is performed; two records with the same identifier
    /// are both kept.
    pub fn append(&self, record: &LocationRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO locations (id, access_token, latitude, longitude, other_data, create_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.id,
                record.access_token,
                record.latitude,
                record.longitude,
                record.other_data,
                record.create_date,
            ],
        )?;
        debug!("Appended location record {}", record.id);
        Ok(())
    }

    /// All pending records in insertion order.
    pub fn list(&self) -> Result<Vec<LocationRecord>> {
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations ORDER BY seq ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([], row_to_location)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// The oldest `n` pending records, in insertion order.
    pub fn first_n(&self, n: usize) -> Result<Vec<LocationRecord>> {
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations ORDER BY seq ASC LIMIT ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([n as i64], row_to_location)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// The most recently appended record.
    pub fn latest(&self) -> Result<Option<LocationRecord>> {
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations ORDER BY seq DESC LIMIT 1");
        let record = self
            .conn
            .query_row(&sql, [], row_to_location)
            .optional()?;
        Ok(record)
    }

    /// Remove every record whose identifier is in `ids`.
    ///
    /// Returns the number of records removed. Identifiers that are not
    /// pending are ignored, so repeating a call removes nothing further.
    pub fn remove_by_ids<S: AsRef<str>>(&self, ids: &[S]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM locations WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute([id.as_ref()])?;
            }
        }
        tx.commit()?;

        info!("Removed {} uploaded location record(s)", removed);
        Ok(removed)
    }

    /// Number of pending records.
    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM locations", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Delete all pending records.
    pub fn clear_locations(&self) -> Result<usize> {
        let removed = self.conn.execute("DELETE FROM locations", [])?;
        info!("Cleared {} pending location record(s)", removed);
        Ok(removed)
    }
}

// Settings operations
impl Store {
    /// Replace the host-supplied settings as a whole.
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let interval = settings
            .sample_interval_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-1".to_string());

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)")?;
            stmt.execute([keys::API_URL, settings.api_base_url.as_str()])?;
            stmt.execute([keys::ACCESS_TOKEN, settings.access_token.as_str()])?;
            stmt.execute([keys::TRACKING_FREQUENCY_MS, interval.as_str()])?;
        }
        tx.commit()?;

        info!(
            "Saved settings (api_url={}, interval={})",
            settings.api_base_url, interval
        );
        Ok(())
    }

    /// Load the host-supplied settings, if `initialize` has stored them.
    pub fn load_settings(&self) -> Result<Option<Settings>> {
        let api_base_url = self.get_setting(keys::API_URL)?;
        let access_token = self.get_setting(keys::ACCESS_TOKEN)?;

        let (Some(api_base_url), Some(access_token)) = (api_base_url, access_token) else {
            return Ok(None);
        };

        let sample_interval_ms = match self.get_setting(keys::TRACKING_FREQUENCY_MS)? {
            Some(raw) => {
                let value: i64 = raw.parse().map_err(|_| Error::CorruptValue {
                    key: keys::TRACKING_FREQUENCY_MS.to_string(),
                    value: raw.clone(),
                })?;
                u64::try_from(value).ok()
            }
            None => None,
        };

        Ok(Some(Settings {
            api_base_url,
            access_token,
            sample_interval_ms,
        }))
    }

    /// Read a single setting.
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Write an auxiliary setting such as the user agent or geofence state.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            [key, value],
        )?;
        Ok(())
    }

    /// Remove an auxiliary setting.
    pub fn remove_setting(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }

    /// Delete every setting.
    pub fn clear_settings(&self) -> Result<()> {
        self.conn.execute("DELETE FROM settings", [])?;
        info!("Cleared settings");
        Ok(())
    }
}

// Event operations
impl Store {
    /// Queue an audit event for upload and return the id it was stored under.
    ///
    /// An event stamped at or before the newest pending event is moved one
    /// millisecond past it, so pending event ids never repeat.
    pub fn insert_event(&self, event: &EventRecord) -> Result<String> {
        let objects = serde_json::to_string(&event.objects)?;

        let tx = self.conn.unchecked_transaction()?;
        let newest: Option<String> = tx
            .query_row(
                "SELECT id FROM events ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let newest = newest.and_then(|id| parse_timestamp_id(&id).ok().map(unix_millis));
        let id = match (parse_timestamp_id(&event.id).ok().map(unix_millis), newest) {
            (Some(requested), Some(newest)) if requested <= newest => millis_id(newest + 1),
            _ => event.id.clone(),
        };
        let create_date = if id == event.id {
            event.create_date.clone()
        } else {
            id.clone()
        };

        tx.execute(
            "INSERT INTO events (id, access_token, service, action, objects, create_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id,
                event.access_token,
                event.service,
                event.action,
                objects,
                create_date,
            ],
        )?;
        tx.commit()?;

        debug!("Recorded event {} / {} as {}", event.service, event.action, id);
        Ok(id)
    }

    /// The oldest `n` pending events.
    pub fn first_n_events(&self, n: usize) -> Result<Vec<EventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, access_token, service, action, objects, create_date
             FROM events ORDER BY seq ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([n as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, access_token, service, action, objects, create_date)| {
                let objects: serde_json::Value = serde_json::from_str(&objects)?;
                Ok::<_, Error>(EventRecord {
                    id,
                    access_token,
                    service,
                    action,
                    objects,
                    create_date,
                })
            })
            .collect()
    }

    /// Remove uploaded events by identifier.
    pub fn remove_events_by_ids<S: AsRef<str>>(&self, ids: &[S]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM events WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute([id.as_ref()])?;
            }
        }
        tx.commit()?;

        debug!("Removed {} uploaded event(s)", removed);
        Ok(removed)
    }

    /// Number of pending events.
    pub fn count_events(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

// Service status operations
impl Store {
    /// Last persisted status of a service.
    pub fn get_service_status(&self, service: &str) -> Result<Option<ServiceStatus>> {
        let row = self
            .conn
            .query_row(
                "SELECT service, status, updated_at FROM service_status WHERE service = ?1",
                [service],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(service, status, updated_at)| -> Result<ServiceStatus> {
            let updated_at = OffsetDateTime::from_unix_timestamp(updated_at).map_err(|_| {
                Error::CorruptValue {
                    key: format!("service_status.{service}.updated_at"),
                    value: updated_at.to_string(),
                }
            })?;
            Ok(ServiceStatus {
                service,
                status,
                updated_at,
            })
        })
        .transpose()
    }

    /// Persist the status of a service.
    pub fn set_service_status(&self, service: &str, status: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.conn.execute(
            "INSERT INTO service_status (service, status, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(service) DO UPDATE SET status = ?2, updated_at = ?3",
            rusqlite::params![service, status, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use locsync_types::LocationSample;

    fn record(secs: i64, lat: f64, lon: f64) -> LocationRecord {
        let ts = OffsetDateTime::from_unix_timestamp(secs).unwrap();
        LocationRecord::from_sample(&LocationSample::new(lat, lon, ts), "token")
    }

    #[test]
    fn test_open_in_memory() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.list().unwrap().is_empty());
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_append_and_list_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let first = record(1_700_000_000, 43.0731, -89.4012);
        let second = record(1_700_000_010, 43.0740, -89.4020);

        store.append(&first).unwrap();
        store.append(&second).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![first, second.clone()]);
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.latest().unwrap(), Some(second));
    }

    #[test]
    fn test_duplicate_ids_are_both_kept() {
        let store = Store::open_in_memory().unwrap();
        let a = record(1_700_000_000, 1.0, 1.0);
        let b = record(1_700_000_000, 2.0, 2.0);
        store.append(&a).unwrap();
        store.append(&b).unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_first_n_preserves_order() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            store.append(&record(1_700_000_000 + i, 0.0, 0.0)).unwrap();
        }
        let batch = store.first_n(3).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].id, "1700000000.000");
        assert_eq!(batch[2].id, "1700000002.000");
    }

    #[test]
    fn test_remove_by_ids_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..4 {
            store.append(&record(1_700_000_000 + i, 0.0, 0.0)).unwrap();
        }

        let ids = ["1700000000.000", "1700000002.000", "not-pending"];
        assert_eq!(store.remove_by_ids(&ids).unwrap(), 2);
        assert_eq!(store.count().unwrap(), 2);

        assert_eq!(store.remove_by_ids(&ids).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 2);

        let remaining: Vec<String> = store.list().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec!["1700000001.000", "1700000003.000"]);
    }

    #[test]
    fn test_remove_by_empty_ids() {
        let store = Store::open_in_memory().unwrap();
        store.append(&record(1_700_000_000, 0.0, 0.0)).unwrap();
        let none: [&str; 0] = [];
        assert_eq!(store.remove_by_ids(&none).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_settings_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_settings().unwrap().is_none());

        let settings = Settings::new("https://api.example.com/", "abc", 10_000);
        store.save_settings(&settings).unwrap();

        assert_eq!(store.load_settings().unwrap(), Some(settings));
        assert_eq!(
            store.get_setting(keys::TRACKING_FREQUENCY_MS).unwrap(),
            Some("10000".to_string())
        );
        assert_eq!(store.get_setting("missing").unwrap(), None);
    }

    #[test]
    fn test_unset_interval_is_stored_as_negative() {
        let store = Store::open_in_memory().unwrap();
        let settings = Settings {
            api_base_url: "https://api.example.com/".to_string(),
            access_token: "abc".to_string(),
            sample_interval_ms: None,
        };
        store.save_settings(&settings).unwrap();

        assert_eq!(
            store.get_setting(keys::TRACKING_FREQUENCY_MS).unwrap(),
            Some("-1".to_string())
        );
        assert_eq!(
            store.load_settings().unwrap().unwrap().sample_interval_ms,
            None
        );
    }

    #[test]
    fn test_corrupt_interval_is_an_error() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_settings(&Settings::new("https://api.example.com/", "abc", 1000))
            .unwrap();
        store
            .set_setting(keys::TRACKING_FREQUENCY_MS, "often")
            .unwrap();

        assert!(matches!(
            store.load_settings(),
            Err(Error::CorruptValue { .. })
        ));
    }

    #[test]
    fn test_clear_settings_and_locations() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_settings(&Settings::new("https://api.example.com/", "abc", 1000))
            .unwrap();
        store.set_setting(keys::USER_AGENT, "agent/1.0").unwrap();
        store.append(&record(1_700_000_000, 0.0, 0.0)).unwrap();

        store.clear_settings().unwrap();
        assert_eq!(store.clear_locations().unwrap(), 1);

        assert!(store.load_settings().unwrap().is_none());
        assert!(store.get_setting(keys::USER_AGENT).unwrap().is_none());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_events() {
        let store = Store::open_in_memory().unwrap();
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let event = EventRecord::new(
            "abc",
            "location tracking",
            "entering geofence",
            serde_json::json!({"activated_geofence_place_ids": "home"}),
            at,
        );
        store.insert_event(&event).unwrap();
        assert_eq!(store.count_events().unwrap(), 1);

        let events = store.first_n_events(10).unwrap();
        assert_eq!(events, vec![event.clone()]);

        assert_eq!(store.remove_events_by_ids(&[event.id.as_str()]).unwrap(), 1);
        assert_eq!(store.count_events().unwrap(), 0);
    }

    #[test]
    fn test_same_millisecond_events_get_distinct_ids() {
        let store = Store::open_in_memory().unwrap();
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let event = |action: &str| {
            EventRecord::new("abc", "location tracking", action, serde_json::json!({}), at)
        };

        let enter = store.insert_event(&event("entering geofence")).unwrap();
        let exit = store.insert_event(&event("exiting geofence")).unwrap();
        let again = store.insert_event(&event("entering geofence")).unwrap();
        assert_eq!(enter, "1700000000.000");
        assert_eq!(exit, "1700000000.001");
        assert_eq!(again, "1700000000.002");

        let events = store.first_n_events(10).unwrap();
        assert_eq!(events[1].id, exit);
        assert_eq!(events[1].create_date, exit);

        // An older event also lands after the newest one.
        let earlier = EventRecord::new(
            "abc",
            "monitoring",
            "status",
            serde_json::json!({}),
            at - time::Duration::seconds(5),
        );
        assert_eq!(store.insert_event(&earlier).unwrap(), "1700000000.003");

        assert_eq!(store.remove_events_by_ids(&[enter.as_str()]).unwrap(), 1);
        assert_eq!(store.count_events().unwrap(), 3);
    }

    #[test]
    fn test_service_status() {
        let store = Store::open_in_memory().unwrap();
        assert!(
            store
                .get_service_status("location_monitoring")
                .unwrap()
                .is_none()
        );

        store
            .set_service_status("location_monitoring", "gps enabled")
            .unwrap();
        store
            .set_service_status("location_monitoring", "gps not enabled")
            .unwrap();

        let status = store
            .get_service_status("location_monitoring")
            .unwrap()
            .unwrap();
        assert_eq!(status.status, "gps not enabled");
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("locsync.db");

        {
            let store = Store::open(&path).unwrap();
            store.append(&record(1_700_000_000, 1.0, 2.0)).unwrap();
        }

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }
}
