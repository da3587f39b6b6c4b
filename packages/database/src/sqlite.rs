//! `SQLite`-backed [`Store`] built on `switchy_database`.
//!
//! Timestamps are stored as fixed-width RFC 3339 text and booleans as
//! integers. Status changes are conditional `UPDATE`s whose affected-row
//! count is the compare-and-swap result.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use async_trait::async_trait;
use bloodlink_blood_models::{BloodType, DonationStatus, Urgency};
use bloodlink_database_models::{
    AlertRecord, AlertStatus, BloodRequest, DonationRecord, DonorLocation, DonorStats,
    HealthConditions, HealthProfile, RequestStatus,
};
use chrono::{DateTime, SecondsFormat, Utc};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseError, DatabaseValue, Row};
use switchy_database_connection::init_sqlite_rusqlite;
use uuid::Uuid;

use crate::{AcceptOutcome, DbError, Store};

/// A [`Store`] persisted in a `SQLite` file.
pub struct SqliteStore {
    db: Box<dyn Database>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and ensures the schema
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the file cannot be created or the schema DDL
    /// fails.
    pub async fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db =
            init_sqlite_rusqlite(Some(path)).map_err(|e| DbError::Connection(e.to_string()))?;

        ensure_schema(db.as_ref()).await?;
        log::info!("Opened bloodlink database at {}", path.display());

        Ok(Self { db })
    }

    /// Opens the database named by `DATABASE_PATH`, falling back to
    /// [`crate::DEFAULT_DB_PATH`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the database cannot be opened.
    pub async fn open_from_env() -> Result<Self, DbError> {
        let path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| crate::DEFAULT_DB_PATH.to_string());
        Self::open(Path::new(&path)).await
    }
}

/// Creates all tables if they don't already exist.
#[allow(clippy::too_many_lines)]
async fn ensure_schema(db: &dyn Database) -> Result<(), DbError> {
    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS donor_locations (
            donor_id    TEXT PRIMARY KEY,
            latitude    REAL NOT NULL,
            longitude   REAL NOT NULL,
            status      TEXT NOT NULL DEFAULT 'available',
            is_visible  INTEGER NOT NULL DEFAULT 1,
            last_active TEXT NOT NULL
        )",
    )
    .await?;

    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS health_profiles (
            user_id            TEXT PRIMARY KEY,
            blood_type         TEXT NOT NULL,
            has_infections     INTEGER NOT NULL DEFAULT 0,
            has_hypertension   INTEGER NOT NULL DEFAULT 0,
            has_diabetes       INTEGER NOT NULL DEFAULT 0,
            recent_surgeries   INTEGER NOT NULL DEFAULT 0,
            surgery_date       TEXT,
            last_donation_date TEXT,
            donation_frequency INTEGER NOT NULL DEFAULT 0,
            is_eligible        INTEGER,
            updated_at         TEXT NOT NULL
        )",
    )
    .await?;

    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS blood_requests (
            id                TEXT PRIMARY KEY,
            recipient_id      TEXT NOT NULL,
            blood_type_needed TEXT NOT NULL,
            urgency           TEXT NOT NULL DEFAULT 'medium',
            units_needed      INTEGER NOT NULL CHECK (units_needed >= 1),
            latitude          REAL NOT NULL,
            longitude         REAL NOT NULL,
            location_name     TEXT,
            contact_phone     TEXT,
            notes             TEXT,
            status            TEXT NOT NULL DEFAULT 'active',
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL,
            expires_at        TEXT NOT NULL,
            CHECK (expires_at > created_at)
        )",
    )
    .await?;

    db.exec_raw(
        "CREATE INDEX IF NOT EXISTS idx_blood_requests_status
         ON blood_requests (status, created_at)",
    )
    .await?;

    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS sos_alerts (
            id              TEXT PRIMARY KEY,
            request_id      TEXT NOT NULL REFERENCES blood_requests(id) ON DELETE CASCADE,
            donor_id        TEXT NOT NULL,
            round           INTEGER NOT NULL,
            distance_meters REAL NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            created_at      TEXT NOT NULL,
            notified_at     TEXT,
            responded_at    TEXT,
            UNIQUE (request_id, donor_id)
        )",
    )
    .await?;

    db.exec_raw(
        "CREATE INDEX IF NOT EXISTS idx_sos_alerts_request
         ON sos_alerts (request_id, round)",
    )
    .await?;

    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS donation_history (
            id            TEXT PRIMARY KEY,
            donor_id      TEXT NOT NULL,
            recipient_id  TEXT,
            request_id    TEXT,
            units_donated INTEGER NOT NULL DEFAULT 1,
            hospital_name TEXT,
            donation_date TEXT NOT NULL
        )",
    )
    .await?;

    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS donor_stats (
            donor_id           TEXT PRIMARY KEY,
            total_donations    INTEGER NOT NULL DEFAULT 0,
            lives_saved        INTEGER NOT NULL DEFAULT 0,
            last_donation_date TEXT
        )",
    )
    .await?;

    // Enable foreign key enforcement (SQLite has it off by default)
    db.exec_raw("PRAGMA foreign_keys = ON").await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

fn uuid_value(id: Uuid) -> DatabaseValue {
    DatabaseValue::String(id.to_string())
}

/// Fixed-width UTC text, so SQL string comparison orders timestamps.
fn time_value(at: DateTime<Utc>) -> DatabaseValue {
    DatabaseValue::String(at.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

fn opt_time_value(at: Option<DateTime<Utc>>) -> DatabaseValue {
    at.map_or(DatabaseValue::Null, time_value)
}

fn opt_string_value(s: Option<&String>) -> DatabaseValue {
    s.map_or(DatabaseValue::Null, |s| DatabaseValue::String(s.clone()))
}

fn bool_value(b: bool) -> DatabaseValue {
    DatabaseValue::Int64(i64::from(b))
}

fn parse_uuid(raw: &str, column: &str) -> Result<Uuid, DbError> {
    Uuid::parse_str(raw).map_err(|e| DbError::Conversion {
        message: format!("Invalid uuid in {column}: {e}"),
    })
}

fn parse_time(raw: &str, column: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Conversion {
            message: format!("Invalid timestamp in {column}: {e}"),
        })
}

fn parse_enum<T: std::str::FromStr>(raw: &str, column: &str) -> Result<T, DbError> {
    raw.parse().map_err(|_| DbError::Conversion {
        message: format!("Unknown value {raw:?} in {column}"),
    })
}

fn get_string(row: &Row, column: &str) -> Result<String, DbError> {
    row.to_value(column).map_err(|e| read_failed(column, e))
}

fn read_failed(column: &str, e: impl std::fmt::Display) -> DbError {
    DbError::Conversion {
        message: format!("Failed to read {column}: {e}"),
    }
}

fn get_opt_string(row: &Row, column: &str) -> Result<Option<String>, DbError> {
    row.to_value(column).map_err(|e| read_failed(column, e))
}

fn get_uuid(row: &Row, column: &str) -> Result<Uuid, DbError> {
    parse_uuid(&get_string(row, column)?, column)
}

fn get_opt_uuid(row: &Row, column: &str) -> Result<Option<Uuid>, DbError> {
    get_opt_string(row, column)?
        .map(|raw| parse_uuid(&raw, column))
        .transpose()
}

fn get_time(row: &Row, column: &str) -> Result<DateTime<Utc>, DbError> {
    parse_time(&get_string(row, column)?, column)
}

fn get_opt_time(row: &Row, column: &str) -> Result<Option<DateTime<Utc>>, DbError> {
    get_opt_string(row, column)?
        .map(|raw| parse_time(&raw, column))
        .transpose()
}

fn get_bool(row: &Row, column: &str) -> Result<bool, DbError> {
    let raw: i64 = row.to_value(column).map_err(|e| read_failed(column, e))?;
    Ok(raw != 0)
}

fn get_opt_bool(row: &Row, column: &str) -> Result<Option<bool>, DbError> {
    let raw: Option<i64> = row.to_value(column).map_err(|e| read_failed(column, e))?;
    Ok(raw.map(|v| v != 0))
}

fn get_u32(row: &Row, column: &str) -> Result<u32, DbError> {
    let raw: i64 = row.to_value(column).map_err(|e| read_failed(column, e))?;
    u32::try_from(raw).map_err(|e| DbError::Conversion {
        message: format!("Out of range value {raw} in {column}: {e}"),
    })
}

fn get_f64(row: &Row, column: &str) -> Result<f64, DbError> {
    row.to_value(column).map_err(|e| read_failed(column, e))
}

/// Builds `$start, $start+1, ...` placeholders for an `IN (...)` list.
fn placeholders(start: usize, count: usize) -> String {
    let mut out = String::new();
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "${}", start + i);
    }
    out
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn row_to_location(row: &Row) -> Result<DonorLocation, DbError> {
    Ok(DonorLocation {
        donor_id: get_uuid(row, "donor_id")?,
        latitude: get_f64(row, "latitude")?,
        longitude: get_f64(row, "longitude")?,
        status: parse_enum::<DonationStatus>(&get_string(row, "status")?, "status")?,
        is_visible: get_bool(row, "is_visible")?,
        last_active: get_time(row, "last_active")?,
    })
}

fn row_to_profile(row: &Row) -> Result<HealthProfile, DbError> {
    Ok(HealthProfile {
        user_id: get_uuid(row, "user_id")?,
        blood_type: parse_enum::<BloodType>(&get_string(row, "blood_type")?, "blood_type")?,
        conditions: HealthConditions {
            has_infections: get_bool(row, "has_infections")?,
            has_hypertension: get_bool(row, "has_hypertension")?,
            has_diabetes: get_bool(row, "has_diabetes")?,
            recent_surgeries: get_bool(row, "recent_surgeries")?,
        },
        surgery_date: get_opt_time(row, "surgery_date")?,
        last_donation_date: get_opt_time(row, "last_donation_date")?,
        donation_frequency: get_u32(row, "donation_frequency")?,
        is_eligible: get_opt_bool(row, "is_eligible")?,
        updated_at: get_time(row, "updated_at")?,
    })
}

fn row_to_request(row: &Row) -> Result<BloodRequest, DbError> {
    Ok(BloodRequest {
        id: get_uuid(row, "id")?,
        recipient_id: get_uuid(row, "recipient_id")?,
        blood_type_needed: parse_enum::<BloodType>(
            &get_string(row, "blood_type_needed")?,
            "blood_type_needed",
        )?,
        urgency: parse_enum::<Urgency>(&get_string(row, "urgency")?, "urgency")?,
        units_needed: get_u32(row, "units_needed")?,
        latitude: get_f64(row, "latitude")?,
        longitude: get_f64(row, "longitude")?,
        location_name: get_opt_string(row, "location_name")?,
        contact_phone: get_opt_string(row, "contact_phone")?,
        notes: get_opt_string(row, "notes")?,
        status: parse_enum::<RequestStatus>(&get_string(row, "status")?, "status")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
        expires_at: get_time(row, "expires_at")?,
    })
}

fn row_to_alert(row: &Row) -> Result<AlertRecord, DbError> {
    Ok(AlertRecord {
        id: get_uuid(row, "id")?,
        request_id: get_uuid(row, "request_id")?,
        donor_id: get_uuid(row, "donor_id")?,
        round: get_u32(row, "round")?,
        distance_meters: get_f64(row, "distance_meters")?,
        status: parse_enum::<AlertStatus>(&get_string(row, "status")?, "status")?,
        created_at: get_time(row, "created_at")?,
        notified_at: get_opt_time(row, "notified_at")?,
        responded_at: get_opt_time(row, "responded_at")?,
    })
}

fn row_to_stats(row: &Row) -> Result<DonorStats, DbError> {
    Ok(DonorStats {
        donor_id: get_uuid(row, "donor_id")?,
        total_donations: get_u32(row, "total_donations")?,
        lives_saved: get_u32(row, "lives_saved")?,
        last_donation_date: get_opt_time(row, "last_donation_date")?,
    })
}

/// Column assignment applied alongside an alert status change.
const fn alert_timestamp_column(to: AlertStatus) -> Option<&'static str> {
    match to {
        AlertStatus::Notified => Some("notified_at"),
        AlertStatus::Accepted | AlertStatus::Declined => Some("responded_at"),
        _ => None,
    }
}

/// Builds the `SET` clause for an alert status change. `$1` is the new
/// status and `$2` the timestamp.
fn alert_set_clause(to: AlertStatus) -> String {
    alert_timestamp_column(to).map_or_else(
        || "status = $1".to_string(),
        |column| format!("status = $1, {column} = $2"),
    )
}

fn alert_set_params(to: AlertStatus, at: DateTime<Utc>) -> Vec<DatabaseValue> {
    let mut params = vec![DatabaseValue::String(to.as_ref().to_string())];
    if alert_timestamp_column(to).is_some() {
        params.push(time_value(at));
    }
    params
}

// ---------------------------------------------------------------------------
// Store implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_donor_location(&self, location: &DonorLocation) -> Result<bool, DbError> {
        let written = self
            .db
            .exec_raw_params(
                "INSERT INTO donor_locations
                    (donor_id, latitude, longitude, status, is_visible, last_active)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (donor_id) DO UPDATE SET
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    status = excluded.status,
                    is_visible = excluded.is_visible,
                    last_active = excluded.last_active
                 WHERE excluded.last_active >= donor_locations.last_active",
                &[
                    uuid_value(location.donor_id),
                    DatabaseValue::Real64(location.latitude),
                    DatabaseValue::Real64(location.longitude),
                    DatabaseValue::String(location.status.as_ref().to_string()),
                    bool_value(location.is_visible),
                    time_value(location.last_active),
                ],
            )
            .await?;
        Ok(written > 0)
    }

    async fn get_donor_location(&self, donor_id: Uuid) -> Result<Option<DonorLocation>, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT * FROM donor_locations WHERE donor_id = $1",
                &[uuid_value(donor_id)],
            )
            .await?;
        rows.first().map(row_to_location).transpose()
    }

    async fn list_donor_locations(&self) -> Result<Vec<DonorLocation>, DbError> {
        let rows = self
            .db
            .query_raw_params("SELECT * FROM donor_locations ORDER BY donor_id", &[])
            .await?;
        rows.iter().map(row_to_location).collect()
    }

    async fn upsert_health_profile(&self, profile: &HealthProfile) -> Result<(), DbError> {
        self.db
            .exec_raw_params(
                "INSERT INTO health_profiles (
                    user_id, blood_type, has_infections, has_hypertension,
                    has_diabetes, recent_surgeries, surgery_date,
                    last_donation_date, donation_frequency, is_eligible, updated_at
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (user_id) DO UPDATE SET
                    blood_type = excluded.blood_type,
                    has_infections = excluded.has_infections,
                    has_hypertension = excluded.has_hypertension,
                    has_diabetes = excluded.has_diabetes,
                    recent_surgeries = excluded.recent_surgeries,
                    surgery_date = excluded.surgery_date,
                    last_donation_date = excluded.last_donation_date,
                    donation_frequency = excluded.donation_frequency,
                    is_eligible = excluded.is_eligible,
                    updated_at = excluded.updated_at",
                &[
                    uuid_value(profile.user_id),
                    DatabaseValue::String(profile.blood_type.as_ref().to_string()),
                    bool_value(profile.conditions.has_infections),
                    bool_value(profile.conditions.has_hypertension),
                    bool_value(profile.conditions.has_diabetes),
                    bool_value(profile.conditions.recent_surgeries),
                    opt_time_value(profile.surgery_date),
                    opt_time_value(profile.last_donation_date),
                    DatabaseValue::Int64(i64::from(profile.donation_frequency)),
                    profile
                        .is_eligible
                        .map_or(DatabaseValue::Null, bool_value),
                    time_value(profile.updated_at),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_health_profiles(
        &self,
        user_ids: &[Uuid],
    ) -> Result<BTreeMap<Uuid, HealthProfile>, DbError> {
        if user_ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let query = format!(
            "SELECT * FROM health_profiles WHERE user_id IN ({})",
            placeholders(1, user_ids.len())
        );
        let params: Vec<DatabaseValue> = user_ids.iter().copied().map(uuid_value).collect();
        let rows = self.db.query_raw_params(&query, &params).await?;

        rows.iter()
            .map(|row| row_to_profile(row).map(|p| (p.user_id, p)))
            .collect()
    }

    async fn insert_request(&self, request: &BloodRequest) -> Result<(), DbError> {
        if self.get_request(request.id).await?.is_some() {
            return Err(DbError::Conflict {
                message: format!("request {} already exists", request.id),
            });
        }

        self.db
            .exec_raw_params(
                "INSERT INTO blood_requests (
                    id, recipient_id, blood_type_needed, urgency, units_needed,
                    latitude, longitude, location_name, contact_phone, notes,
                    status, created_at, updated_at, expires_at
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
                &[
                    uuid_value(request.id),
                    uuid_value(request.recipient_id),
                    DatabaseValue::String(request.blood_type_needed.as_ref().to_string()),
                    DatabaseValue::String(request.urgency.as_ref().to_string()),
                    DatabaseValue::Int64(i64::from(request.units_needed)),
                    DatabaseValue::Real64(request.latitude),
                    DatabaseValue::Real64(request.longitude),
                    opt_string_value(request.location_name.as_ref()),
                    opt_string_value(request.contact_phone.as_ref()),
                    opt_string_value(request.notes.as_ref()),
                    DatabaseValue::String(request.status.as_ref().to_string()),
                    time_value(request.created_at),
                    time_value(request.updated_at),
                    time_value(request.expires_at),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<BloodRequest>, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT * FROM blood_requests WHERE id = $1",
                &[uuid_value(id)],
            )
            .await?;
        rows.first().map(row_to_request).transpose()
    }

    async fn list_requests_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<BloodRequest>, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT * FROM blood_requests WHERE status = $1 ORDER BY created_at",
                &[DatabaseValue::String(status.as_ref().to_string())],
            )
            .await?;
        rows.iter().map(row_to_request).collect()
    }

    async fn transition_request(
        &self,
        id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        if from.is_empty() {
            return Ok(false);
        }

        let query = format!(
            "UPDATE blood_requests SET status = $1, updated_at = $2
             WHERE id = $3 AND status IN ({})",
            placeholders(4, from.len())
        );
        let mut params = vec![
            DatabaseValue::String(to.as_ref().to_string()),
            time_value(at),
            uuid_value(id),
        ];
        params.extend(
            from.iter()
                .map(|s| DatabaseValue::String(s.as_ref().to_string())),
        );

        let changed = self.db.exec_raw_params(&query, &params).await?;
        Ok(changed > 0)
    }

    async fn insert_alert_round(&self, alerts: &[AlertRecord]) -> Result<(), DbError> {
        let Some(first) = alerts.first() else {
            return Ok(());
        };

        let txn = self.db.begin_transaction().await?;

        let existing = txn
            .query_raw_params(
                "SELECT donor_id FROM sos_alerts WHERE request_id = $1",
                &[uuid_value(first.request_id)],
            )
            .await?;
        let mut taken = std::collections::BTreeSet::new();
        for row in &existing {
            taken.insert(get_string(row, "donor_id")?);
        }

        for alert in alerts {
            if !taken.insert(alert.donor_id.to_string()) {
                txn.rollback().await?;
                return Err(DbError::Conflict {
                    message: format!(
                        "donor {} already alerted for request {}",
                        alert.donor_id, alert.request_id
                    ),
                });
            }

            let inserted = txn
                .exec_raw_params(
                    "INSERT INTO sos_alerts (
                        id, request_id, donor_id, round, distance_meters,
                        status, created_at, notified_at, responded_at
                     ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                    &[
                        uuid_value(alert.id),
                        uuid_value(alert.request_id),
                        uuid_value(alert.donor_id),
                        DatabaseValue::Int64(i64::from(alert.round)),
                        DatabaseValue::Real64(alert.distance_meters),
                        DatabaseValue::String(alert.status.as_ref().to_string()),
                        time_value(alert.created_at),
                        opt_time_value(alert.notified_at),
                        opt_time_value(alert.responded_at),
                    ],
                )
                .await;

            if let Err(e) = inserted {
                log::error!("Alert round insert failed, rolling back: {e}");
                txn.rollback().await?;
                return Err(DbError::Database(e));
            }
        }

        txn.commit().await?;
        Ok(())
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<AlertRecord>, DbError> {
        let rows = self
            .db
            .query_raw_params("SELECT * FROM sos_alerts WHERE id = $1", &[uuid_value(id)])
            .await?;
        rows.first().map(row_to_alert).transpose()
    }

    async fn list_alerts_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<AlertRecord>, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT * FROM sos_alerts WHERE request_id = $1
                 ORDER BY round, distance_meters",
                &[uuid_value(request_id)],
            )
            .await?;
        rows.iter().map(row_to_alert).collect()
    }

    async fn transition_alert(
        &self,
        id: Uuid,
        from: &[AlertStatus],
        to: AlertStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        if from.is_empty() {
            return Ok(false);
        }

        let mut params = alert_set_params(to, at);
        let id_slot = params.len() + 1;
        let query = format!(
            "UPDATE sos_alerts SET {} WHERE id = ${id_slot} AND status IN ({})",
            alert_set_clause(to),
            placeholders(id_slot + 1, from.len())
        );
        params.push(uuid_value(id));
        params.extend(
            from.iter()
                .map(|s| DatabaseValue::String(s.as_ref().to_string())),
        );

        let changed = self.db.exec_raw_params(&query, &params).await?;
        Ok(changed > 0)
    }

    async fn transition_request_alerts(
        &self,
        request_id: Uuid,
        from: &[AlertStatus],
        to: AlertStatus,
        at: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        if from.is_empty() {
            return Ok(0);
        }

        let mut params = alert_set_params(to, at);
        let id_slot = params.len() + 1;
        let query = format!(
            "UPDATE sos_alerts SET {} WHERE request_id = ${id_slot} AND status IN ({})",
            alert_set_clause(to),
            placeholders(id_slot + 1, from.len())
        );
        params.push(uuid_value(request_id));
        params.extend(
            from.iter()
                .map(|s| DatabaseValue::String(s.as_ref().to_string())),
        );

        Ok(self.db.exec_raw_params(&query, &params).await?)
    }

    async fn accept_alert(
        &self,
        request_id: Uuid,
        alert_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AcceptOutcome, DbError> {
        let outstanding: Vec<DatabaseValue> = AlertStatus::OUTSTANDING
            .iter()
            .map(|s| DatabaseValue::String(s.as_ref().to_string()))
            .collect();
        let txn = self.db.begin_transaction().await?;

        let result = async {
            let matched = txn
                .exec_raw_params(
                    "UPDATE blood_requests SET status = $1, updated_at = $2
                     WHERE id = $3 AND status = $4",
                    &[
                        DatabaseValue::String(RequestStatus::Matched.as_ref().to_string()),
                        time_value(at),
                        uuid_value(request_id),
                        DatabaseValue::String(RequestStatus::Active.as_ref().to_string()),
                    ],
                )
                .await?;
            if matched == 0 {
                return Ok(AcceptOutcome::RequestNotActive);
            }

            let mut params = vec![
                DatabaseValue::String(AlertStatus::Accepted.as_ref().to_string()),
                time_value(at),
                uuid_value(alert_id),
                uuid_value(request_id),
            ];
            params.extend(outstanding.iter().cloned());
            let accepted = txn
                .exec_raw_params(
                    &format!(
                        "UPDATE sos_alerts SET status = $1, responded_at = $2
                         WHERE id = $3 AND request_id = $4 AND status IN ({})",
                        placeholders(5, outstanding.len())
                    ),
                    &params,
                )
                .await?;
            if accepted == 0 {
                return Ok(AcceptOutcome::AlertClosed);
            }

            let mut params = vec![
                DatabaseValue::String(AlertStatus::Superseded.as_ref().to_string()),
                uuid_value(request_id),
            ];
            params.extend(outstanding.iter().cloned());
            let superseded = txn
                .exec_raw_params(
                    &format!(
                        "UPDATE sos_alerts SET status = $1
                         WHERE request_id = $2 AND status IN ({})",
                        placeholders(3, outstanding.len())
                    ),
                    &params,
                )
                .await?;
            Ok::<_, DatabaseError>(AcceptOutcome::Accepted { superseded })
        }
        .await;

        match result {
            Ok(outcome @ AcceptOutcome::Accepted { .. }) => {
                txn.commit().await?;
                Ok(outcome)
            }
            Ok(outcome) => {
                txn.rollback().await?;
                Ok(outcome)
            }
            Err(e) => {
                log::error!("Accepting alert {alert_id} failed, rolling back: {e}");
                txn.rollback().await?;
                Err(DbError::Database(e))
            }
        }
    }

    async fn record_donation(&self, donation: &DonationRecord) -> Result<DonorStats, DbError> {
        let txn = self.db.begin_transaction().await?;
        let lives = i64::from(donation.request_id.is_some());

        let result = async {
            txn.exec_raw_params(
                "INSERT INTO donation_history (
                    id, donor_id, recipient_id, request_id, units_donated,
                    hospital_name, donation_date
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    uuid_value(donation.id),
                    uuid_value(donation.donor_id),
                    donation
                        .recipient_id
                        .map_or(DatabaseValue::Null, uuid_value),
                    donation.request_id.map_or(DatabaseValue::Null, uuid_value),
                    DatabaseValue::Int64(i64::from(donation.units_donated)),
                    opt_string_value(donation.hospital_name.as_ref()),
                    time_value(donation.donation_date),
                ],
            )
            .await?;

            txn.exec_raw_params(
                "UPDATE health_profiles SET last_donation_date = $1, updated_at = $2
                 WHERE user_id = $3
                   AND (last_donation_date IS NULL OR last_donation_date < $4)",
                &[
                    time_value(donation.donation_date),
                    time_value(donation.donation_date),
                    uuid_value(donation.donor_id),
                    time_value(donation.donation_date),
                ],
            )
            .await?;

            txn.exec_raw_params(
                "INSERT INTO donor_stats
                    (donor_id, total_donations, lives_saved, last_donation_date)
                 VALUES ($1, 1, $2, $3)
                 ON CONFLICT (donor_id) DO UPDATE SET
                    total_donations = donor_stats.total_donations + 1,
                    lives_saved = donor_stats.lives_saved + excluded.lives_saved,
                    last_donation_date = MAX(
                        COALESCE(donor_stats.last_donation_date, ''),
                        excluded.last_donation_date
                    )",
                &[
                    uuid_value(donation.donor_id),
                    DatabaseValue::Int64(lives),
                    time_value(donation.donation_date),
                ],
            )
            .await?;

            txn.query_raw_params(
                "SELECT * FROM donor_stats WHERE donor_id = $1",
                &[uuid_value(donation.donor_id)],
            )
            .await
        }
        .await;

        match result {
            Ok(rows) => {
                txn.commit().await?;
                let row = rows.first().ok_or_else(|| DbError::Conversion {
                    message: "Failed to read donor stats after upsert".to_string(),
                })?;
                row_to_stats(row)
            }
            Err(e) => {
                log::error!("Donation record failed, rolling back: {e}");
                txn.rollback().await?;
                Err(DbError::Database(e))
            }
        }
    }

    async fn get_donor_stats(&self, donor_id: Uuid) -> Result<Option<DonorStats>, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT * FROM donor_stats WHERE donor_id = $1",
                &[uuid_value(donor_id)],
            )
            .await?;
        rows.first().map(row_to_stats).transpose()
    }
}
