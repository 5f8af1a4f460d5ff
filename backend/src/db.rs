//! Telemetry store: sensors and their append-only readings in SQLite.
//!
//! Three read shapes are served from two indexes on `readings`:
//! `(sensor_id, ts DESC)` answers "latest for one sensor", the grouped fleet query and
//! sensor scoped ranges, `(ts)` answers fleet wide ranges.

use crate::error::{Result, StoreError};
use crate::schema::*;
use crate::utils::{to_millis, to_millis_ceil};
use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::{Sqlite, SqliteConnection};
use diesel::{prelude::*, sql_query};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{debug, info};

pub mod models;

use models::{NewReading, NewSensor, Reading, Sensor, SensorChanges};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Hard ceiling for a single range query.
pub const MAX_RANGE_LIMIT: i64 = airiq_common::req::MAX_RANGE_LIMIT;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Latest reading per sensor in one pass: `max(ts)` per sensor, then the highest id
/// among the rows sharing that maximum, joined back to the full row.
const LATEST_FOR_FLEET: &str = "
    SELECT r.id, r.sensor_id, r.ts, r.pm25, r.pm10, r.co2, r.no2, r.temp_c, r.rh,
           r.battery, r.firmware, r.raw_json
    FROM readings r
    JOIN (
        SELECT g.sensor_id, MAX(g.id) AS id
        FROM readings g
        JOIN (
            SELECT sensor_id, MAX(ts) AS max_ts
            FROM readings
            GROUP BY sensor_id
        ) m ON g.sensor_id = m.sensor_id AND g.ts = m.max_ts
        GROUP BY g.sensor_id
    ) latest ON r.id = latest.id
    ORDER BY r.sensor_id ASC";

#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            "#,
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeFilter {
    pub sensor_id: Option<String>,
    pub start: Option<DateTime<Utc>>, // inclusive
    pub end: Option<DateTime<Utc>>,   // inclusive
    pub limit: i64,
}

/// Handle to the backing database. Cloning shares the pool.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    pub fn connect(database_url: &str, pool_size: u32) -> Result<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)?;

        let store = Self { pool };
        store.with_conn(|conn| Ok(conn.batch_execute("PRAGMA journal_mode = WAL;")?))?;
        store.migrate()?;
        info!("store ready at {database_url} (pool size {pool_size})");
        Ok(store)
    }

    /// A private in-memory database. Every connection to `:memory:` is its own database,
    /// so the pool holds exactly one connection that never expires.
    pub fn open_in_memory() -> Result<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)?;

        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            let applied = conn
                .run_pending_migrations(MIGRATIONS)
                .map_err(|err| StoreError::StorageUnavailable(format!("migration failed: {err}")))?;
            for version in applied {
                info!("applied migration {version}");
            }
            Ok(())
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> Result<T>) -> Result<T> {
        let mut conn = self.pool.get()?;
        f(&mut conn)
    }

    /// Runs `f` on the blocking thread pool so async callers are never stalled by I/O.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|err| StoreError::StorageUnavailable(format!("store worker failed: {err}")))?
    }

    pub fn get_sensor(&self, id: &str) -> Result<Option<Sensor>> {
        self.with_conn(|conn| find_sensor(conn, id))
    }

    pub fn list_sensors(&self) -> Result<Vec<Sensor>> {
        self.with_conn(|conn| {
            Ok(sensors::table
                .order(sensors::id.asc())
                .load::<Sensor>(conn)?)
        })
    }

    /// Creates the sensor unless a row with its id exists; either way returns the stored row.
    /// Concurrent callers for the same new id all observe the single winning row.
    pub fn upsert_sensor_if_absent(&self, new: &NewSensor) -> Result<Sensor> {
        self.with_conn(|conn| {
            conn.immediate_transaction::<_, StoreError, _>(|conn| insert_sensor_if_absent(conn, new))
        })
    }

    pub fn patch_sensor(&self, id: &str, changes: &SensorChanges) -> Result<Sensor> {
        self.with_conn(|conn| {
            conn.immediate_transaction::<_, StoreError, _>(|conn| {
                if !changes.is_empty() {
                    let updated = diesel::update(sensors::table.find(id))
                        .set(changes)
                        .execute(conn)?;
                    if updated == 0 {
                        return Err(StoreError::NotFound(format!("sensor {id}")));
                    }
                    debug!("patched sensor {id}: {changes:?}");
                }
                find_sensor(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("sensor {id}")))
            })
        })
    }

    pub fn insert_reading(&self, new: &NewReading) -> Result<Reading> {
        self.with_conn(|conn| {
            conn.immediate_transaction::<_, StoreError, _>(|conn| append_reading(conn, new))
        })
    }

    /// Sensor upsert and reading insert as one unit: either both are visible or neither.
    pub fn append(&self, sensor: &NewSensor, reading: &NewReading) -> Result<(Sensor, Reading)> {
        self.with_conn(|conn| {
            conn.immediate_transaction::<_, StoreError, _>(|conn| {
                let sensor = insert_sensor_if_absent(conn, sensor)?;
                let reading = append_reading(conn, reading)?;
                Ok((sensor, reading))
            })
        })
    }

    /// Reading with the greatest `ts`; ties go to the most recently inserted row.
    pub fn latest_for_sensor(&self, sensor_id: &str) -> Result<Option<Reading>> {
        self.with_conn(|conn| {
            Ok(readings::table
                .filter(readings::sensor_id.eq(sensor_id))
                .order((readings::ts.desc(), readings::id.desc()))
                .first::<Reading>(conn)
                .optional()?)
        })
    }

    /// One reading per sensor that has any, ordered by sensor id.
    pub fn latest_for_fleet(&self) -> Result<Vec<Reading>> {
        self.with_conn(|conn| Ok(sql_query(LATEST_FOR_FLEET).load::<Reading>(conn)?))
    }

    /// Readings in `[start, end]`, oldest first. The limit is clamped to `1..=MAX_RANGE_LIMIT`.
    ///
    /// Stored timestamps are whole milliseconds, so a sub-millisecond `start` rounds up and
    /// `end` rounds down; a row is returned only if its stored instant lies in the window.
    pub fn range_query(&self, filter: &RangeFilter) -> Result<Vec<Reading>> {
        let limit = filter.limit.clamp(1, MAX_RANGE_LIMIT);
        self.with_conn(|conn| {
            let mut query: readings::BoxedQuery<'_, Sqlite> = readings::table.into_boxed();
            if let Some(sensor_id) = &filter.sensor_id {
                query = query.filter(readings::sensor_id.eq(sensor_id));
            }
            if let Some(start) = filter.start {
                query = query.filter(readings::ts.ge(to_millis_ceil(start)));
            }
            if let Some(end) = filter.end {
                query = query.filter(readings::ts.le(to_millis(end)));
            }
            Ok(query
                .order((readings::ts.asc(), readings::id.asc()))
                .limit(limit)
                .load::<Reading>(conn)?)
        })
    }

    pub fn count_readings(&self, sensor_id: Option<&str>) -> Result<i64> {
        self.with_conn(|conn| {
            let count: i64 = match sensor_id {
                Some(sensor_id) => readings::table
                    .filter(readings::sensor_id.eq(sensor_id))
                    .count()
                    .get_result(conn)?,
                None => readings::table.count().get_result(conn)?,
            };
            Ok(count)
        })
    }
}

fn find_sensor(conn: &mut SqliteConnection, id: &str) -> Result<Option<Sensor>> {
    Ok(sensors::table.find(id).first::<Sensor>(conn).optional()?)
}

fn insert_sensor_if_absent(conn: &mut SqliteConnection, new: &NewSensor) -> Result<Sensor> {
    let inserted = diesel::insert_into(sensors::table)
        .values(new)
        .on_conflict(sensors::id)
        .do_nothing()
        .execute(conn)?;
    if inserted > 0 {
        info!("registered sensor {}", new.id);
    }
    find_sensor(conn, &new.id)?.ok_or_else(|| StoreError::NotFound(format!("sensor {}", new.id)))
}

fn append_reading(conn: &mut SqliteConnection, new: &NewReading) -> Result<Reading> {
    diesel::insert_into(readings::table)
        .values(new)
        .execute(conn)
        .map_err(|err| match err {
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => {
                StoreError::NotFound(format!("sensor {}", new.sensor_id))
            }
            other => other.into(),
        })?;

    // the surrounding write transaction keeps other writers out, so the newest id is ours
    let reading = readings::table
        .order(readings::id.desc())
        .first::<Reading>(conn)?;
    debug!("stored reading {} for {}", reading.id, reading.sensor_id);
    Ok(reading)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn store() -> Store {
        Store::open_in_memory().expect("open in-memory store")
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, day, hour, 0, 0).unwrap()
    }

    fn reading(sensor_id: &str, ts: DateTime<Utc>, pm25: Option<f64>) -> NewReading {
        NewReading {
            sensor_id: sensor_id.to_string(),
            ts: to_millis(ts),
            pm25,
            raw_json: "{}".to_string(),
            ..Default::default()
        }
    }

    fn append(store: &Store, sensor_id: &str, ts: DateTime<Utc>, pm25: Option<f64>) -> Reading {
        let (_, stored) = store
            .append(&NewSensor::with_id(sensor_id, 0), &reading(sensor_id, ts, pm25))
            .expect("append");
        stored
    }

    #[test]
    fn test_schema_has_indexes() {
        let store = store();
        let names: Vec<String> = store
            .with_conn(|conn| {
                #[derive(QueryableByName)]
                struct Name {
                    #[diesel(sql_type = diesel::sql_types::Text)]
                    name: String,
                }
                let rows = sql_query(
                    "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'readings'",
                )
                .load::<Name>(conn)?;
                Ok(rows.into_iter().map(|row| row.name).collect())
            })
            .expect("list indexes");
        assert!(names.contains(&"readings_sensor_id_ts".to_string()));
        assert!(names.contains(&"readings_ts".to_string()));
    }

    #[test]
    fn test_get_unknown_sensor() {
        assert_eq!(store().get_sensor("nope").expect("get"), None);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = store();
        let mut first = NewSensor::with_id("S1", 1_000);
        first.name = Some("Hall".to_string());
        let created = store.upsert_sensor_if_absent(&first).expect("first upsert");

        let mut second = NewSensor::with_id("S1", 2_000);
        second.name = Some("Other".to_string());
        second.status = "retired".to_string();
        let existing = store.upsert_sensor_if_absent(&second).expect("second upsert");

        assert_eq!(created, existing);
        assert_eq!(existing.name.as_deref(), Some("Hall"));
        assert_eq!(existing.installed_at, 1_000);
        assert_eq!(existing.status, "active");
        assert_eq!(store.list_sensors().expect("list").len(), 1);
    }

    #[test]
    fn test_upsert_surfaces_constraint_errors() {
        let store = store();
        let mut blank = NewSensor::with_id("S1", 0);
        blank.status = String::new();
        assert!(matches!(
            store.upsert_sensor_if_absent(&blank),
            Err(StoreError::Database(_))
        ));
        assert_eq!(store.get_sensor("S1").expect("get"), None);
    }

    #[test]
    fn test_concurrent_upserts_create_one_sensor() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("race.db");
        let store = Store::connect(path.to_str().expect("utf-8 path"), 8).expect("file store");

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store
                        .append(
                            &NewSensor::with_id("RACE", i),
                            &reading("RACE", at(1, 10), Some(i as f64)),
                        )
                        .expect("append")
                })
            })
            .collect();
        let results: Vec<(Sensor, Reading)> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();

        let winner = &results[0].0;
        assert!(results.iter().all(|(sensor, _)| sensor == winner));
        assert_eq!(store.list_sensors().expect("list"), vec![winner.clone()]);
        assert_eq!(store.count_readings(Some("RACE")).expect("count"), 16);
    }

    #[test]
    fn test_patch_only_touches_supplied_fields() {
        let store = store();
        let mut new = NewSensor::with_id("S1", 5);
        new.name = Some("Hall".to_string());
        new.location_label = Some("Lobby".to_string());
        store.upsert_sensor_if_absent(&new).expect("upsert");

        let changes = SensorChanges {
            lat: Some(Some(32.7)),
            location_label: Some(None),
            status: Some("maintenance".to_string()),
            ..Default::default()
        };
        let patched = store.patch_sensor("S1", &changes).expect("patch");

        assert_eq!(patched.name.as_deref(), Some("Hall"));
        assert_eq!(patched.lat, Some(32.7));
        assert_eq!(patched.lon, None);
        assert_eq!(patched.location_label, None);
        assert_eq!(patched.status, "maintenance");
        assert_eq!(patched.installed_at, 5);
    }

    #[test]
    fn test_patch_unknown_sensor() {
        let store = store();
        let changes = SensorChanges {
            name: Some(Some("x".to_string())),
            ..Default::default()
        };
        assert!(matches!(
            store.patch_sensor("ghost", &changes),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.patch_sensor("ghost", &SensorChanges::default()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_reading_requires_sensor() {
        let store = store();
        assert!(matches!(
            store.insert_reading(&reading("ghost", at(1, 0), None)),
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.count_readings(None).expect("count"), 0);
    }

    #[test]
    fn test_readings_are_immutable() {
        let store = store();
        let stored = append(&store, "S1", at(1, 10), Some(10.0));

        let update = store.with_conn(|conn| {
            Ok(diesel::update(readings::table.find(stored.id))
                .set(readings::pm25.eq(99.0))
                .execute(conn)?)
        });
        assert!(matches!(update, Err(StoreError::Database(_))));

        let latest = store.latest_for_sensor("S1").expect("latest");
        assert_eq!(latest, Some(stored));
    }

    #[test]
    fn test_latest_for_sensor_follows_ts_not_insert_order() {
        let store = store();
        assert_eq!(store.latest_for_sensor("S1").expect("empty"), None);

        append(&store, "S1", at(1, 10), Some(10.0));
        let eleven = append(&store, "S1", at(1, 11), Some(11.0));
        append(&store, "S1", at(1, 9), Some(9.0));

        assert_eq!(store.latest_for_sensor("S1").expect("latest"), Some(eleven));
    }

    #[test]
    fn test_latest_tie_break_is_last_insert() {
        let store = store();
        append(&store, "S1", at(1, 10), Some(1.0));
        let second = append(&store, "S1", at(1, 10), Some(2.0));

        assert_eq!(store.latest_for_sensor("S1").expect("latest"), Some(second.clone()));
        assert_eq!(store.latest_for_fleet().expect("fleet"), vec![second]);
    }

    #[test]
    fn test_duplicate_ts_are_distinct_rows() {
        let store = store();
        let a = append(&store, "S1", at(1, 10), Some(1.0));
        let b = append(&store, "S1", at(1, 10), Some(1.0));
        assert_ne!(a.id, b.id);
        assert_eq!(store.count_readings(Some("S1")).expect("count"), 2);
    }

    #[test]
    fn test_fleet_omits_sensors_without_readings() {
        let store = store();
        store
            .upsert_sensor_if_absent(&NewSensor::with_id("S2", 0))
            .expect("upsert");
        append(&store, "S1", at(1, 10), Some(10.0));
        let latest = append(&store, "S1", at(1, 12), Some(12.0));

        assert_eq!(store.latest_for_fleet().expect("fleet"), vec![latest]);
    }

    #[test]
    fn test_fleet_one_per_sensor() {
        let store = store();
        let mut expected = Vec::new();
        for sensor in ["C", "A", "B"] {
            append(&store, sensor, at(2, 8), Some(5.0));
            expected.push(append(&store, sensor, at(2, 9), Some(6.0)));
            append(&store, sensor, at(1, 23), Some(7.0));
        }
        expected.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));

        assert_eq!(store.latest_for_fleet().expect("fleet"), expected);
    }

    #[test]
    fn test_range_filters_window_and_sensor() {
        let store = store();
        let origin = at(1, 0);
        // 100 readings spread over 10 days, inserted newest first
        for i in (0..100).rev() {
            append(&store, "S1", origin + Duration::minutes(144 * i), Some(i as f64));
        }
        append(&store, "S2", at(4, 0), Some(1.0));

        let start = at(4, 0);
        let end = at(6, 23);
        let filter = RangeFilter {
            sensor_id: Some("S1".to_string()),
            start: Some(start),
            end: Some(end),
            limit: 5000,
        };
        let rows = store.range_query(&filter).expect("range");

        let expected: Vec<i64> = (0..100)
            .map(|i| to_millis(origin + Duration::minutes(144 * i)))
            .filter(|ts| *ts >= to_millis(start) && *ts <= to_millis(end))
            .collect();
        assert!(!expected.is_empty());
        assert_eq!(rows.iter().map(|r| r.ts).collect::<Vec<_>>(), expected);
        assert!(rows.iter().all(|r| r.sensor_id == "S1"));
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let store = store();
        append(&store, "S1", at(1, 10), None);
        append(&store, "S1", at(1, 11), None);
        append(&store, "S1", at(1, 12), None);

        let filter = RangeFilter {
            start: Some(at(1, 10)),
            end: Some(at(1, 12)),
            limit: 10,
            ..Default::default()
        };
        assert_eq!(store.range_query(&filter).expect("range").len(), 3);
    }

    #[test]
    fn test_range_bounds_below_stored_precision() {
        let store = store();
        // stored as 10:00:00.000
        let stored = append(&store, "S1", at(1, 10) + Duration::microseconds(300), None);
        assert_eq!(stored.ts, to_millis(at(1, 10)));

        let after = RangeFilter {
            start: Some(at(1, 10) + Duration::microseconds(500)),
            limit: 10,
            ..Default::default()
        };
        assert!(store.range_query(&after).expect("range").is_empty());

        let before = RangeFilter {
            end: Some(at(1, 10) - Duration::microseconds(500)),
            limit: 10,
            ..Default::default()
        };
        assert!(store.range_query(&before).expect("range").is_empty());

        let exact = RangeFilter {
            start: Some(at(1, 10)),
            end: Some(at(1, 10) + Duration::microseconds(999)),
            limit: 10,
            ..Default::default()
        };
        assert_eq!(store.range_query(&exact).expect("range"), vec![stored]);
    }

    #[test]
    fn test_range_limit() {
        let store = store();
        for hour in 0..5 {
            append(&store, "S1", at(1, hour), None);
        }
        append(&store, "S2", at(1, 0), None);

        let limited = RangeFilter {
            limit: 2,
            ..Default::default()
        };
        let rows = store.range_query(&limited).expect("range");
        assert_eq!(rows.len(), 2);
        assert!(rows.windows(2).all(|w| w[0].ts <= w[1].ts));

        let clamped = RangeFilter {
            limit: 0,
            ..Default::default()
        };
        assert_eq!(store.range_query(&clamped).expect("range").len(), 1);
    }
}
