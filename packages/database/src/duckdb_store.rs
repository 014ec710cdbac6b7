//! `DuckDB` implementation of the store traits.
//!
//! One file holds the `events` and `event_cells` tables, per-method
//! `actor_classifications`, polygon `units`, a `_claims` lease table and
//! one table per named result destination. Destination tables are created
//! on first write; reading a destination that does not exist yet yields
//! nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use duckdb::types::Value;
use duckdb::{Connection, params, params_from_iter};
use mobility_models::{
    ActorId, Classification, Coordinates, Event, InferenceMethod, SpatialUnit,
};
use mobility_spatial::bucket_point;

use crate::DbError;
use crate::store::{
    ActorStore, BatchReport, CellUpdate, EventFilter, EventStore, HomeFilter, ItemFailure,
    ResultRecord, ResultStore, UnitStore,
};

/// Number of rows per multi-row INSERT.
const CHUNK_SIZE: usize = 1_000;

/// Tables a destination name may not shadow.
const RESERVED_TABLES: &[&str] = &[
    "events",
    "event_cells",
    "actor_classifications",
    "units",
    "_claims",
];

/// A store backed by a single `DuckDB` connection.
pub struct DuckDbStore {
    conn: Connection,
}

impl DuckDbStore {
    /// Opens (or creates) the store at `path` and ensures the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the directory, connection or schema creation
    /// fails.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            crate::paths::ensure_dir(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "SET threads = 4;
             SET memory_limit = '1GB';",
        )?;

        log::debug!("Opened store at {}", path.display());
        Self::with_connection(conn)
    }

    /// Opens a throwaway in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema creation fails.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        create_schema(&conn)?;
        Ok(Self { conn })
    }

    /// The underlying connection, for ad-hoc queries.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Runs `f` inside a transaction, committing on success and rolling
    /// back on error.
    fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        match f(&self.conn) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    log::error!("Rollback failed after {e}: {rollback}");
                }
                Err(e)
            }
        }
    }

    fn load_events(&self, where_sql: &str, values: &[Value]) -> Result<Vec<Event>, DbError> {
        let sql = format!(
            "SELECT e.event_id, e.actor_id, e.created_at_ms, e.lon, e.lat, c.resolution, c.cell
             FROM events e
             LEFT JOIN event_cells c ON c.event_id = e.event_id
             WHERE {where_sql}
             ORDER BY e.event_id, c.resolution"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok(EventRow {
                id: row.get(0)?,
                actor_id: row.get(1)?,
                created_at_ms: row.get(2)?,
                lon: row.get(3)?,
                lat: row.get(4)?,
                resolution: row.get(5)?,
                cell: row.get(6)?,
            })
        })?;

        let mut events: Vec<Event> = Vec::new();
        for row in rows {
            let row = row?;
            if events.last().is_none_or(|e| e.id != row.id) {
                let location = match (row.lon, row.lat) {
                    (Some(lon), Some(lat)) => Some(Coordinates::new(lon, lat)),
                    _ => None,
                };
                let event =
                    Event::from_epoch_millis(row.id, row.actor_id, row.created_at_ms, location)
                        .ok_or_else(|| DbError::Conversion {
                            message: format!(
                                "event {} has out-of-range timestamp {}",
                                row.id, row.created_at_ms
                            ),
                        })?;
                events.push(event);
            }
            if let (Some(resolution), Some(cell), Some(event)) =
                (row.resolution, row.cell, events.last_mut())
            {
                event
                    .cells
                    .insert(resolution_from_sql(resolution)?, cell_from_sql(cell)?);
            }
        }

        Ok(events)
    }

    fn table_exists(&self, table: &str) -> Result<bool, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn ensure_destination(&self, table: &str) -> Result<(), DbError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                target_id TEXT NOT NULL PRIMARY KEY,
                payload TEXT
            );"
        ))?;
        Ok(())
    }

    /// The destination's table name if it exists, `None` if never written.
    fn existing_destination<'a>(&self, destination: &'a str) -> Result<Option<&'a str>, DbError> {
        let table = destination_table(destination)?;
        Ok(self.table_exists(table)?.then_some(table))
    }
}

struct EventRow {
    id: i64,
    actor_id: i64,
    created_at_ms: i64,
    lon: Option<f64>,
    lat: Option<f64>,
    resolution: Option<i32>,
    cell: Option<i64>,
}

fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            event_id BIGINT NOT NULL PRIMARY KEY,
            actor_id BIGINT NOT NULL,
            created_at_ms BIGINT NOT NULL,
            lon DOUBLE,
            lat DOUBLE
        );

        CREATE TABLE IF NOT EXISTS event_cells (
            event_id BIGINT NOT NULL,
            resolution INTEGER NOT NULL,
            cell BIGINT NOT NULL,
            PRIMARY KEY (event_id, resolution)
        );

        CREATE TABLE IF NOT EXISTS actor_classifications (
            actor_id BIGINT NOT NULL,
            method TEXT NOT NULL,
            complete BOOLEAN NOT NULL,
            reason TEXT,
            home_lon DOUBLE,
            home_lat DOUBLE,
            payload TEXT NOT NULL,
            PRIMARY KEY (actor_id, method)
        );

        CREATE TABLE IF NOT EXISTS units (
            unit_id TEXT NOT NULL PRIMARY KEY,
            kind TEXT NOT NULL,
            boundary_geojson TEXT,
            cell BIGINT
        );

        CREATE TABLE IF NOT EXISTS _claims (
            destination TEXT NOT NULL,
            target_id TEXT NOT NULL,
            worker TEXT NOT NULL,
            expires_at_ms BIGINT NOT NULL,
            PRIMARY KEY (destination, target_id)
        );",
    )?;

    Ok(())
}

/// Validates a destination name as a plain lowercase SQL identifier that
/// does not collide with the store's own tables.
fn destination_table(name: &str) -> Result<&str, DbError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 63
        && !RESERVED_TABLES.contains(&name);

    if valid {
        Ok(name)
    } else {
        Err(DbError::InvalidIdentifier {
            name: name.to_string(),
        })
    }
}

fn cell_to_sql(cell: u64) -> Result<i64, DbError> {
    i64::try_from(cell).map_err(|_| DbError::Conversion {
        message: format!("cell {cell:#x} does not fit in BIGINT"),
    })
}

fn cell_from_sql(raw: i64) -> Result<u64, DbError> {
    u64::try_from(raw).map_err(|_| DbError::Conversion {
        message: format!("stored cell {raw} is negative"),
    })
}

fn resolution_from_sql(raw: i32) -> Result<u8, DbError> {
    u8::try_from(raw).map_err(|_| DbError::Conversion {
        message: format!("stored resolution {raw} is out of range"),
    })
}

fn limit_to_sql(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn event_filter_sql(filter: &EventFilter<'_>) -> Result<(String, Vec<Value>), DbError> {
    Ok(match filter {
        EventFilter::Actor(actor_id) => ("e.actor_id = ?".to_string(), vec![Value::BigInt(*actor_id)]),
        EventFilter::WithinArea(unit) => {
            let bbox = unit.bbox();
            (
                "e.lon BETWEEN ? AND ? AND e.lat BETWEEN ? AND ?".to_string(),
                vec![
                    Value::Double(bbox.min_lon),
                    Value::Double(bbox.max_lon),
                    Value::Double(bbox.min_lat),
                    Value::Double(bbox.max_lat),
                ],
            )
        }
        EventFilter::InCell { cell, resolution } => (
            "e.event_id IN (
                SELECT event_id FROM event_cells WHERE resolution = ? AND cell = ?
            )"
            .to_string(),
            vec![
                Value::Int(i32::from(*resolution)),
                Value::BigInt(cell_to_sql(*cell)?),
            ],
        ),
        EventFilter::All => ("TRUE".to_string(), vec![]),
    })
}

impl EventStore for DuckDbStore {
    fn find_events(&self, filter: &EventFilter<'_>) -> Result<Vec<Event>, DbError> {
        let (where_sql, values) = event_filter_sql(filter)?;
        let mut events = self.load_events(&where_sql, &values)?;

        // The SQL box is only a pre-filter for polygon units.
        if let EventFilter::WithinArea(unit) = filter {
            events.retain(|e| e.location.is_some_and(|c| unit.contains_point(c)));
        }

        Ok(events)
    }

    fn count_events(&self, filter: &EventFilter<'_>) -> Result<u64, DbError> {
        if matches!(filter, EventFilter::WithinArea(_)) {
            return Ok(self.find_events(filter)?.len() as u64);
        }

        let (where_sql, values) = event_filter_sql(filter)?;
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM events e WHERE {where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        #[allow(clippy::cast_sign_loss)]
        Ok(count as u64)
    }

    fn distinct_actor_ids(&self) -> Result<Vec<ActorId>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT actor_id FROM events ORDER BY actor_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    fn cells_with_events(&self, resolution: u8) -> Result<Vec<u64>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT cell FROM event_cells WHERE resolution = ? ORDER BY cell",
        )?;
        let raw = stmt
            .query_map([i32::from(resolution)], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        raw.into_iter().map(cell_from_sql).collect()
    }

    fn events_missing_cells(
        &self,
        resolutions: &[u8],
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Event>, DbError> {
        if resolutions.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let sql = format!(
            "SELECT e.event_id FROM events e
             WHERE e.lon IS NOT NULL AND e.lat IS NOT NULL AND e.event_id > ?
               AND (
                 SELECT COUNT(*) FROM event_cells c
                 WHERE c.event_id = e.event_id AND c.resolution IN ({})
               ) < ?
             ORDER BY e.event_id
             LIMIT ?",
            placeholders(resolutions.len())
        );

        let mut values = vec![Value::BigInt(after_id.unwrap_or(i64::MIN))];
        values.extend(resolutions.iter().map(|r| Value::Int(i32::from(*r))));
        values.push(Value::BigInt(limit_to_sql(resolutions.len())));
        values.push(Value::BigInt(limit_to_sql(limit)));

        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;

        if ids.is_empty() {
            return Ok(vec![]);
        }

        let where_sql = format!("e.event_id IN ({})", placeholders(ids.len()));
        let values: Vec<Value> = ids.into_iter().map(Value::BigInt).collect();
        self.load_events(&where_sql, &values)
    }

    fn update_event_cells(&self, updates: &[CellUpdate]) -> Result<BatchReport, DbError> {
        let mut report = BatchReport::default();
        if updates.is_empty() {
            return Ok(report);
        }

        let mut exists = self
            .conn
            .prepare("SELECT COUNT(*) FROM events WHERE event_id = ?")?;
        let mut upsert = self.conn.prepare(
            "INSERT INTO event_cells (event_id, resolution, cell) VALUES (?, ?, ?)
             ON CONFLICT (event_id, resolution) DO UPDATE SET cell = EXCLUDED.cell",
        )?;

        for update in updates {
            let result = (|| -> Result<(), DbError> {
                let count: i64 = exists.query_row([update.event_id], |row| row.get(0))?;
                if count == 0 {
                    return Err(DbError::Conversion {
                        message: "no such event".to_string(),
                    });
                }
                for (resolution, cell) in &update.cells {
                    upsert.execute(params![
                        update.event_id,
                        i32::from(*resolution),
                        cell_to_sql(*cell)?
                    ])?;
                }
                Ok(())
            })();

            match result {
                Ok(()) => report.written += 1,
                Err(e) => {
                    log::warn!("Failed to write cells for event {}: {e}", update.event_id);
                    report.failures.push(ItemFailure {
                        target_id: update.event_id.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    fn insert_events(&self, events: &[Event]) -> Result<u64, DbError> {
        if events.is_empty() {
            return Ok(0);
        }

        // Keep the last occurrence of each id; a multi-row INSERT cannot
        // touch the same key twice.
        let deduped: BTreeMap<i64, &Event> = events.iter().map(|e| (e.id, e)).collect();
        if deduped.len() < events.len() {
            log::info!(
                "Deduplicated event batch: {} -> {} rows",
                events.len(),
                deduped.len()
            );
        }
        let deduped: Vec<&Event> = deduped.into_values().collect();

        self.in_transaction(|conn| {
            let mut total = 0u64;

            for chunk in deduped.chunks(CHUNK_SIZE) {
                let mut sql = String::from(
                    "INSERT INTO events (event_id, actor_id, created_at_ms, lon, lat) VALUES ",
                );
                for i in 0..chunk.len() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push_str("(?, ?, ?, ?, ?)");
                }
                sql.push_str(
                    " ON CONFLICT (event_id) DO UPDATE SET
                        actor_id = EXCLUDED.actor_id,
                        created_at_ms = EXCLUDED.created_at_ms,
                        lon = EXCLUDED.lon,
                        lat = EXCLUDED.lat",
                );

                let mut stmt = conn.prepare(&sql)?;
                let mut param_idx = 1usize;
                for event in chunk {
                    stmt.raw_bind_parameter(param_idx, event.id)?;
                    stmt.raw_bind_parameter(param_idx + 1, event.actor_id)?;
                    stmt.raw_bind_parameter(param_idx + 2, event.created_at.timestamp_millis())?;
                    stmt.raw_bind_parameter(param_idx + 3, event.location.map(|c| c.lon))?;
                    stmt.raw_bind_parameter(param_idx + 4, event.location.map(|c| c.lat))?;
                    param_idx += 5;
                }

                let rows = stmt.raw_execute()?;
                total += u64::try_from(rows).unwrap_or(0);
            }

            let mut cells = conn.prepare(
                "INSERT INTO event_cells (event_id, resolution, cell) VALUES (?, ?, ?)
                 ON CONFLICT (event_id, resolution) DO UPDATE SET cell = EXCLUDED.cell",
            )?;
            for event in &deduped {
                for (resolution, cell) in &event.cells {
                    cells.execute(params![event.id, i32::from(*resolution), cell_to_sql(*cell)?])?;
                }
            }

            Ok(total)
        })
    }
}

impl ActorStore for DuckDbStore {
    fn find_homes(
        &self,
        method: InferenceMethod,
        filter: &HomeFilter<'_>,
    ) -> Result<Vec<(ActorId, Classification)>, DbError> {
        let tag = method.tag();
        let mut queries: Vec<(String, Vec<Value>)> = Vec::new();

        match filter {
            HomeFilter::All => queries.push((String::new(), vec![])),
            HomeFilter::WithinBox(bbox) => queries.push((
                " AND home_lon BETWEEN ? AND ? AND home_lat BETWEEN ? AND ?".to_string(),
                vec![
                    Value::Double(bbox.min_lon),
                    Value::Double(bbox.max_lon),
                    Value::Double(bbox.min_lat),
                    Value::Double(bbox.max_lat),
                ],
            )),
            HomeFilter::Actors(ids) => {
                for chunk in ids.chunks(CHUNK_SIZE) {
                    queries.push((
                        format!(" AND actor_id IN ({})", placeholders(chunk.len())),
                        chunk.iter().map(|id| Value::BigInt(*id)).collect(),
                    ));
                }
            }
        }

        let mut homes = Vec::new();
        for (extra, values) in queries {
            let sql = format!(
                "SELECT actor_id, payload FROM actor_classifications
                 WHERE method = ?{extra}
                 ORDER BY actor_id"
            );
            let mut all_values = vec![Value::Text(tag.clone())];
            all_values.extend(values);

            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(all_values.iter()), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            for (actor_id, payload) in rows {
                homes.push((actor_id, serde_json::from_str(&payload)?));
            }
        }

        Ok(homes)
    }

    fn classified_actor_ids(&self, method: InferenceMethod) -> Result<BTreeSet<ActorId>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT actor_id FROM actor_classifications WHERE method = ?")?;
        let ids = stmt
            .query_map([method.tag()], |row| row.get(0))?
            .collect::<Result<BTreeSet<i64>, _>>()?;
        Ok(ids)
    }

    fn upsert_classification(
        &self,
        actor_id: ActorId,
        method: InferenceMethod,
        classification: &Classification,
    ) -> Result<(), DbError> {
        let row = ClassificationRow::new(classification)?;
        self.conn.execute(
            "INSERT INTO actor_classifications
                (actor_id, method, complete, reason, home_lon, home_lat, payload)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (actor_id, method) DO UPDATE SET
                complete = EXCLUDED.complete,
                reason = EXCLUDED.reason,
                home_lon = EXCLUDED.home_lon,
                home_lat = EXCLUDED.home_lat,
                payload = EXCLUDED.payload",
            params![
                actor_id,
                method.tag(),
                row.complete,
                row.reason,
                row.home_lon,
                row.home_lat,
                row.payload
            ],
        )?;
        Ok(())
    }

    fn insert_classifications(
        &self,
        method: InferenceMethod,
        batch: &[(ActorId, Classification)],
    ) -> Result<u64, DbError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let tag = method.tag();

        self.in_transaction(|conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO actor_classifications
                    (actor_id, method, complete, reason, home_lon, home_lat, payload)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;

            for (actor_id, classification) in batch {
                let row = ClassificationRow::new(classification)?;
                stmt.execute(params![
                    actor_id,
                    tag,
                    row.complete,
                    row.reason,
                    row.home_lon,
                    row.home_lat,
                    row.payload
                ])
                .map_err(|e| DbError::BatchRejected {
                    target_id: actor_id.to_string(),
                    message: e.to_string(),
                })?;
            }

            Ok(batch.len() as u64)
        })
    }
}

/// Flattened columns of a classification. The home center is stored
/// separately so homes can be box-filtered in SQL.
struct ClassificationRow {
    complete: bool,
    reason: Option<String>,
    home_lon: Option<f64>,
    home_lat: Option<f64>,
    payload: String,
}

impl ClassificationRow {
    fn new(classification: &Classification) -> Result<Self, DbError> {
        let home = classification.home_bucket().and_then(bucket_point);
        Ok(Self {
            complete: classification.is_complete(),
            reason: match classification {
                Classification::Incomplete { reason } => Some(reason.to_string()),
                Classification::Complete(_) => None,
            },
            home_lon: home.map(|c| c.lon),
            home_lat: home.map(|c| c.lat),
            payload: serde_json::to_string(classification)?,
        })
    }
}

impl UnitStore for DuckDbStore {
    fn area_units(&self) -> Result<Vec<SpatialUnit>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT unit_id, boundary_geojson FROM units
             WHERE kind = 'area' AND boundary_geojson IS NOT NULL
             ORDER BY unit_id",
        )?;
        let units = stmt
            .query_map([], |row| {
                Ok(SpatialUnit::Area {
                    id: row.get(0)?,
                    boundary_geojson: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(units)
    }

    fn insert_units(&self, units: &[SpatialUnit]) -> Result<u64, DbError> {
        if units.is_empty() {
            return Ok(0);
        }

        self.in_transaction(|conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO units (unit_id, kind, boundary_geojson, cell) VALUES (?, ?, ?, ?)
                 ON CONFLICT (unit_id) DO UPDATE SET
                    kind = EXCLUDED.kind,
                    boundary_geojson = EXCLUDED.boundary_geojson,
                    cell = EXCLUDED.cell",
            )?;

            let mut total = 0u64;
            for unit in units {
                let rows = match unit {
                    SpatialUnit::Area {
                        id,
                        boundary_geojson,
                    } => stmt.execute(params![id, "area", boundary_geojson, Option::<i64>::None])?,
                    SpatialUnit::Cell { cell } => stmt.execute(params![
                        unit.id(),
                        "cell",
                        Option::<&str>::None,
                        cell_to_sql(*cell)?
                    ])?,
                };
                total += u64::try_from(rows).unwrap_or(0);
            }
            Ok(total)
        })
    }
}

impl ResultStore for DuckDbStore {
    fn completed_ids(&self, destination: &str) -> Result<BTreeSet<String>, DbError> {
        let Some(table) = self.existing_destination(destination)? else {
            return Ok(BTreeSet::new());
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT target_id FROM {table} WHERE payload IS NOT NULL"
        ))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<BTreeSet<String>, _>>()?;
        Ok(ids)
    }

    fn insert_results(&self, destination: &str, records: &[ResultRecord]) -> Result<u64, DbError> {
        let table = destination_table(destination)?;
        if records.is_empty() {
            return Ok(0);
        }
        self.ensure_destination(table)?;

        self.in_transaction(|conn| {
            let mut committed = conn.prepare(&format!(
                "SELECT COUNT(*) FROM {table} WHERE target_id = ? AND payload IS NOT NULL"
            ))?;
            let mut insert = conn.prepare(&format!(
                "INSERT INTO {table} (target_id, payload) VALUES (?, ?)
                 ON CONFLICT (target_id) DO UPDATE SET payload = EXCLUDED.payload"
            ))?;

            for record in records {
                let reject = |message: String| DbError::BatchRejected {
                    target_id: record.target_id.clone(),
                    message,
                };

                let existing: i64 = committed
                    .query_row([&record.target_id], |row| row.get(0))
                    .map_err(|e| reject(e.to_string()))?;
                if existing > 0 {
                    return Err(reject("result already committed".to_string()));
                }

                let payload = serde_json::to_string(&record.payload)?;
                insert
                    .execute(params![record.target_id, payload])
                    .map_err(|e| reject(e.to_string()))?;
            }

            Ok(records.len() as u64)
        })
    }

    fn seed_targets(&self, destination: &str, target_ids: &[String]) -> Result<u64, DbError> {
        let table = destination_table(destination)?;
        self.ensure_destination(table)?;
        if target_ids.is_empty() {
            return Ok(0);
        }

        self.in_transaction(|conn| {
            let mut stmt = conn.prepare(&format!(
                "INSERT INTO {table} (target_id, payload) VALUES (?, NULL)
                 ON CONFLICT (target_id) DO NOTHING"
            ))?;
            let mut total = 0u64;
            for id in target_ids {
                let rows = stmt.execute([id])?;
                total += u64::try_from(rows).unwrap_or(0);
            }
            Ok(total)
        })
    }

    fn missing_result_ids(
        &self,
        destination: &str,
        limit: usize,
    ) -> Result<Vec<String>, DbError> {
        let Some(table) = self.existing_destination(destination)? else {
            return Ok(vec![]);
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT target_id FROM {table} WHERE payload IS NULL ORDER BY target_id LIMIT ?"
        ))?;
        let ids = stmt
            .query_map([limit_to_sql(limit)], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn count_missing(&self, destination: &str) -> Result<u64, DbError> {
        let Some(table) = self.existing_destination(destination)? else {
            return Ok(0);
        };

        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE payload IS NULL"),
            [],
            |row| row.get(0),
        )?;
        #[allow(clippy::cast_sign_loss)]
        Ok(count as u64)
    }

    fn upsert_result(&self, destination: &str, record: &ResultRecord) -> Result<(), DbError> {
        let table = destination_table(destination)?;
        self.ensure_destination(table)?;

        self.conn.execute(
            &format!(
                "INSERT INTO {table} (target_id, payload) VALUES (?, ?)
                 ON CONFLICT (target_id) DO UPDATE SET payload = EXCLUDED.payload"
            ),
            params![record.target_id, serde_json::to_string(&record.payload)?],
        )?;
        Ok(())
    }

    fn all_results(&self, destination: &str) -> Result<Vec<ResultRecord>, DbError> {
        let Some(table) = self.existing_destination(destination)? else {
            return Ok(vec![]);
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT target_id, payload FROM {table} WHERE payload IS NOT NULL ORDER BY target_id"
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(target_id, payload)| {
                Ok(ResultRecord {
                    target_id,
                    payload: serde_json::from_str(&payload)?,
                })
            })
            .collect()
    }

    fn try_claim(
        &self,
        destination: &str,
        target_ids: &[String],
        worker: &str,
        ttl: Duration,
    ) -> Result<Vec<String>, DbError> {
        destination_table(destination)?;
        if target_ids.is_empty() {
            return Ok(vec![]);
        }

        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

        // Expired claims are cleared outside the claim transaction so a
        // freed key is never deleted and re-inserted in one transaction.
        let expired = self.conn.execute(
            "DELETE FROM _claims WHERE destination = ? AND expires_at_ms <= ?",
            params![destination, now],
        )?;
        if expired > 0 {
            log::debug!("Dropped {expired} expired claims on {destination}");
        }

        self.in_transaction(|conn| {
            let mut insert = conn.prepare(
                "INSERT INTO _claims (destination, target_id, worker, expires_at_ms)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (destination, target_id) DO NOTHING",
            )?;
            let mut renew = conn.prepare(
                "UPDATE _claims SET expires_at_ms = ?
                 WHERE destination = ? AND target_id = ? AND worker = ?",
            )?;

            let mut claimed = Vec::new();
            for id in target_ids {
                let held = insert.execute(params![destination, id, worker, expires_at])? > 0
                    || renew.execute(params![expires_at, destination, id, worker])? > 0;
                if held {
                    claimed.push(id.clone());
                }
            }
            Ok(claimed)
        })
    }

    fn release_claims(&self, destination: &str, worker: &str) -> Result<u64, DbError> {
        destination_table(destination)?;
        let rows = self.conn.execute(
            "DELETE FROM _claims WHERE destination = ? AND worker = ?",
            params![destination, worker],
        )?;
        Ok(u64::try_from(rows).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use mobility_models::{HomeWork, IncompleteReason, LocationStats, SpatialBucket};
    use mobility_spatial::{BoundingBox, TargetUnit};

    use super::*;

    const SQUARE: &str = r#"{"type":"Polygon","coordinates":[[[-58.50,-34.65],[-58.40,-34.65],[-58.40,-34.55],[-58.50,-34.55],[-58.50,-34.65]]]}"#;

    fn store() -> DuckDbStore {
        DuckDbStore::open_in_memory().unwrap()
    }

    fn event(id: i64, actor_id: ActorId, lon: f64, lat: f64) -> Event {
        Event {
            id,
            actor_id,
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            location: Some(Coordinates::new(lon, lat)),
            cells: BTreeMap::new(),
        }
    }

    fn seeded() -> DuckDbStore {
        let store = store();
        store
            .insert_events(&[
                event(1, 10, -58.45, -34.60).with_cell(9, 0x089d_d687_6033_ffff),
                event(2, 10, -58.46, -34.61),
                event(3, 20, -58.35, -34.60),
                Event {
                    location: None,
                    ..event(4, 30, 0.0, 0.0)
                },
            ])
            .unwrap();
        store
    }

    fn stats(bucket: SpatialBucket) -> LocationStats {
        LocationStats {
            bucket,
            freq: 10,
            unique_hours: 3,
            hour_range: 5,
            night_freq: 4,
            weekend_freq: 2,
            freq_ratio: 1.0,
        }
    }

    fn complete(lon: f64, lat: f64) -> Classification {
        Classification::Complete(HomeWork {
            home: stats(SpatialBucket::rounded(Coordinates::new(lon, lat))),
            work: stats(SpatialBucket::rounded(Coordinates::new(-58.38, -34.60))),
            method: InferenceMethod::LatLon,
        })
    }

    #[test]
    fn loads_events_with_cells_and_missing_locations() {
        let store = seeded();
        let all = store.find_events(&EventFilter::All).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].cell(9), Some(0x089d_d687_6033_ffff));
        assert_eq!(all[3].location, None);
        assert_eq!(
            all[0].created_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn filters_events_by_actor_cell_and_area() {
        let store = seeded();
        assert_eq!(store.count_events(&EventFilter::Actor(10)).unwrap(), 2);
        assert_eq!(
            store
                .count_events(&EventFilter::InCell {
                    cell: 0x089d_d687_6033_ffff,
                    resolution: 9
                })
                .unwrap(),
            1
        );

        let unit = TargetUnit::from_unit(&SpatialUnit::Area {
            id: "square".to_string(),
            boundary_geojson: SQUARE.to_string(),
        })
        .unwrap();
        let inside = store.find_events(&EventFilter::WithinArea(&unit)).unwrap();
        let ids: Vec<i64> = inside.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn lists_distinct_actors() {
        assert_eq!(seeded().distinct_actor_ids().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn pages_events_missing_cells() {
        let store = seeded();
        let first = store.events_missing_cells(&[9], None, 1).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, 2);

        let rest = store.events_missing_cells(&[9], Some(2), 10).unwrap();
        let ids: Vec<i64> = rest.iter().map(|e| e.id).collect();
        // Event 4 has no location and is never returned.
        assert_eq!(ids, vec![3]);

        let both = store.events_missing_cells(&[9, 10], None, 10).unwrap();
        assert_eq!(both.len(), 3);
    }

    #[test]
    fn cell_updates_report_per_item_failures() {
        let store = seeded();
        let report = store
            .update_event_cells(&[
                CellUpdate {
                    event_id: 2,
                    cells: BTreeMap::from([(9, 0x089d_d687_6037_ffff)]),
                },
                CellUpdate {
                    event_id: 999,
                    cells: BTreeMap::from([(9, 0x089d_d687_6037_ffff)]),
                },
            ])
            .unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].target_id, "999");
        assert_eq!(store.cells_with_events(9).unwrap().len(), 2);
    }

    #[test]
    fn classifications_round_trip_and_filter() {
        let store = store();
        store
            .upsert_classification(1, InferenceMethod::LatLon, &complete(-58.45, -34.60))
            .unwrap();
        store
            .upsert_classification(2, InferenceMethod::LatLon, &complete(-58.30, -34.50))
            .unwrap();
        store
            .upsert_classification(
                3,
                InferenceMethod::LatLon,
                &Classification::incomplete(IncompleteReason::InsufficientData),
            )
            .unwrap();

        let all = store
            .find_homes(InferenceMethod::LatLon, &HomeFilter::All)
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].1, complete(-58.45, -34.60));

        let boxed = store
            .find_homes(
                InferenceMethod::LatLon,
                &HomeFilter::WithinBox(BoundingBox {
                    min_lon: -58.50,
                    min_lat: -34.65,
                    max_lon: -58.40,
                    max_lat: -34.55,
                }),
            )
            .unwrap();
        assert_eq!(boxed.len(), 1);
        assert_eq!(boxed[0].0, 1);

        let picked = store
            .find_homes(InferenceMethod::LatLon, &HomeFilter::Actors(&[2, 3]))
            .unwrap();
        assert_eq!(picked.len(), 2);

        let other_method = store
            .find_homes(InferenceMethod::GridCell { resolution: 9 }, &HomeFilter::All)
            .unwrap();
        assert!(other_method.is_empty());
    }

    #[test]
    fn classification_batches_are_atomic() {
        let store = store();
        store
            .insert_classifications(InferenceMethod::LatLon, &[(1, complete(-58.45, -34.60))])
            .unwrap();

        let err = store
            .insert_classifications(
                InferenceMethod::LatLon,
                &[(2, complete(-58.45, -34.60)), (1, complete(-58.45, -34.60))],
            )
            .unwrap_err();
        assert!(matches!(err, DbError::BatchRejected { ref target_id, .. } if target_id == "1"));

        let ids = store.classified_actor_ids(InferenceMethod::LatLon).unwrap();
        assert_eq!(ids, BTreeSet::from([1]));
    }

    #[test]
    fn stores_area_units() {
        let store = store();
        store
            .insert_units(&[
                SpatialUnit::Area {
                    id: "square".to_string(),
                    boundary_geojson: SQUARE.to_string(),
                },
                SpatialUnit::Cell {
                    cell: 0x089d_d687_6033_ffff,
                },
            ])
            .unwrap();
        let areas = store.area_units().unwrap();
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[0].id(), "square");
    }

    #[test]
    fn absent_destination_is_empty() {
        let store = store();
        assert!(store.completed_ids("never_written").unwrap().is_empty());
        assert!(store.all_results("never_written").unwrap().is_empty());
        assert_eq!(store.count_missing("never_written").unwrap(), 0);
    }

    #[test]
    fn rejects_invalid_destination_names() {
        let store = store();
        for name in ["", "Drop Table", "events", "1abc", "a;b"] {
            assert!(matches!(
                store.completed_ids(name),
                Err(DbError::InvalidIdentifier { .. })
            ));
        }
    }

    #[test]
    fn result_batches_roll_back_on_failure() {
        let store = store();
        let a = ResultRecord::new("a", &serde_json::json!({"n": 1})).unwrap();
        let b = ResultRecord::new("b", &serde_json::json!({"n": 2})).unwrap();
        store.insert_results("counts", &[a.clone()]).unwrap();

        let err = store.insert_results("counts", &[b, a]).unwrap_err();
        assert!(matches!(err, DbError::BatchRejected { ref target_id, .. } if target_id == "a"));

        let done = store.completed_ids("counts").unwrap();
        assert_eq!(done, BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn seeded_targets_fill_in_place() {
        let store = store();
        store
            .seed_targets("cells", &["x".to_string(), "y".to_string()])
            .unwrap();
        assert_eq!(store.count_missing("cells").unwrap(), 2);
        assert!(store.completed_ids("cells").unwrap().is_empty());

        let missing = store.missing_result_ids("cells", 1).unwrap();
        assert_eq!(missing, vec!["x".to_string()]);

        store
            .upsert_result(
                "cells",
                &ResultRecord::new("x", &serde_json::json!({"n": 3})).unwrap(),
            )
            .unwrap();
        assert_eq!(store.count_missing("cells").unwrap(), 1);

        // Seeding again does not clobber a filled payload.
        store.seed_targets("cells", &["x".to_string()]).unwrap();
        let results = store.all_results("cells").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].payload["n"], 3);
    }

    #[test]
    fn claims_are_exclusive_until_released() {
        let store = store();
        let ids = vec!["a".to_string(), "b".to_string()];
        let ttl = Duration::from_secs(60);

        let first = store.try_claim("counts", &ids, "w1", ttl).unwrap();
        assert_eq!(first, ids);

        let second = store
            .try_claim("counts", &["b".to_string(), "c".to_string()], "w2", ttl)
            .unwrap();
        assert_eq!(second, vec!["c".to_string()]);

        // Re-claiming your own target renews it.
        let renewed = store.try_claim("counts", &["a".to_string()], "w1", ttl).unwrap();
        assert_eq!(renewed, vec!["a".to_string()]);

        assert_eq!(store.release_claims("counts", "w1").unwrap(), 2);
        let after = store.try_claim("counts", &ids, "w2", ttl).unwrap();
        assert_eq!(after, ids);
    }

    #[test]
    fn expired_claims_can_be_taken() {
        let store = store();
        let ids = vec!["a".to_string()];
        store.try_claim("counts", &ids, "w1", Duration::ZERO).unwrap();
        let taken = store
            .try_claim("counts", &ids, "w2", Duration::from_secs(60))
            .unwrap();
        assert_eq!(taken, ids);
    }
}
