#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::{Number, Value};
use squadboard_core::{
    format_rfc3339, now_utc, AuthError, Authenticator, ClientStorage, EntityKind, RecordId, Role,
    Row, RowQuery, RowStore, Session, StoreFailure,
};
use ulid::Ulid;

const SQUAD_MIGRATION_VERSION: i64 = 1;

const SCHEMA_SQUAD_V1: &str = r"
CREATE TABLE IF NOT EXISTS members (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  email TEXT,
  phone TEXT,
  position TEXT CHECK (
    position IN ('goalkeeper', 'defender', 'midfielder', 'forward') OR position IS NULL
  ),
  jersey_number INTEGER CHECK (jersey_number BETWEEN 0 AND 99 OR jersey_number IS NULL),
  date_of_birth TEXT,
  status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'injured', 'inactive')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_members_name ON members(name);
CREATE INDEX IF NOT EXISTS idx_members_status ON members(status);

CREATE TABLE IF NOT EXISTS medical_records (
  id TEXT PRIMARY KEY,
  member_id TEXT NOT NULL,
  record_type TEXT NOT NULL CHECK (
    record_type IN ('injury', 'illness', 'checkup', 'vaccination', 'other')
  ),
  description TEXT NOT NULL,
  record_date TEXT NOT NULL,
  severity TEXT CHECK (severity IN ('low', 'moderate', 'high') OR severity IS NULL),
  treatment TEXT,
  expected_return TEXT,
  status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'recovering', 'resolved')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_medical_records_member_date
  ON medical_records(member_id, record_date DESC);

CREATE TABLE IF NOT EXISTS training_sessions (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  session_date TEXT NOT NULL,
  duration_minutes INTEGER NOT NULL CHECK (duration_minutes BETWEEN 1 AND 600),
  location TEXT,
  focus TEXT,
  attendance_count INTEGER CHECK (
    attendance_count BETWEEN 0 AND 1000 OR attendance_count IS NULL
  ),
  notes TEXT,
  status TEXT NOT NULL DEFAULT 'scheduled' CHECK (
    status IN ('scheduled', 'completed', 'cancelled')
  ),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_training_sessions_date ON training_sessions(session_date DESC);

CREATE TABLE IF NOT EXISTS skill_assessments (
  id TEXT PRIMARY KEY,
  member_id TEXT NOT NULL,
  skill TEXT NOT NULL,
  score REAL NOT NULL CHECK (score BETWEEN 0.0 AND 10.0),
  assessed_on TEXT NOT NULL,
  assessor TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_skill_assessments_member_date
  ON skill_assessments(member_id, assessed_on DESC);

CREATE TABLE IF NOT EXISTS client_storage (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
  user_id TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE COLLATE NOCASE,
  display_name TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('admin', 'coach', 'medical', 'player', 'parent')),
  member_id TEXT,
  avatar_url TEXT,
  password_hash TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE SET NULL
);
";

/// Input for [`SqliteStore::add_account`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub email: String,
    pub password: String,
    pub display_name: String,
    pub role: Role,
    pub member_id: Option<RecordId>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct AccountSummary {
    pub user_id: Ulid,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub member_id: Option<RecordId>,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SQUAD_V1)
            .context("failed to apply squadboard schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SQUAD_MIGRATION_VERSION, now],
            )
            .context("failed to register squadboard schema migration")?;

        for kind in EntityKind::ALL {
            ensure_table_matches_schema(&self.conn, kind)?;
        }

        tracing::debug!(version = SQUAD_MIGRATION_VERSION, "schema migrated");
        Ok(())
    }

    /// Opens `path` and applies migrations.
    pub fn open_and_migrate(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn account_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))
            .context("failed to count accounts")
    }

    pub fn add_account(&self, account: &NewAccount) -> Result<AccountSummary> {
        let email = account.email.trim();
        if email.is_empty() {
            return Err(anyhow!("account email must not be empty"));
        }
        if account.password.is_empty() {
            return Err(anyhow!("account password must not be empty"));
        }

        let user_id = Ulid::new();
        let password_hash = hash_password(&account.password)?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO accounts(
                    user_id, email, display_name, role, member_id, avatar_url,
                    password_hash, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    user_id.to_string(),
                    email,
                    account.display_name,
                    account.role.as_str(),
                    account.member_id.as_ref().map(RecordId::as_str),
                    account.avatar_url,
                    password_hash,
                    now,
                ],
            )
            .with_context(|| format!("failed to insert account for {email}"))?;

        tracing::info!(%user_id, role = %account.role, "account created");
        Ok(AccountSummary {
            user_id,
            email: email.to_string(),
            display_name: account.display_name.clone(),
            role: account.role,
            member_id: account.member_id.clone(),
        })
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>, StoreFailure> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))
            .map_err(store_failure)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(store_failure)?;
        let columns = collect_rows(rows).map_err(store_failure)?;

        if columns.is_empty() {
            return Err(StoreFailure::malformed(format!("unknown table {table}")));
        }
        Ok(columns)
    }

    fn ensure_columns(
        &self,
        table: &str,
        names: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<(), StoreFailure> {
        let available = self.table_columns(table)?;
        for name in names {
            let name = name.as_ref();
            if !available.iter().any(|candidate| candidate == name) {
                return Err(StoreFailure::malformed(format!("{table} has no column {name}")));
            }
        }
        Ok(())
    }
}

impl RowStore for SqliteStore {
    fn fetch_one(&self, table: &str, id: &str) -> Result<Option<Row>, StoreFailure> {
        self.ensure_columns(table, ["id"])?;
        select_by_id(&self.conn, table, id)
    }

    fn fetch_all(&self, table: &str, query: &RowQuery) -> Result<Vec<Row>, StoreFailure> {
        self.ensure_columns(
            table,
            query
                .filters
                .iter()
                .map(|filter| filter.column.as_str())
                .chain(query.order.iter().map(|order| order.column.as_str())),
        )?;

        let mut sql = format!("SELECT * FROM {}", quote_identifier(table));
        let mut bound = Vec::with_capacity(query.filters.len());
        for (index, filter) in query.filters.iter().enumerate() {
            let keyword = if index == 0 { "WHERE" } else { "AND" };
            if filter.value.is_null() {
                sql.push_str(&format!(" {keyword} {} IS NULL", quote_identifier(&filter.column)));
            } else {
                bound.push(to_sql_value(&filter.value));
                sql.push_str(&format!(
                    " {keyword} {} = ?{}",
                    quote_identifier(&filter.column),
                    bound.len()
                ));
            }
        }
        if let Some(order) = &query.order {
            let direction = if order.descending { "DESC" } else { "ASC" };
            sql.push_str(&format!(
                " ORDER BY {} {direction}, id ASC",
                quote_identifier(&order.column)
            ));
        }

        let mut stmt = self.conn.prepare(&sql).map_err(store_failure)?;
        let rows = stmt
            .query_map(params_from_iter(bound.iter()), read_row)
            .map_err(store_failure)?;
        collect_rows(rows).map_err(store_failure)
    }

    fn insert(&mut self, table: &str, values: &Row) -> Result<Row, StoreFailure> {
        self.ensure_columns(table, values.keys())?;

        let id = Ulid::new().to_string();
        let now = timestamp()?;

        let mut columns = vec!["id".to_string(), "created_at".to_string(), "updated_at".to_string()];
        let mut bound = vec![SqlValue::Text(id.clone()), SqlValue::Text(now.clone()), SqlValue::Text(now)];
        for (column, value) in values {
            if is_store_owned(column) {
                continue;
            }
            columns.push(quote_identifier(column));
            bound.push(to_sql_value(value));
        }
        let placeholders = (1..=bound.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote_identifier(table),
            columns.join(", ")
        );

        let tx = self.conn.transaction().map_err(store_failure)?;
        tx.execute(&sql, params_from_iter(bound.iter()))
            .map_err(store_failure)?;
        let row = select_by_id(&tx, table, &id)?
            .ok_or_else(|| StoreFailure::malformed(format!("{table} row {id} vanished after insert")))?;
        tx.commit().map_err(store_failure)?;

        tracing::debug!(table, %id, "row inserted");
        Ok(row)
    }

    fn update(&mut self, table: &str, id: &str, values: &Row) -> Result<Option<Row>, StoreFailure> {
        self.ensure_columns(table, values.keys())?;

        let now = timestamp()?;
        let mut assignments = vec!["updated_at = ?1".to_string()];
        let mut bound = vec![SqlValue::Text(now)];
        for (column, value) in values {
            if is_store_owned(column) {
                continue;
            }
            bound.push(to_sql_value(value));
            assignments.push(format!("{} = ?{}", quote_identifier(column), bound.len()));
        }
        bound.push(SqlValue::Text(id.to_string()));
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            quote_identifier(table),
            assignments.join(", "),
            bound.len()
        );

        let tx = self.conn.transaction().map_err(store_failure)?;
        let changed = tx
            .execute(&sql, params_from_iter(bound.iter()))
            .map_err(store_failure)?;
        if changed == 0 {
            return Ok(None);
        }
        let row = select_by_id(&tx, table, id)?;
        tx.commit().map_err(store_failure)?;

        tracing::debug!(table, id, "row updated");
        Ok(row)
    }

    fn delete(&mut self, table: &str, id: &str) -> Result<Option<Row>, StoreFailure> {
        self.ensure_columns(table, ["id"])?;

        let tx = self.conn.transaction().map_err(store_failure)?;
        let Some(row) = select_by_id(&tx, table, id)? else {
            return Ok(None);
        };
        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", quote_identifier(table)),
            params![id],
        )
        .map_err(store_failure)?;
        tx.commit().map_err(store_failure)?;

        tracing::debug!(table, id, "row deleted");
        Ok(Some(row))
    }
}

impl ClientStorage for SqliteStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreFailure> {
        self.conn
            .query_row(
                "SELECT value FROM client_storage WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_failure)
    }

    fn write(&mut self, key: &str, value: &str) -> Result<(), StoreFailure> {
        let now = timestamp()?;
        self.conn
            .execute(
                "INSERT INTO client_storage(key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .map_err(store_failure)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreFailure> {
        self.conn
            .execute("DELETE FROM client_storage WHERE key = ?1", params![key])
            .map_err(store_failure)?;
        Ok(())
    }
}

struct AccountRow {
    user_id: String,
    email: String,
    display_name: String,
    role: String,
    member_id: Option<String>,
    avatar_url: Option<String>,
    password_hash: String,
}

impl Authenticator for SqliteStore {
    fn authenticate(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let account = self
            .conn
            .query_row(
                "SELECT user_id, email, display_name, role, member_id, avatar_url,
                        password_hash
                 FROM accounts WHERE email = ?1",
                params![email.trim()],
                |row| {
                    Ok(AccountRow {
                        user_id: row.get(0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                        role: row.get(3)?,
                        member_id: row.get(4)?,
                        avatar_url: row.get(5)?,
                        password_hash: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;

        let Some(account) = account else {
            tracing::debug!("login rejected: unknown account");
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(password, &account.password_hash)? {
            tracing::debug!(user_id = %account.user_id, "login rejected: wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        let user_id = Ulid::from_string(&account.user_id)
            .map_err(|err| AuthError::Unavailable(format!("invalid account id: {err}")))?;
        let role = Role::parse(&account.role)
            .ok_or_else(|| AuthError::Unavailable(format!("invalid account role: {}", account.role)))?;

        Ok(Session {
            user_id,
            display_name: account.display_name,
            email: account.email,
            role,
            member_id: account.member_id.map(RecordId),
            avatar_url: account.avatar_url,
            signed_in_at: now_utc(),
        })
    }
}

/// Argon2id hash in PHC string form; the salt travels inside the string.
fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash account password: {err}"))?;
    Ok(hash.to_string())
}

fn verify_password(password: &str, stored: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(stored)
        .map_err(|err| AuthError::Unavailable(format!("invalid stored password hash: {err}")))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(err) => Err(AuthError::Unavailable(format!(
            "password verification failed: {err}"
        ))),
    }
}

fn ensure_table_matches_schema(conn: &Connection, kind: EntityKind) -> Result<()> {
    let table = kind.table();
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for spec in kind.schema().fields {
        if !available.iter().any(|candidate| candidate == spec.name) {
            return Err(anyhow!(
                "schema check failed: missing column {table}.{}",
                spec.name
            ));
        }
    }

    Ok(())
}

fn select_by_id(conn: &Connection, table: &str, id: &str) -> Result<Option<Row>, StoreFailure> {
    conn.query_row(
        &format!("SELECT * FROM {} WHERE id = ?1", quote_identifier(table)),
        params![id],
        read_row,
    )
    .optional()
    .map_err(store_failure)
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    let statement: &rusqlite::Statement<'_> = row.as_ref();
    let mut values = Row::new();
    for index in 0..statement.column_count() {
        let name = statement.column_name(index)?.to_string();
        let value = match row.get_ref(index)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(number) => Value::from(number),
            ValueRef::Real(number) => Number::from_f64(number).map_or(Value::Null, Value::Number),
            ValueRef::Text(bytes) => Value::String(
                std::str::from_utf8(bytes)
                    .map_err(|err| {
                        rusqlite::Error::FromSqlConversionFailure(
                            index,
                            rusqlite::types::Type::Text,
                            Box::new(err),
                        )
                    })?
                    .to_string(),
            ),
            ValueRef::Blob(_) => {
                return Err(rusqlite::Error::FromSqlConversionFailure(
                    index,
                    rusqlite::types::Type::Blob,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unexpected blob in column {name}"),
                    )),
                ))
            }
        };
        values.insert(name, value);
    }
    Ok(values)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn is_store_owned(column: &str) -> bool {
    matches!(column, "id" | "created_at" | "updated_at")
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn timestamp() -> Result<String, StoreFailure> {
    format_rfc3339(now_utc()).map_err(|err| StoreFailure::malformed(err.to_string()))
}

fn store_failure(err: rusqlite::Error) -> StoreFailure {
    let failure = match &err {
        rusqlite::Error::SqliteFailure(cause, _) => match cause.code {
            ErrorCode::ConstraintViolation => StoreFailure::constraint(err.to_string()),
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::ReadOnly => StoreFailure::connectivity(err.to_string()),
            _ => StoreFailure::malformed(err.to_string()),
        },
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..) => StoreFailure::malformed(err.to_string()),
        _ => StoreFailure::connectivity(err.to_string()),
    };
    tracing::warn!(kind = %failure.kind, error = %err, "sqlite operation failed");
    failure
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> rusqlite::Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
