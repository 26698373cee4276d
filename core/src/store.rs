/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Relational Store Integration (SQLite).
 *
 * One connection per execution. Guest-declared tables are reconciled
 * against the live store on open and on every later registration: a
 * missing table is created, an existing one must already match. Result
 * cells always come back as text (or Null).
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::value::{Kind, Object, Value};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no database is open")]
    NotOpen,
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid table batch: {0}")]
    Batch(#[from] serde_json::Error),
    #[error("table {table}: missing column {column}")]
    MissingColumn { table: String, column: String },
    #[error("table {table}: column {column} declared {declared}, store has {actual}")]
    TypeMismatch {
        table: String,
        column: String,
        declared: String,
        actual: String,
    },
    #[error("expected exactly one row, got {0}")]
    RowCount(usize),
    #[error("expected at most one row, got {0}")]
    TooManyRows(usize),
    #[error("a transaction is already open")]
    NestedTransaction,
    #[error("query parameters must be an array, got {0}")]
    BadParams(Kind),
}

impl StoreError {
    /// Declaration/store disagreements abort execution instead of being
    /// returned to the guest.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::MissingColumn { .. } | StoreError::TypeMismatch { .. }
        )
    }
}

// =============================================================================
// Table Definitions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub constraints: String,
}

impl TableDef {
    pub fn parse_batch(batch: &str) -> Result<Vec<TableDef>, StoreError> {
        Ok(serde_json::from_str(batch)?)
    }

    fn create_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut col = format!("{} {}", quote_ident(&c.name), c.ty);
                if !c.constraints.trim().is_empty() {
                    col.push(' ');
                    col.push_str(c.constraints.trim());
                }
                col
            })
            .collect();
        format!(
            "CREATE TABLE {} ({})",
            quote_ident(&self.name),
            columns.join(", ")
        )
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// =============================================================================
// Database
// =============================================================================

/// The execution's store handle. Starts closed.
#[derive(Debug, Default)]
pub struct Database {
    conn: Option<Connection>,
    declared: Vec<TableDef>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Opens (creating if needed) the store and reconciles every table
    /// declared so far. A previous connection and its open transaction are
    /// dropped first.
    pub fn open(&mut self, identifier: &str) -> Result<(), StoreError> {
        self.conn = None;
        let conn = Connection::open(identifier)?;
        info!(store = identifier, "opened database");
        reconcile(&conn, &self.declared)?;
        self.conn = Some(conn);
        Ok(())
    }

    /// Records a batch of table definitions and reconciles them now if a
    /// store is open.
    pub fn register_tables(&mut self, batch: &str) -> Result<(), StoreError> {
        let defs = TableDef::parse_batch(batch)?;
        if let Some(conn) = &self.conn {
            reconcile(conn, &defs)?;
        }
        for def in defs {
            match self.declared.iter_mut().find(|d| d.name == def.name) {
                Some(existing) => *existing = def,
                None => self.declared.push(def),
            }
        }
        Ok(())
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::NotOpen)
    }

    /// Runs a query and returns `{columns, rows}`.
    pub fn exec(&self, sql: &str, params: &Value) -> Result<Value, StoreError> {
        let (columns, rows) = self.select(sql, params)?;
        let mut out = Object::new();
        out.insert(
            "columns",
            Value::Array(columns.into_iter().map(Value::String).collect()),
        );
        out.insert("rows", Value::Array(rows));
        Ok(Value::Object(out))
    }

    pub fn query(&self, sql: &str, params: &Value) -> Result<Value, StoreError> {
        Ok(Value::Array(self.select(sql, params)?.1))
    }

    pub fn fetch_one(&self, sql: &str, params: &Value) -> Result<Value, StoreError> {
        let (_, mut rows) = self.select(sql, params)?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            n => Err(StoreError::RowCount(n)),
        }
    }

    /// Zero rows is Null, not an error.
    pub fn fetch_optional(&self, sql: &str, params: &Value) -> Result<Value, StoreError> {
        let (_, mut rows) = self.select(sql, params)?;
        match rows.len() {
            0 => Ok(Value::Null),
            1 => Ok(rows.remove(0)),
            n => Err(StoreError::TooManyRows(n)),
        }
    }

    /// Runs a mutation and returns `{changes}`.
    pub fn execute(&self, sql: &str, params: &Value) -> Result<Value, StoreError> {
        let conn = self.conn()?;
        let changes = conn.execute(sql, params_from_iter(bind_params(params)?))?;
        let mut out = Object::new();
        out.insert("changes", Value::Integer(changes as i64));
        Ok(Value::Object(out))
    }

    fn select(&self, sql: &str, params: &Value) -> Result<(Vec<String>, Vec<Value>), StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_lowercase)
            .collect();
        let mut rows = stmt.query(params_from_iter(bind_params(params)?))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut obj = Object::with_capacity(columns.len());
            for (i, name) in columns.iter().enumerate() {
                obj.insert(name.clone(), cell_text(row.get_ref(i)?));
            }
            obj.sort_keys();
            out.push(Value::Object(obj));
        }
        Ok((columns, out))
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// No-op without an open store.
    pub fn begin(&self) -> Result<(), StoreError> {
        let Some(conn) = &self.conn else {
            return Ok(());
        };
        if !conn.is_autocommit() {
            return Err(StoreError::NestedTransaction);
        }
        conn.execute_batch("BEGIN")?;
        Ok(())
    }

    /// No-op when no transaction is open.
    pub fn commit(&self) -> Result<(), StoreError> {
        match &self.conn {
            Some(conn) if !conn.is_autocommit() => Ok(conn.execute_batch("COMMIT")?),
            _ => Ok(()),
        }
    }

    pub fn rollback(&self) -> Result<(), StoreError> {
        match &self.conn {
            Some(conn) if !conn.is_autocommit() => Ok(conn.execute_batch("ROLLBACK")?),
            _ => Ok(()),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| !c.is_autocommit())
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

fn reconcile(conn: &Connection, defs: &[TableDef]) -> Result<(), StoreError> {
    for def in defs {
        let existing = table_columns(conn, &def.name)?;
        if existing.is_empty() {
            debug!(table = %def.name, "creating table");
            conn.execute_batch(&def.create_sql())?;
            continue;
        }
        for column in &def.columns {
            let found = existing
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&column.name))
                .ok_or_else(|| StoreError::MissingColumn {
                    table: def.name.clone(),
                    column: column.name.clone(),
                })?;
            if !found.1.trim().eq_ignore_ascii_case(column.ty.trim()) {
                return Err(StoreError::TypeMismatch {
                    table: def.name.clone(),
                    column: column.name.clone(),
                    declared: column.ty.clone(),
                    actual: found.1.clone(),
                });
            }
        }
    }
    Ok(())
}

/// `(name, declared type)` per column; empty when the table is missing.
fn table_columns(conn: &Connection, table: &str) -> Result<Vec<(String, String)>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

// =============================================================================
// Value Conversion
// =============================================================================

fn bind_params(params: &Value) -> Result<Vec<SqlValue>, StoreError> {
    match params {
        Value::Undefined | Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items.iter().map(to_sql).collect()),
        other => Err(StoreError::BadParams(other.kind())),
    }
}

fn to_sql(v: &Value) -> SqlValue {
    match v {
        Value::Undefined | Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Integer(n) => SqlValue::Integer(*n),
        Value::Float(x) => SqlValue::Real(*x),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(v.to_display_string()),
    }
}

/// Every non-NULL cell is returned as text.
fn cell_text(cell: ValueRef<'_>) -> Value {
    match cell {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::String(n.to_string()),
        ValueRef::Real(x) => Value::String(Value::Float(x).to_display_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const USERS: &str = r#"[{"name":"users","columns":[
        {"name":"id","type":"INTEGER","constraints":"PRIMARY KEY"},
        {"name":"name","type":"TEXT","constraints":""}]}]"#;

    fn open_memory() -> Database {
        let mut db = Database::new();
        db.open(":memory:").expect("open in-memory store");
        db
    }

    fn params(items: Vec<Value>) -> Value {
        Value::Array(items)
    }

    #[test]
    fn test_table_scenario_create_revalidate_missing_column() {
        let mut db = open_memory();
        db.register_tables(USERS).expect("creates users");
        db.execute(
            "INSERT INTO users (id, name) VALUES (?, ?)",
            &params(vec![Value::Integer(1), Value::from("ada")]),
        )
        .unwrap();
        db.register_tables(USERS).expect("same definition validates");

        let extra = r#"[{"name":"users","columns":[
            {"name":"id","type":"INTEGER"},
            {"name":"name","type":"TEXT"},
            {"name":"extra","type":"BLOB"}]}]"#;
        let err = db.register_tables(extra).unwrap_err();
        assert!(err.is_fatal());
        assert!(
            matches!(&err, StoreError::MissingColumn { column, .. } if column == "extra"),
            "got {:?}",
            err
        );
    }

    #[test]
    fn test_type_mismatch_is_fatal() {
        let mut db = open_memory();
        db.register_tables(USERS).unwrap();
        let changed = r#"[{"name":"users","columns":[{"name":"id","type":"TEXT"}]}]"#;
        let err = db.register_tables(changed).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
    }

    #[test]
    fn test_declarations_reconciled_on_open() {
        let mut db = Database::new();
        db.register_tables(USERS).expect("recorded while closed");
        assert!(!db.is_open());
        db.open(":memory:").unwrap();
        let rows = db.query("SELECT * FROM users", &Value::Null).unwrap();
        assert_eq!(rows, Value::Array(Vec::new()));
    }

    #[test]
    fn test_rows_are_text_with_lowercase_sorted_keys() {
        let db = open_memory();
        let v = db
            .exec("SELECT 42 AS Zed, 1.5 AS Alpha, NULL AS Mid, 'x' AS b", &Value::Null)
            .unwrap();
        insta::assert_snapshot!(
            crate::json::stringify(&v).unwrap(),
            @r#"{"columns":["zed","alpha","mid","b"],"rows":[{"alpha":"1.5","b":"x","mid":null,"zed":"42"}]}"#
        );
    }

    #[test]
    fn test_fetch_one_and_optional() {
        let mut db = open_memory();
        db.register_tables(USERS).unwrap();
        let none = db
            .fetch_optional("SELECT name FROM users WHERE id = ?", &params(vec![Value::Integer(9)]))
            .unwrap();
        assert_eq!(none, Value::Null);
        assert!(matches!(
            db.fetch_one("SELECT name FROM users", &Value::Null),
            Err(StoreError::RowCount(0))
        ));
        db.execute(
            "INSERT INTO users (id, name) VALUES (?, ?), (?, ?)",
            &params(vec![
                Value::Integer(1),
                Value::from("a"),
                Value::Integer(2),
                Value::from("b"),
            ]),
        )
        .unwrap();
        let one = db
            .fetch_one("SELECT name FROM users WHERE id = ?", &params(vec![Value::Integer(2)]))
            .unwrap();
        assert_eq!(one.as_object().unwrap().get("name"), Some(&Value::from("b")));
        assert!(matches!(
            db.fetch_optional("SELECT name FROM users", &Value::Null),
            Err(StoreError::TooManyRows(2))
        ));
    }

    #[test]
    fn test_execute_reports_changes() {
        let mut db = open_memory();
        db.register_tables(USERS).unwrap();
        let v = db
            .execute(
                "INSERT INTO users (id, name) VALUES (1, 'a'), (2, 'b')",
                &Value::Undefined,
            )
            .unwrap();
        assert_eq!(v.as_object().unwrap().get("changes"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_rollback_discards_changes() {
        let mut db = open_memory();
        db.register_tables(USERS).unwrap();
        db.begin().unwrap();
        assert!(db.in_transaction());
        assert!(matches!(db.begin(), Err(StoreError::NestedTransaction)));
        db.execute("INSERT INTO users (id, name) VALUES (1, 'a')", &Value::Null)
            .unwrap();
        db.rollback().unwrap();
        assert!(!db.in_transaction());
        assert_eq!(
            db.query("SELECT * FROM users", &Value::Null).unwrap(),
            Value::Array(Vec::new())
        );
        db.commit().expect("commit without a transaction is a no-op");
    }

    #[test]
    fn test_closed_store_errors_and_noop_transactions() {
        let db = Database::new();
        assert!(matches!(
            db.query("SELECT 1", &Value::Null),
            Err(StoreError::NotOpen)
        ));
        db.begin().unwrap();
        db.commit().unwrap();
        db.rollback().unwrap();
    }

    #[test]
    fn test_bad_params_and_bad_sql() {
        let db = open_memory();
        assert!(matches!(
            db.query("SELECT ?", &Value::from("x")),
            Err(StoreError::BadParams(Kind::String))
        ));
        let err = db.query("SELEC nonsense", &Value::Null).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_reopen_discards_previous_connection() {
        let path = std::env::temp_dir().join(format!("sable-store-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let path_str = path.to_string_lossy().to_string();
        let mut db = Database::new();
        db.register_tables(USERS).unwrap();
        db.open(&path_str).unwrap();
        db.begin().unwrap();
        db.execute("INSERT INTO users (id, name) VALUES (1, 'a')", &Value::Null)
            .unwrap();
        db.open(&path_str).unwrap();
        assert!(!db.in_transaction());
        assert_eq!(
            db.query("SELECT * FROM users", &Value::Null).unwrap(),
            Value::Array(Vec::new()),
            "uncommitted insert dropped with the old connection"
        );
        drop(db);
        let _ = std::fs::remove_file(&path);
    }
}
