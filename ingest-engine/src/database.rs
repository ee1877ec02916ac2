use std::path::Path;

use diesel::pg::Pg;
use diesel::sql_types::{Nullable, Text};
use diesel_async::{
    pooled_connection::{
        deadpool::{Object, Pool},
        AsyncDieselConnectionManager,
    },
    AsyncPgConnection, RunQueryDsl,
};
use tracing::{debug, info};

use crate::csv_io;
use crate::error::{IngestError, Result};
use crate::metadata::{
    Metadata, Variable, D3M_INDEX_NAME, FLOAT_TYPE, INDEX_TYPE, INTEGER_TYPE, LATITUDE_TYPE,
    LONGITUDE_TYPE,
};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Postgres accepts at most this many bind parameters per statement.
const MAX_BIND_PARAMETERS: usize = 65_535;

const SQL_INTEGER: &str = "INTEGER";
const SQL_DOUBLE: &str = "DOUBLE PRECISION";
const SQL_TEXT: &str = "TEXT";

/// Column type of a variable in the typed view.
pub fn sql_type(type_name: &str) -> &'static str {
    match type_name {
        INDEX_TYPE => SQL_INTEGER,
        INTEGER_TYPE | FLOAT_TYPE | LONGITUDE_TYPE | LATITUDE_TYPE => SQL_DOUBLE,
        _ => SQL_TEXT,
    }
}

/// Value substituted for nulls in the typed view.
pub fn default_value(type_name: &str) -> &'static str {
    match sql_type(type_name) {
        SQL_TEXT => "''",
        _ => "0",
    }
}

/// Types whose empty cells are stored as NULL.
pub fn is_nullable_type(type_name: &str) -> bool {
    matches!(type_name, INDEX_TYPE | INTEGER_TYPE | FLOAT_TYPE)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn base_table(storage_name: &str) -> String {
    format!("{}_base", storage_name)
}

pub fn variable_table(storage_name: &str) -> String {
    format!("{}_variable", storage_name)
}

pub fn result_table(storage_name: &str) -> String {
    format!("{}_result", storage_name)
}

/// Statements removing every artifact of a dataset, view first.
pub fn drop_statements(storage_name: &str) -> Vec<String> {
    vec![
        format!("DROP VIEW IF EXISTS {}", quote_ident(storage_name)),
        format!("DROP TABLE IF EXISTS {}", quote_ident(&base_table(storage_name))),
        format!("DROP TABLE IF EXISTS {}", quote_ident(&result_table(storage_name))),
        format!("DROP TABLE IF EXISTS {}", quote_ident(&variable_table(storage_name))),
    ]
}

pub fn create_base_table_sql(storage_name: &str, variables: &[&Variable]) -> String {
    let columns: Vec<String> = variables
        .iter()
        .map(|v| format!("{} {}", quote_ident(&v.name), SQL_TEXT))
        .collect();
    format!(
        "CREATE TABLE {} ({})",
        quote_ident(&base_table(storage_name)),
        columns.join(", ")
    )
}

/// View casting every base column to its semantic type, nulls coalesced to
/// the type default.
pub fn create_view_sql(storage_name: &str, variables: &[&Variable]) -> String {
    let columns: Vec<String> = variables
        .iter()
        .map(|v| {
            let column = quote_ident(&v.name);
            match sql_type(&v.type_name) {
                SQL_TEXT => format!("COALESCE({}, '') AS {}", column, column),
                target => format!(
                    "COALESCE(CAST(NULLIF({}, '') AS {}), {}) AS {}",
                    column,
                    target,
                    default_value(&v.type_name),
                    column
                ),
            }
        })
        .collect();
    format!(
        "CREATE VIEW {} AS SELECT {} FROM {}",
        quote_ident(storage_name),
        columns.join(", "),
        quote_ident(&base_table(storage_name))
    )
}

pub fn create_variable_table_sql(storage_name: &str) -> String {
    format!(
        "CREATE TABLE {} (name TEXT, role TEXT, type TEXT)",
        quote_ident(&variable_table(storage_name))
    )
}

pub fn create_result_table_sql(storage_name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (result_id TEXT, \"index\" BIGINT, target TEXT, value TEXT)",
        quote_ident(&result_table(storage_name))
    )
}

/// One multi-row INSERT with its bind values in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertBatch {
    pub sql: String,
    pub values: Vec<Option<String>>,
    pub rows: usize,
}

/// Accumulates rows and emits an [`InsertBatch`] whenever `batch_size`
/// rows are pending.
#[derive(Debug)]
pub struct InsertBatcher {
    table: String,
    columns: Vec<String>,
    casts: Vec<Option<&'static str>>,
    nullable: Vec<bool>,
    batch_size: usize,
    pending: Vec<Option<String>>,
    pending_rows: usize,
}

impl InsertBatcher {
    pub fn new(table: &str, columns: Vec<String>, batch_size: usize) -> Self {
        let width = columns.len().max(1);
        let batch_size = batch_size.clamp(1, MAX_BIND_PARAMETERS / width);
        Self {
            table: table.to_string(),
            casts: vec![None; columns.len()],
            nullable: vec![false; columns.len()],
            columns,
            batch_size,
            pending: Vec::new(),
            pending_rows: 0,
        }
    }

    /// Marks columns whose empty values become NULL.
    pub fn with_nullable(mut self, nullable: Vec<bool>) -> Self {
        self.nullable = nullable;
        self
    }

    /// Wraps the placeholder of column `i` in `CAST(... AS <type>)`.
    pub fn with_cast(mut self, column: usize, sql_type: &'static str) -> Self {
        if let Some(slot) = self.casts.get_mut(column) {
            *slot = Some(sql_type);
        }
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn push<I, S>(&mut self, row: I) -> Result<Option<InsertBatch>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let before = self.pending.len();
        for (i, value) in row.into_iter().enumerate() {
            let value: String = value.into();
            let nullable = self.nullable.get(i).copied().unwrap_or(false);
            self.pending
                .push(if nullable && value.is_empty() { None } else { Some(value) });
        }
        let width = self.pending.len() - before;
        if width != self.columns.len() {
            self.pending.truncate(before);
            return Err(IngestError::Database {
                message: format!(
                    "row has {} values for {} columns of {}",
                    width,
                    self.columns.len(),
                    self.table
                ),
            });
        }

        self.pending_rows += 1;
        if self.pending_rows >= self.batch_size {
            Ok(self.flush())
        } else {
            Ok(None)
        }
    }

    /// Emits the pending rows, if any.
    pub fn flush(&mut self) -> Option<InsertBatch> {
        if self.pending_rows == 0 {
            return None;
        }
        let width = self.columns.len();
        let tuples: Vec<String> = (0..self.pending_rows)
            .map(|row| {
                let placeholders: Vec<String> = (0..width)
                    .map(|col| {
                        let placeholder = format!("${}", row * width + col + 1);
                        match self.casts[col] {
                            Some(target) => format!("CAST({} AS {})", placeholder, target),
                            None => placeholder,
                        }
                    })
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();

        let batch = InsertBatch {
            sql: format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(&self.table),
                columns.join(", "),
                tuples.join(", ")
            ),
            values: std::mem::take(&mut self.pending),
            rows: self.pending_rows,
        };
        self.pending_rows = 0;
        Some(batch)
    }
}

/// Relational projection of ingested datasets.
#[derive(Clone)]
pub struct DatabaseWriter {
    pool: Pool<AsyncPgConnection>,
    batch_size: usize,
}

impl DatabaseWriter {
    pub fn new(database_url: &str, batch_size: usize) -> Result<Self> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(config)
            .build()
            .map_err(|e| IngestError::ConfigError {
                message: format!("Failed to create database pool: {}", e),
            })?;
        Ok(Self { pool, batch_size })
    }

    async fn connection(&self) -> Result<Object<AsyncPgConnection>> {
        self.pool.get().await.map_err(|e| IngestError::Database {
            message: format!("Failed to get database connection: {}", e),
        })
    }

    async fn execute(conn: &mut AsyncPgConnection, sql: &str) -> Result<()> {
        debug!("Executing {}", sql);
        diesel::sql_query(sql)
            .execute(conn)
            .await
            .map_err(|e| IngestError::Database {
                message: format!("{}: {}", sql, e),
            })?;
        Ok(())
    }

    async fn insert(conn: &mut AsyncPgConnection, batch: InsertBatch) -> Result<()> {
        let mut query = diesel::sql_query(batch.sql.as_str()).into_boxed::<Pg>();
        for value in batch.values {
            query = query.bind::<Nullable<Text>, _>(value);
        }
        query.execute(conn).await.map_err(|e| IngestError::Database {
            message: format!("Failed to insert {} rows: {}", batch.rows, e),
        })?;
        Ok(())
    }

    /// Drops the view and tables of a dataset.
    pub async fn drop_dataset(&self, storage_name: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        for statement in drop_statements(storage_name) {
            Self::execute(&mut conn, &statement).await?;
        }
        Ok(())
    }

    /// Recreates the tables and view of `meta` and loads the main table from
    /// `data_path`. Returns the number of rows inserted.
    pub async fn ingest(&self, meta: &Metadata, data_path: &Path, has_header: bool) -> Result<usize> {
        let storage_name = meta.storage_name.as_str();
        let main = meta.main_resource()?;
        let variables = main.ordered_variables();
        info!("Ingesting {} into relational store as {}", meta.id, storage_name);

        let mut conn = self.connection().await?;
        for statement in drop_statements(storage_name) {
            Self::execute(&mut conn, &statement).await?;
        }
        Self::execute(&mut conn, &create_base_table_sql(storage_name, &variables)).await?;
        Self::execute(&mut conn, &create_variable_table_sql(storage_name)).await?;
        Self::execute(&mut conn, &create_result_table_sql(storage_name)).await?;

        let mut variable_rows = InsertBatcher::new(
            &variable_table(storage_name),
            vec!["name".to_string(), "role".to_string(), "type".to_string()],
            self.batch_size,
        );
        for variable in &variables {
            let row = [
                variable.name.clone(),
                variable.roles.join(","),
                variable.type_name.clone(),
            ];
            if let Some(batch) = variable_rows.push(row)? {
                Self::insert(&mut conn, batch).await?;
            }
        }
        if let Some(batch) = variable_rows.flush() {
            Self::insert(&mut conn, batch).await?;
        }

        let mut rows = InsertBatcher::new(
            &base_table(storage_name),
            variables.iter().map(|v| v.name.clone()).collect(),
            self.batch_size,
        )
        .with_nullable(variables.iter().map(|v| is_nullable_type(&v.type_name)).collect());

        let mut reader = csv_io::open_reader(data_path, has_header)?;
        let mut count = 0;
        for record in reader.records() {
            let record = record?;
            count += 1;
            if let Some(batch) = rows.push(record.iter())? {
                Self::insert(&mut conn, batch).await?;
            }
        }
        if let Some(batch) = rows.flush() {
            Self::insert(&mut conn, batch).await?;
        }

        Self::execute(&mut conn, &create_view_sql(storage_name, &variables)).await?;
        info!("Inserted {} rows into {}", count, base_table(storage_name));
        Ok(count)
    }

    /// Loads a predictions CSV (`d3mIndex` plus the target column) into the
    /// result table of a dataset under `result_id`.
    pub async fn persist_result(
        &self,
        storage_name: &str,
        result_id: &str,
        target: &str,
        predictions: &Path,
    ) -> Result<usize> {
        let header = csv_io::read_header(predictions)?;
        let index_at = csv_io::column_position(&header, D3M_INDEX_NAME).unwrap_or(0);
        let target_at = csv_io::column_position(&header, target).ok_or_else(|| {
            IngestError::csv(format!(
                "predictions {} have no column {}",
                predictions.display(),
                target
            ))
        })?;

        let mut conn = self.connection().await?;
        Self::execute(&mut conn, &create_result_table_sql(storage_name)).await?;

        let mut batcher = InsertBatcher::new(
            &result_table(storage_name),
            vec![
                "result_id".to_string(),
                "index".to_string(),
                "target".to_string(),
                "value".to_string(),
            ],
            self.batch_size,
        )
        .with_cast(1, "BIGINT")
        .with_nullable(vec![false, true, false, false]);

        let mut reader = csv_io::open_reader(predictions, true)?;
        let mut count = 0;
        for record in reader.records() {
            let record = record?;
            count += 1;
            let row = [
                result_id.to_string(),
                record.get(index_at).unwrap_or_default().to_string(),
                target.to_string(),
                record.get(target_at).unwrap_or_default().to_string(),
            ];
            if let Some(batch) = batcher.push(row)? {
                Self::insert(&mut conn, batch).await?;
            }
        }
        if let Some(batch) = batcher.flush() {
            Self::insert(&mut conn, batch).await?;
        }

        info!("Stored {} predictions as result {}", count, result_id);
        Ok(count)
    }
}
