use std::time::Instant;

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, Pool, Value};
use tracing::info;

use crate::dump::{DumpWriter, SnapshotDump};
use crate::error::{Error, Result};
use crate::schema::SyncColumns;
use crate::sql::SqlTemplater;

/// Pooled access to the authoritative database.
///
/// Every query is timed and reported on the `query` tracing target, which
/// startup routes into the configured query log file.
pub struct Db {
    pool: Pool,
}

impl Db {
    pub fn open(dsn: &str) -> Result<Self> {
        let opts = Opts::from_url(dsn).map_err(mysql_async::Error::from)?;
        Ok(Self {
            pool: Pool::new(opts),
        })
    }

    pub async fn check(&self) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        let _: Option<String> = conn.query_first("SELECT 'ping'").await?;
        Ok(())
    }

    /// Fetches one row by id with the configured single-row template and
    /// renders it into schema order.
    pub async fn single_row(
        &self,
        sql: &str,
        id: &str,
        columns: &SyncColumns,
    ) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        let started = Instant::now();
        let row: Option<mysql_async::Row> = match conn.exec_first(sql, (id,)).await {
            Ok(row) => row,
            Err(err) => {
                log_query(sql, Some(id), started, &format!("ERR {err}"));
                return Err(err.into());
            }
        };
        match row {
            Some(row) => {
                log_query(sql, Some(id), started, "OK");
                row_to_record(&row, columns)
            }
            None => {
                log_query(sql, Some(id), started, "NO_ROWS");
                Err(Error::NoRows)
            }
        }
    }

    /// Materialises the full-table select into an on-disk snapshot.
    ///
    /// With `use_lock_table` the select runs under a table-level read lock
    /// that is released as soon as the dump file holds the consistent view,
    /// before any of it is pushed to the client.
    pub async fn snapshot(&self, sql: &SqlTemplater, use_lock_table: bool) -> Result<SnapshotDump> {
        let mut conn = self.pool.get_conn().await?;

        if use_lock_table {
            conn.query_drop("BEGIN").await?;
            if let Err(err) = conn.query_drop(sql.lock_table.as_str()).await {
                let _ = conn.query_drop("COMMIT").await;
                return Err(err.into());
            }
        }

        let result = materialize(&mut conn, sql).await;

        if use_lock_table {
            let _ = conn.query_drop(sql.unlock_table.as_str()).await;
            let _ = conn.query_drop("COMMIT").await;
        }
        result
    }
}

async fn materialize(conn: &mut Conn, sql: &SqlTemplater) -> Result<SnapshotDump> {
    let started = Instant::now();
    let mut rows = match conn.query_iter(sql.sync_full_update.as_str()).await {
        Ok(rows) => rows,
        Err(err) => {
            log_query(&sql.sync_full_update, None, started, &format!("ERR {err}"));
            return Err(err.into());
        }
    };

    let mut writer = DumpWriter::create().await?;
    let mut count = 0usize;
    while let Some(row) = rows.next().await? {
        writer.push(&row_to_record(&row, sql.columns())?).await?;
        count += 1;
    }
    log_query(&sql.sync_full_update, None, started, "OK");
    info!(rows = count, "snapshot materialised");
    writer.finish().await
}

fn log_query(sql: &str, param: Option<&str>, started: Instant, outcome: &str) {
    let ms = started.elapsed().as_secs_f64() * 1000.0;
    match param {
        Some(param) => info!(target: "query", sql, param, "{ms:.2}ms {outcome}"),
        None => info!(target: "query", sql, "{ms:.2}ms {outcome}"),
    }
}

/// Renders one driver row into the positional string form used everywhere
/// downstream: numeric columns keep their decimal text, string columns
/// carry the raw payload for the packer to quote.
pub fn row_to_record(row: &mysql_async::Row, columns: &SyncColumns) -> Result<Vec<String>> {
    if row.len() != columns.len() {
        return Err(Error::ColumnMismatch {
            got: row.len(),
            want: columns.len(),
        });
    }
    let mut record = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let value = row
            .as_ref(i)
            .ok_or_else(|| Error::NullValue(column.name.clone()))?;
        record.push(value_text(value, &column.name)?);
    }
    Ok(record)
}

fn value_text(value: &Value, column: &str) -> Result<String> {
    match value {
        Value::NULL => Err(Error::NullValue(column.to_string())),
        Value::Bytes(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(v) => Ok(v.to_string()),
        Value::UInt(v) => Ok(v.to_string()),
        Value::Float(v) => Ok(v.to_string()),
        Value::Double(v) => Ok(v.to_string()),
        Value::Date(year, month, day, hour, minute, second, 0) => Ok(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
        )),
        Value::Date(year, month, day, hour, minute, second, micros) => Ok(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
        )),
        Value::Time(negative, days, hours, minutes, seconds, 0) => {
            let sign = if *negative { "-" } else { "" };
            let hours = u32::from(*hours) + days * 24;
            Ok(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}"))
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let hours = u32::from(*hours) + days * 24;
            Ok(format!(
                "{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
            ))
        }
    }
}
