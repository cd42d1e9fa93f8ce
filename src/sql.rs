use crate::config::Config;
use crate::dump::SnapshotDump;
use crate::error::{Error, Result};
use crate::schema::SyncColumns;

/// Renders the configured SQL templates against the column schema and packs
/// row batches into bounded `INSERT … ON DUPLICATE KEY UPDATE` statements.
///
/// Macro substitution: `$_TABLE` (backtick-quoted table name), `$_COLUMNS`
/// (backtick-quoted column list), `$_ALL_VALUES` (the
/// `col=VALUES(col), …` clause). The client insert template must contain a
/// literal `$_VALUES` marker splitting it into the packer's statement head
/// and foot.
#[derive(Debug, Clone)]
pub struct SqlTemplater {
    table: String,
    columns: SyncColumns,
    column_str: String,

    pub sync_client_before_full_update: Option<String>,
    pub sync_full_update: String,
    pub sync_single_update: String,

    pub lock_table: String,
    pub unlock_table: String,

    insert_head: String,
    insert_foot: String,
}

impl SqlTemplater {
    pub fn new(config: &Config) -> Result<Self> {
        let columns = SyncColumns::parse(&config.sync_columns)?;
        let table = format!("`{}`", config.sync_table_name);
        let column_str = columns.sql_list();

        let mut all_values = String::new();
        columns.append_set_all_values(&mut all_values);

        let template = |s: &str| -> String {
            s.replace("$_TABLE", &table)
                .replace("$_COLUMNS", &column_str)
                .replace("$_ALL_VALUES", &all_values)
        };

        let client_insert = template(&config.sync_client_insert);
        let Some((head, foot)) = client_insert.split_once("$_VALUES") else {
            return Err(Error::bad_config(
                "SyncClientInsert has no $_VALUES marker",
            ));
        };

        let before = template(&config.sync_client_before_full_update);

        Ok(Self {
            insert_head: head.to_string(),
            insert_foot: foot.to_string(),
            sync_client_before_full_update: (!before.is_empty()).then_some(before),
            sync_full_update: template(&config.sync_full_update),
            sync_single_update: template(&config.sync_single_update),
            lock_table: template("LOCK TABLES $_TABLE READ"),
            unlock_table: "UNLOCK TABLES".to_string(),
            table,
            columns,
            column_str,
        })
    }

    pub fn columns(&self) -> &SyncColumns {
        &self.columns
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn column_list(&self) -> &str {
        &self.column_str
    }

    /// Packs rows from the front of `rows` into one statement of at most
    /// `max_packet_size` bytes and returns it with the untouched remainder.
    ///
    /// At least one row is taken whenever `rows` is non-empty; a single row
    /// too wide for the bound still produces a (oversized) one-tuple
    /// statement, which is the caller's schema problem.
    pub fn client_insert_slice<'a>(
        &self,
        rows: &'a [Vec<String>],
        max_packet_size: usize,
    ) -> Result<(Option<String>, &'a [Vec<String>])> {
        let mut stmt = String::new();
        let mut tuple = String::new();
        let mut taken = 0;

        for row in rows {
            tuple.clear();
            self.columns.append_values(&mut tuple, row)?;
            if !self.push_tuple(&mut stmt, &tuple, taken, max_packet_size) {
                break;
            }
            taken += 1;
        }

        if taken == 0 {
            return Ok((None, rows));
        }
        stmt.push_str(&self.insert_foot);
        Ok((Some(stmt), &rows[taken..]))
    }

    /// Streaming variant of [`client_insert_slice`] fed by a snapshot dump.
    ///
    /// Returns the packed statement (if any rows remained) and whether the
    /// dump is exhausted. A row that does not fit is pushed back into the
    /// dump, so consecutive calls emit every record exactly once.
    ///
    /// [`client_insert_slice`]: Self::client_insert_slice
    pub async fn client_insert_dump(
        &self,
        dump: &mut SnapshotDump,
        max_packet_size: usize,
    ) -> Result<(Option<String>, bool)> {
        let mut stmt = String::new();
        let mut tuple = String::new();
        let mut taken = 0;

        let end = loop {
            let Some(row) = dump.next().await? else {
                break true;
            };
            tuple.clear();
            self.columns.append_values(&mut tuple, &row)?;
            if !self.push_tuple(&mut stmt, &tuple, taken, max_packet_size) {
                dump.push_back(row);
                break false;
            }
            taken += 1;
        };

        if taken == 0 {
            return Ok((None, end));
        }
        stmt.push_str(&self.insert_foot);
        Ok((Some(stmt), end))
    }

    /// Appends one rendered tuple unless doing so (plus the statement foot)
    /// would overflow the bound. The first tuple of a statement is always
    /// accepted.
    fn push_tuple(&self, stmt: &mut String, tuple: &str, taken: usize, max: usize) -> bool {
        if taken == 0 {
            stmt.push_str(&self.insert_head);
        } else {
            if stmt.len() + 1 + tuple.len() + self.insert_foot.len() > max {
                return false;
            }
            stmt.push(',');
        }
        stmt.push_str(tuple);
        true
    }
}
