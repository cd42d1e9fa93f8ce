use crate::error::{Error, Result};

/// One column of the replicated table.
///
/// A leading `$` in the column spec marks a string column whose values are
/// emitted as quoted SQL literals; every other column's values are emitted
/// verbatim (decimal text from the authoritative database).
#[derive(Debug, Clone)]
pub struct SyncColumn {
    pub name: String,
    pub sql_name: String,
    pub is_string: bool,
}

impl SyncColumn {
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.is_empty() {
            return Err(Error::bad_config("empty column name"));
        }
        let (name, is_string) = match spec.strip_prefix('$') {
            Some(rest) if rest.is_empty() => {
                return Err(Error::bad_config("empty column name"));
            }
            Some(rest) => (rest, true),
            None => (spec, false),
        };
        Ok(Self {
            name: name.to_string(),
            sql_name: format!("`{name}`"),
            is_string,
        })
    }
}

/// Ordered column schema. Fixed for the process lifetime; every row payload
/// in the system is positional against this order.
#[derive(Debug, Clone)]
pub struct SyncColumns(Vec<SyncColumn>);

impl SyncColumns {
    /// Parses a comma-separated list such as `id,$name,$ts,count`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut columns = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            let column = SyncColumn::parse(part)
                .map_err(|err| Error::bad_config(format!("parse '{part}': {err}")))?;
            columns.push(column);
        }
        Ok(Self(columns))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncColumn> {
        self.0.iter()
    }

    /// Comma-separated backtick-quoted column list for `$_COLUMNS`.
    pub fn sql_list(&self) -> String {
        let names: Vec<&str> = self.0.iter().map(|c| c.sql_name.as_str()).collect();
        names.join(",")
    }

    /// Appends one `(v1,…,vk)` tuple to `out`.
    ///
    /// String columns are single-quoted with embedded `'` doubled; numeric
    /// columns are written as-is. Values come pre-validated from the
    /// authoritative database and must not contain control characters that
    /// break MySQL literal syntax.
    pub fn append_values(&self, out: &mut String, row: &[String]) -> Result<()> {
        if row.len() != self.0.len() {
            return Err(Error::ColumnMismatch {
                got: row.len(),
                want: self.0.len(),
            });
        }
        out.push('(');
        for (i, (column, value)) in self.0.iter().zip(row).enumerate() {
            if i > 0 {
                out.push(',');
            }
            if column.is_string {
                out.reserve(value.len() + 2);
                out.push('\'');
                let mut first = true;
                for part in value.split('\'') {
                    if !first {
                        out.push_str("''");
                    }
                    out.push_str(part);
                    first = false;
                }
                out.push('\'');
            } else {
                out.push_str(value);
            }
        }
        out.push(')');
        Ok(())
    }

    /// Appends the `col=VALUES(col), …` clause used after
    /// `ON DUPLICATE KEY UPDATE`.
    pub fn append_set_all_values(&self, out: &mut String) {
        for (i, column) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&column.sql_name);
            out.push_str("=VALUES(");
            out.push_str(&column.name);
            out.push(')');
        }
    }
}
