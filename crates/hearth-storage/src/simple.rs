//! Table-agnostic CRUD helpers.
//!
//! Every helper takes the open transaction plus a table name and column
//! maps. Values are always bound as parameters; table and column names are
//! interpolated into the SQL text, so they are checked against
//! `[A-Za-z_][A-Za-z0-9_]*` first.
//!
//! Column maps are [`Record`]s (ordered by column name), which keeps the
//! generated SQL deterministic.

use rusqlite::types::Value;

use crate::errors::{Result, StorageError};
use crate::txn::{LoggingTransaction, Record};

/// Build a [`Record`] from `(column, value)` pairs.
pub fn record<I, K, V>(pairs: I) -> Record
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Transaction-level CRUD operations.
pub struct SimpleTxn;

impl SimpleTxn {
    /// `INSERT` one row.
    pub fn insert(txn: &mut LoggingTransaction<'_>, table: &str, values: &Record) -> Result<()> {
        if values.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "insert into {table} needs at least one column"
            )));
        }
        let cols = columns(values);
        check_identifiers(table, &cols)?;
        let _ = txn.execute(&insert_sql(table, &cols), &bind(values))?;
        Ok(())
    }

    /// `INSERT` many rows with one prepared statement.
    ///
    /// Every non-empty row must have the same columns; this is checked before
    /// any statement runs. An empty batch is a no-op.
    pub fn insert_many(txn: &mut LoggingTransaction<'_>, table: &str, rows: &[Record]) -> Result<()> {
        let mut rows = rows.iter().filter(|row| !row.is_empty());
        let Some(first) = rows.next() else {
            return Ok(());
        };
        let cols = columns(first);
        check_identifiers(table, &cols)?;

        let mut params = vec![bind(first)];
        for row in rows {
            if !row.keys().map(String::as_str).eq(cols.iter().copied()) {
                return Err(StorageError::InvalidArgument(format!(
                    "all rows inserted into {table} must have the same columns"
                )));
            }
            params.push(bind(row));
        }

        let _ = txn.execute_many(&insert_sql(table, &cols), &params)?;
        Ok(())
    }

    /// Update the row matching `keyvalues`, or insert one if none matches.
    ///
    /// The inserted row is `keyvalues` + `values` + `insertion_values`; an
    /// existing row only has its `values` columns changed. Returns whether a
    /// row was inserted.
    pub fn upsert(
        txn: &mut LoggingTransaction<'_>,
        table: &str,
        keyvalues: &Record,
        values: &Record,
        insertion_values: &Record,
        lock: bool,
    ) -> Result<bool> {
        require_keys(table, keyvalues)?;
        let keycols = columns(keyvalues);
        let setcols = columns(values);
        check_identifiers(table, &keycols)?;
        check_identifiers(table, &setcols)?;
        check_identifiers(table, &columns(insertion_values))?;

        if lock {
            txn.engine().lock_table(txn.connection(), table)?;
        }

        let existing = if setcols.is_empty() {
            let found = txn.fetch(&select_sql(table, &["1"], &keycols), &bind(keyvalues))?;
            found.len()
        } else {
            let mut args = bind(values);
            args.extend(bind(keyvalues));
            txn.execute(&update_sql(table, &setcols, &keycols), &args)?
        };
        if existing > 0 {
            return Ok(false);
        }

        let mut all = keyvalues.clone();
        all.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        all.extend(insertion_values.iter().map(|(k, v)| (k.clone(), v.clone())));
        let _ = txn.execute(&insert_sql(table, &columns(&all)), &bind(&all))?;
        Ok(true)
    }

    /// `SELECT` exactly one row.
    ///
    /// No match is [`StorageError::NotFound`] unless `allow_none`, in which
    /// case it is `Ok(None)`. More than one match is always a
    /// [`StorageError::Consistency`] error.
    pub fn select_one(
        txn: &mut LoggingTransaction<'_>,
        table: &str,
        keyvalues: &Record,
        retcols: &[&str],
        allow_none: bool,
    ) -> Result<Option<Record>> {
        require_keys(table, keyvalues)?;
        let keycols = columns(keyvalues);
        check_identifiers(table, &keycols)?;
        check_identifiers(table, retcols)?;

        let rows = txn.fetch(&select_sql(table, retcols, &keycols), &bind(keyvalues))?;
        match rows.len() {
            0 if allow_none => Ok(None),
            0 => Err(StorageError::not_found(table)),
            1 => Ok(rows.into_records().pop()),
            n => Err(StorageError::Consistency(format!(
                "{n} rows matched in {table}, expected one"
            ))),
        }
    }

    /// The first value of `retcol` among rows matching `keyvalues`.
    pub fn select_one_onecol(
        txn: &mut LoggingTransaction<'_>,
        table: &str,
        keyvalues: &Record,
        retcol: &str,
        allow_none: bool,
    ) -> Result<Option<Value>> {
        match Self::select_onecol(txn, table, keyvalues, retcol)?.into_iter().next() {
            Some(value) => Ok(Some(value)),
            None if allow_none => Ok(None),
            None => Err(StorageError::not_found(table)),
        }
    }

    /// `retcol` of every row matching `keyvalues`.
    pub fn select_onecol(
        txn: &mut LoggingTransaction<'_>,
        table: &str,
        keyvalues: &Record,
        retcol: &str,
    ) -> Result<Vec<Value>> {
        let keycols = columns(keyvalues);
        check_identifiers(table, &keycols)?;
        check_identifiers(table, &[retcol])?;
        let rows = txn.fetch(&select_sql(table, &[retcol], &keycols), &bind(keyvalues))?;
        Ok(rows.into_first_column())
    }

    /// Every row matching `keyvalues`; all rows when `keyvalues` is empty.
    pub fn select_list(
        txn: &mut LoggingTransaction<'_>,
        table: &str,
        keyvalues: &Record,
        retcols: &[&str],
    ) -> Result<Vec<Record>> {
        let keycols = columns(keyvalues);
        check_identifiers(table, &keycols)?;
        check_identifiers(table, retcols)?;
        let rows = txn.fetch(&select_sql(table, retcols, &keycols), &bind(keyvalues))?;
        Ok(rows.into_records())
    }

    /// `UPDATE` exactly one row.
    pub fn update_one(
        txn: &mut LoggingTransaction<'_>,
        table: &str,
        keyvalues: &Record,
        updatevalues: &Record,
    ) -> Result<()> {
        match Self::update(txn, table, keyvalues, updatevalues)? {
            0 => Err(StorageError::not_found(table)),
            1 => Ok(()),
            n => Err(StorageError::Consistency(format!(
                "{n} rows updated in {table}, expected one"
            ))),
        }
    }

    /// Read `retcols` of the row matching `keyvalues`, then apply
    /// `updatevalues` to it, in one transaction.
    ///
    /// Either step is skipped when its column list is empty. Updating zero
    /// rows is not an error; updating more than one is.
    pub fn select_update_one(
        txn: &mut LoggingTransaction<'_>,
        table: &str,
        keyvalues: &Record,
        updatevalues: &Record,
        retcols: &[&str],
        allow_none: bool,
    ) -> Result<Option<Record>> {
        let selected = if retcols.is_empty() {
            None
        } else {
            Self::select_one(txn, table, keyvalues, retcols, allow_none)?
        };

        if !updatevalues.is_empty() {
            let updated = Self::update(txn, table, keyvalues, updatevalues)?;
            if updated > 1 {
                return Err(StorageError::Consistency(format!(
                    "{updated} rows updated in {table}, expected at most one"
                )));
            }
        }
        Ok(selected)
    }

    /// `DELETE` exactly one row.
    pub fn delete_one(txn: &mut LoggingTransaction<'_>, table: &str, keyvalues: &Record) -> Result<()> {
        match Self::delete(txn, table, keyvalues)? {
            0 => Err(StorageError::not_found(table)),
            1 => Ok(()),
            n => Err(StorageError::Consistency(format!(
                "{n} rows deleted from {table}, expected one"
            ))),
        }
    }

    /// `DELETE` every row matching `keyvalues`. Returns the number deleted.
    pub fn delete(txn: &mut LoggingTransaction<'_>, table: &str, keyvalues: &Record) -> Result<usize> {
        require_keys(table, keyvalues)?;
        let keycols = columns(keyvalues);
        check_identifiers(table, &keycols)?;
        txn.execute(&delete_sql(table, &keycols), &bind(keyvalues))
    }

    /// Largest `id` in `table`, or 0 when the table is empty.
    pub fn max_id(txn: &mut LoggingTransaction<'_>, table: &str) -> Result<i64> {
        check_identifiers(table, &[])?;
        let rows = txn.fetch(&max_id_sql(table), &[])?;
        match rows.into_first_column().into_iter().next() {
            Some(Value::Integer(id)) => Ok(id),
            Some(Value::Null) | None => Ok(0),
            Some(other) => Err(StorageError::Consistency(format!(
                "max id of {table} is not an integer: {other:?}"
            ))),
        }
    }

    fn update(
        txn: &mut LoggingTransaction<'_>,
        table: &str,
        keyvalues: &Record,
        updatevalues: &Record,
    ) -> Result<usize> {
        require_keys(table, keyvalues)?;
        if updatevalues.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "update of {table} needs at least one column to set"
            )));
        }
        let keycols = columns(keyvalues);
        let setcols = columns(updatevalues);
        check_identifiers(table, &keycols)?;
        check_identifiers(table, &setcols)?;

        let mut args = bind(updatevalues);
        args.extend(bind(keyvalues));
        txn.execute(&update_sql(table, &setcols, &keycols), &args)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQL text
// ─────────────────────────────────────────────────────────────────────────────

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn check_identifiers(table: &str, cols: &[&str]) -> Result<()> {
    // "1" is the existence probe used by upsert.
    let bad = std::iter::once(table)
        .chain(cols.iter().copied().filter(|c| *c != "1"))
        .find(|name| !is_identifier(name));
    match bad {
        Some(name) => Err(StorageError::InvalidArgument(format!(
            "invalid identifier: {name:?}"
        ))),
        None => Ok(()),
    }
}

fn require_keys(table: &str, keyvalues: &Record) -> Result<()> {
    if keyvalues.is_empty() {
        return Err(StorageError::InvalidArgument(format!(
            "statement on {table} needs at least one key column"
        )));
    }
    Ok(())
}

fn columns(record: &Record) -> Vec<&str> {
    record.keys().map(String::as_str).collect()
}

fn bind(record: &Record) -> Vec<Value> {
    record.values().cloned().collect()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn where_clause(keycols: &[&str]) -> String {
    keycols
        .iter()
        .map(|k| format!("{k} = ?"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn insert_sql(table: &str, cols: &[&str]) -> String {
    format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        cols.join(", "),
        placeholders(cols.len())
    )
}

fn select_sql(table: &str, retcols: &[&str], keycols: &[&str]) -> String {
    let mut sql = format!("SELECT {} FROM {table}", retcols.join(", "));
    if !keycols.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause(keycols));
    }
    sql
}

fn update_sql(table: &str, setcols: &[&str], keycols: &[&str]) -> String {
    let set = setcols
        .iter()
        .map(|k| format!("{k} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE {table} SET {set} WHERE {}", where_clause(keycols))
}

fn delete_sql(table: &str, keycols: &[&str]) -> String {
    format!("DELETE FROM {table} WHERE {}", where_clause(keycols))
}

fn max_id_sql(table: &str) -> String {
    format!("SELECT MAX(id) AS id FROM {table}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
