use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
    time::{Duration, UNIX_EPOCH},
};

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("source stat failed: {0}")]
    Stat(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("no bips/bans table found in source database")]
    MissingTable,
    #[error("{0} table exists but is missing required columns")]
    MissingColumns(&'static str),
}

/// Aggregated ban history for one IP, ready to merge into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedBan {
    pub ban_count_total: i64,
    pub last_ban_ts: Option<i64>,
    pub last_ban_jail: String,
    pub last_ban_bantime: i64,
}

/// One historical ban episode, for the IP details panel.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub jail: String,
    pub timeofban: i64,
    pub bantime: i64,
    pub bancount: i64,
}

/// (mtime, size) of the source database, used to skip re-imports.
pub fn source_fingerprint(path: &Path) -> Result<(i64, u64), HistoryError> {
    let meta = std::fs::metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok((mtime, meta.len()))
}

/// Read-only open; the source has a live writer we must tolerate.
fn open_ro(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    conn.busy_timeout(Duration::from_secs(3))?;
    Ok(conn)
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|r| r.is_some())
}

fn columns(conn: &Connection, table: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(cols)
}

fn has_required(cols: &HashSet<String>) -> bool {
    ["ip", "jail", "timeofban"].iter().all(|c| cols.contains(*c))
}

/// Aggregate the whole source into per-IP totals. `bips` is preferred (one
/// row per ban episode, optionally carrying a running `bancount`); plain
/// `bans` falls back to row counting.
pub fn import_aggregates(path: &Path) -> Result<BTreeMap<String, ImportedBan>, HistoryError> {
    let conn = open_ro(path)?;

    let (table, totals_sql): (&'static str, String) = if table_exists(&conn, "bips")? {
        let cols = columns(&conn, "bips")?;
        if !has_required(&cols) {
            return Err(HistoryError::MissingColumns("bips"));
        }
        let total = if cols.contains("bancount") {
            "SUM(bancount)"
        } else {
            "COUNT(*)"
        };
        (
            "bips",
            format!(
                "SELECT ip, {total} AS ban_count_total, MAX(timeofban) AS last_ban_ts \
                 FROM bips GROUP BY ip"
            ),
        )
    } else if table_exists(&conn, "bans")? {
        let cols = columns(&conn, "bans")?;
        if !has_required(&cols) {
            return Err(HistoryError::MissingColumns("bans"));
        }
        (
            "bans",
            "SELECT ip, COUNT(*) AS ban_count_total, MAX(timeofban) AS last_ban_ts \
             FROM bans GROUP BY ip"
                .to_owned(),
        )
    } else {
        return Err(HistoryError::MissingTable);
    };

    let mut out = BTreeMap::new();
    let mut totals = conn.prepare(&totals_sql)?;
    let mut last_row = conn.prepare(&format!(
        "SELECT jail, bantime FROM {table} WHERE ip=?1 ORDER BY timeofban DESC LIMIT 1"
    ))?;

    let mut rows = totals.query([])?;
    while let Some(row) = rows.next()? {
        let ip: String = row.get(0)?;
        let ban_count_total: i64 = row.get::<_, Option<i64>>(1)?.unwrap_or(0);
        let last_ban_ts: Option<i64> = row.get(2)?;

        let (last_ban_jail, last_ban_bantime) = last_row
            .query_row([&ip], |r| {
                Ok((
                    r.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    r.get::<_, Option<i64>>(1)?.unwrap_or(0),
                ))
            })
            .optional()?
            .unwrap_or_default();

        out.insert(
            ip,
            ImportedBan {
                ban_count_total,
                last_ban_ts,
                last_ban_jail,
                last_ban_bantime,
            },
        );
    }
    Ok(out)
}

/// Per-ban history rows for one IP, newest first. Empty when the source has
/// no usable table.
pub fn fetch_ip_history(
    path: &Path,
    ip: &str,
    limit: Option<usize>,
) -> Result<Vec<HistoryRow>, HistoryError> {
    let conn = open_ro(path)?;

    let base = if table_exists(&conn, "bips")? {
        let cols = columns(&conn, "bips")?;
        if !has_required(&cols) {
            return Ok(Vec::new());
        }
        if cols.contains("bancount") {
            "SELECT jail, timeofban, bantime, bancount FROM bips WHERE ip=?1 \
             ORDER BY timeofban DESC"
        } else {
            "SELECT jail, timeofban, bantime, 1 AS bancount FROM bips WHERE ip=?1 \
             ORDER BY timeofban DESC"
        }
    } else if table_exists(&conn, "bans")? {
        let cols = columns(&conn, "bans")?;
        if !has_required(&cols) {
            return Ok(Vec::new());
        }
        "SELECT jail, timeofban, bantime, 1 AS bancount FROM bans WHERE ip=?1 \
         ORDER BY timeofban DESC"
    } else {
        return Ok(Vec::new());
    };

    let sql = match limit {
        Some(n) => format!("{base} LIMIT {n}"),
        None => base.to_owned(),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([ip], |r| {
            Ok(HistoryRow {
                jail: r.get::<_, Option<String>>(0)?.unwrap_or_default(),
                timeofban: r.get::<_, Option<i64>>(1)?.unwrap_or(0),
                bantime: r.get::<_, Option<i64>>(2)?.unwrap_or(0),
                bancount: r.get::<_, Option<i64>>(3)?.unwrap_or(1),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bips_fixture(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("fail2ban.sqlite3");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE bips (
                 ip TEXT, jail TEXT, timeofban INTEGER, bantime INTEGER, bancount INTEGER
             );
             INSERT INTO bips VALUES ('192.0.2.9', 'sshd', 1700000000, 600, 3);
             INSERT INTO bips VALUES ('192.0.2.9', 'postfix', 1600000000, 300, 1);
             INSERT INTO bips VALUES ('198.51.100.7', 'sshd', 1650000000, 600, 2);",
        )
        .unwrap();
        path
    }

    #[test]
    fn aggregates_bips_with_bancount() {
        let dir = tempfile::tempdir().unwrap();
        let path = bips_fixture(dir.path());

        let agg = import_aggregates(&path).unwrap();
        assert_eq!(agg.len(), 2);
        let nine = &agg["192.0.2.9"];
        assert_eq!(nine.ban_count_total, 4); // 3 + 1
        assert_eq!(nine.last_ban_ts, Some(1700000000));
        assert_eq!(nine.last_ban_jail, "sshd");
        assert_eq!(nine.last_ban_bantime, 600);
    }

    #[test]
    fn aggregates_bips_without_bancount_by_counting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f2b.sqlite3");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE bips (ip TEXT, jail TEXT, timeofban INTEGER, bantime INTEGER);
             INSERT INTO bips VALUES ('192.0.2.9', 'sshd', 10, 60);
             INSERT INTO bips VALUES ('192.0.2.9', 'sshd', 20, 60);",
        )
        .unwrap();

        let agg = import_aggregates(&path).unwrap();
        assert_eq!(agg["192.0.2.9"].ban_count_total, 2);
        assert_eq!(agg["192.0.2.9"].last_ban_ts, Some(20));
    }

    #[test]
    fn falls_back_to_bans_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f2b.sqlite3");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE bans (ip TEXT, jail TEXT, timeofban INTEGER, bantime INTEGER);
             INSERT INTO bans VALUES ('203.0.113.5', 'sshd', 100, 60);
             INSERT INTO bans VALUES ('203.0.113.5', 'recidive', 200, 600);",
        )
        .unwrap();

        let agg = import_aggregates(&path).unwrap();
        let five = &agg["203.0.113.5"];
        assert_eq!(five.ban_count_total, 2);
        assert_eq!(five.last_ban_ts, Some(200));
        assert_eq!(five.last_ban_jail, "recidive");
    }

    #[test]
    fn missing_tables_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f2b.sqlite3");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE unrelated (x);")
            .unwrap();
        assert!(matches!(
            import_aggregates(&path),
            Err(HistoryError::MissingTable)
        ));
    }

    #[test]
    fn missing_columns_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f2b.sqlite3");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE bips (ip TEXT);")
            .unwrap();
        assert!(matches!(
            import_aggregates(&path),
            Err(HistoryError::MissingColumns("bips"))
        ));
    }

    #[test]
    fn history_rows_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = bips_fixture(dir.path());

        let rows = fetch_ip_history(&path, "192.0.2.9", None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timeofban, 1700000000);
        assert_eq!(rows[0].jail, "sshd");
        assert_eq!(rows[1].jail, "postfix");

        let rows = fetch_ip_history(&path, "192.0.2.9", Some(1)).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn fingerprint_tracks_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = bips_fixture(dir.path());
        let (mtime, size) = source_fingerprint(&path).unwrap();
        assert!(mtime > 0);
        assert!(size > 0);
    }
}
