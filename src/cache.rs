//! Persistent relational cache of per-IP / per-subnet / per-ASN aggregates.

use std::{collections::HashMap, net::Ipv4Addr, path::Path, time::Duration};

use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    model::{now_ts, AsnInfo, AsnSummaryRow, EventKind, IpRow, SubnetRow},
    subnet::SubnetMask,
};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS ip_cache (
    ip TEXT PRIMARY KEY,
    ip_sort_key INTEGER NOT NULL DEFAULT 0,
    first_seen_ts INTEGER NOT NULL,
    last_seen_ts INTEGER NOT NULL,
    fails INTEGER NOT NULL DEFAULT 0,
    oks INTEGER NOT NULL DEFAULT 0,
    bans INTEGER NOT NULL DEFAULT 0,
    unbans INTEGER NOT NULL DEFAULT 0,
    last_event TEXT NOT NULL DEFAULT '',
    last_jail TEXT NOT NULL DEFAULT '',
    last_ban_ts INTEGER NULL,
    last_ban_jail TEXT NOT NULL DEFAULT '',
    ban_count_total INTEGER NOT NULL DEFAULT 0,
    provider_asn TEXT NOT NULL DEFAULT '',
    provider_cc TEXT NOT NULL DEFAULT '',
    provider_name TEXT NOT NULL DEFAULT '',
    provider_fetched_ts INTEGER NULL
);

CREATE TABLE IF NOT EXISTS subnet_cache (
    subnet TEXT PRIMARY KEY,
    prefix INTEGER NOT NULL,
    first_seen_ts INTEGER NOT NULL,
    last_seen_ts INTEGER NOT NULL,
    fails INTEGER NOT NULL DEFAULT 0,
    bans INTEGER NOT NULL DEFAULT 0,
    unbans INTEGER NOT NULL DEFAULT 0,
    unique_ips INTEGER NOT NULL DEFAULT 0,
    last_ip TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS subnet_ip (
    subnet TEXT NOT NULL,
    ip TEXT NOT NULL,
    first_seen_ts INTEGER NOT NULL,
    last_seen_ts INTEGER NOT NULL,
    PRIMARY KEY (subnet, ip)
);

CREATE TABLE IF NOT EXISTS asn_cache (
    ip TEXT PRIMARY KEY,
    asn TEXT NOT NULL,
    cc TEXT NOT NULL,
    as_name TEXT NOT NULL,
    fetched_ts INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS import_state (
    k TEXT PRIMARY KEY,
    v TEXT NOT NULL
);
";

const IP_COLS: &str = "ip, first_seen_ts, last_seen_ts, fails, oks, bans, unbans, \
     last_event, last_jail, last_ban_ts, last_ban_jail, ban_count_total, \
     provider_asn, provider_cc, provider_name, provider_fetched_ts";

const SUBNET_COLS: &str =
    "subnet, prefix, first_seen_ts, last_seen_ts, fails, bans, unbans, unique_ips, last_ip";

/// Dotted-quad TEXT sorts lexicographically ("10.0.0.1" < "2.0.0.1"), so
/// every ascending-address walk orders by this numeric key instead.
fn ip_sort_key(ip: Ipv4Addr) -> i64 {
    i64::from(u32::from(ip))
}

pub struct CacheStore {
    conn: Connection,
}

impl CacheStore {
    pub fn open(path: &Path) -> rusqlite::Result<CacheStore> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> rusqlite::Result<CacheStore> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<CacheStore> {
        conn.busy_timeout(Duration::from_secs(3))?;
        // journal_mode returns the resulting mode as a row.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(CacheStore { conn })
    }

    /// Mutations accumulate in one open transaction until [`commit`] or
    /// [`rollback`]; the engine owns the cadence.
    fn begin_if_needed(&self) -> rusqlite::Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    pub fn commit(&self) -> rusqlite::Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    pub fn rollback(&self) -> rusqlite::Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn set_state(&self, k: &str, v: &str) -> rusqlite::Result<()> {
        self.begin_if_needed()?;
        self.conn.execute(
            "INSERT INTO import_state(k,v) VALUES(?1,?2) \
             ON CONFLICT(k) DO UPDATE SET v=excluded.v",
            params![k, v],
        )?;
        Ok(())
    }

    pub fn get_state(&self, k: &str) -> rusqlite::Result<Option<String>> {
        self.conn
            .query_row("SELECT v FROM import_state WHERE k=?1", [k], |r| r.get(0))
            .optional()
    }

    /// Apply one live observation: bump exactly one counter on the IP row,
    /// stamp last_* fields, and roll the subnet aggregates forward. OK events
    /// only count when `count_ok` is set; they never touch subnet counters.
    pub fn upsert_ip_event(
        &self,
        ip: Ipv4Addr,
        ts: i64,
        kind: EventKind,
        jail: &str,
        count_ok: bool,
        mask: SubnetMask,
    ) -> rusqlite::Result<()> {
        let inc_f = i64::from(kind == EventKind::Fail);
        let inc_o = i64::from(kind == EventKind::Ok && count_ok);
        let inc_b = i64::from(kind == EventKind::Ban);
        let inc_u = i64::from(kind == EventKind::Unban);

        self.begin_if_needed()?;
        self.conn.execute(
            "INSERT INTO ip_cache(ip, ip_sort_key, first_seen_ts, last_seen_ts, fails, oks, \
                                  bans, unbans, last_event, last_jail)
             VALUES(?1,?2,?3,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(ip) DO UPDATE SET
                 last_seen_ts=excluded.last_seen_ts,
                 fails=fails + ?4,
                 oks=oks + ?5,
                 bans=bans + ?6,
                 unbans=unbans + ?7,
                 last_event=excluded.last_event,
                 last_jail=excluded.last_jail",
            params![
                ip.to_string(),
                ip_sort_key(ip),
                ts,
                inc_f,
                inc_o,
                inc_b,
                inc_u,
                kind.as_str(),
                jail
            ],
        )?;

        let subnet = mask.apply(ip).to_string();
        self.upsert_subnet_ip(&subnet, &ip.to_string(), ts)?;
        self.conn.execute(
            "INSERT INTO subnet_cache(subnet, prefix, first_seen_ts, last_seen_ts, fails, bans, \
                                      unbans, unique_ips, last_ip)
             VALUES(?1,?2,?3,?3,?4,?5,?6,0,?7)
             ON CONFLICT(subnet) DO UPDATE SET
                 last_seen_ts=CASE WHEN excluded.last_seen_ts>subnet_cache.last_seen_ts
                                   THEN excluded.last_seen_ts ELSE subnet_cache.last_seen_ts END,
                 fails=fails + ?4,
                 bans=bans + ?5,
                 unbans=unbans + ?6,
                 last_ip=excluded.last_ip",
            params![
                subnet,
                i64::from(mask.prefix_bits()),
                ts,
                inc_f,
                inc_b,
                inc_u,
                ip.to_string()
            ],
        )?;
        Ok(())
    }

    fn upsert_subnet_ip(&self, subnet: &str, ip: &str, ts: i64) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO subnet_ip(subnet, ip, first_seen_ts, last_seen_ts)
             VALUES(?1,?2,?3,?3)
             ON CONFLICT(subnet, ip) DO UPDATE SET
                 last_seen_ts=CASE WHEN excluded.last_seen_ts>subnet_ip.last_seen_ts
                                   THEN excluded.last_seen_ts ELSE subnet_ip.last_seen_ts END",
            params![subnet, ip, ts],
        )?;
        Ok(())
    }

    /// Merge historical aggregates: totals take the max, last-ban fields
    /// adopt the incoming value only when strictly newer. Safe to re-apply.
    pub fn upsert_imported_bips(
        &self,
        ip: Ipv4Addr,
        ban_count_total: i64,
        last_ban_ts: Option<i64>,
        last_ban_jail: &str,
        mask: SubnetMask,
    ) -> rusqlite::Result<()> {
        let ts = now_ts();
        self.begin_if_needed()?;
        self.conn.execute(
            "INSERT INTO ip_cache(ip, ip_sort_key, first_seen_ts, last_seen_ts, ban_count_total, \
                                  last_ban_ts, last_ban_jail)
             VALUES(?1,?2,?3,?3,?4,?5,?6)
             ON CONFLICT(ip) DO UPDATE SET
                 ban_count_total=CASE WHEN excluded.ban_count_total>ip_cache.ban_count_total
                                      THEN excluded.ban_count_total ELSE ip_cache.ban_count_total END,
                 last_ban_ts=CASE
                     WHEN excluded.last_ban_ts IS NULL THEN ip_cache.last_ban_ts
                     WHEN ip_cache.last_ban_ts IS NULL THEN excluded.last_ban_ts
                     WHEN excluded.last_ban_ts>ip_cache.last_ban_ts THEN excluded.last_ban_ts
                     ELSE ip_cache.last_ban_ts
                 END,
                 last_ban_jail=CASE
                     WHEN excluded.last_ban_ts IS NULL THEN ip_cache.last_ban_jail
                     WHEN ip_cache.last_ban_ts IS NULL THEN excluded.last_ban_jail
                     WHEN excluded.last_ban_ts>ip_cache.last_ban_ts THEN excluded.last_ban_jail
                     ELSE ip_cache.last_ban_jail
                 END,
                 last_seen_ts=CASE
                     WHEN excluded.last_ban_ts IS NULL THEN ip_cache.last_seen_ts
                     WHEN excluded.last_ban_ts>ip_cache.last_seen_ts THEN excluded.last_ban_ts
                     ELSE ip_cache.last_seen_ts
                 END",
            params![
                ip.to_string(),
                ip_sort_key(ip),
                ts,
                ban_count_total,
                last_ban_ts,
                last_ban_jail
            ],
        )?;

        if let Some(ban_ts) = last_ban_ts {
            let subnet = mask.apply(ip).to_string();
            self.upsert_subnet_ip(&subnet, &ip.to_string(), ban_ts)?;
            self.conn.execute(
                "INSERT INTO subnet_cache(subnet, prefix, first_seen_ts, last_seen_ts, \
                                          unique_ips, last_ip)
                 VALUES(?1,?2,?3,?3,0,?4)
                 ON CONFLICT(subnet) DO UPDATE SET
                     last_seen_ts=CASE WHEN excluded.last_seen_ts>subnet_cache.last_seen_ts
                                       THEN excluded.last_seen_ts ELSE subnet_cache.last_seen_ts END,
                     last_ip=excluded.last_ip",
                params![subnet, i64::from(mask.prefix_bits()), ban_ts, ip.to_string()],
            )?;
        }
        Ok(())
    }

    /// Restore `unique_ips = COUNT(DISTINCT ip)` for every subnet after a
    /// batch of inserts.
    pub fn refresh_subnet_unique_counts(&self) -> rusqlite::Result<()> {
        self.begin_if_needed()?;
        self.conn.execute(
            "UPDATE subnet_cache SET unique_ips = \
                 (SELECT COUNT(*) FROM subnet_ip WHERE subnet_ip.subnet = subnet_cache.subnet)",
            [],
        )?;
        Ok(())
    }

    /// Rewrite asn_cache rows and re-hydrate the denormalized provider_*
    /// columns of matching ip_cache rows. Returns (asked, written).
    pub fn upsert_asn_info(
        &self,
        lookups: &HashMap<String, AsnInfo>,
    ) -> rusqlite::Result<(usize, usize)> {
        let asked = lookups.len();
        let mut written = 0;
        self.begin_if_needed()?;
        let mut asn_stmt = self.conn.prepare_cached(
            "INSERT INTO asn_cache(ip, asn, cc, as_name, fetched_ts)
             VALUES(?1,?2,?3,?4,?5)
             ON CONFLICT(ip) DO UPDATE SET
                 asn=excluded.asn,
                 cc=excluded.cc,
                 as_name=excluded.as_name,
                 fetched_ts=excluded.fetched_ts",
        )?;
        let mut ip_stmt = self.conn.prepare_cached(
            "UPDATE ip_cache
             SET provider_asn=?1, provider_cc=?2, provider_name=?3, provider_fetched_ts=?4
             WHERE ip=?5",
        )?;
        for (ip, info) in lookups {
            asn_stmt.execute(params![ip, info.asn, info.cc, info.as_name, info.fetched_ts])?;
            ip_stmt.execute(params![info.asn, info.cc, info.as_name, info.fetched_ts, ip])?;
            written += 1;
        }
        Ok((asked, written))
    }

    /// IPs whose ASN record is absent or older than `min_fetched_ts`, walked
    /// in ascending numeric address order strictly after `cursor`.
    pub fn list_ips_needing_asn_refresh(
        &self,
        cursor: Option<&str>,
        batch: usize,
        min_fetched_ts: i64,
    ) -> rusqlite::Result<Vec<String>> {
        let cursor_key: Option<i64> = cursor
            .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
            .map(ip_sort_key);
        let mut stmt = self.conn.prepare_cached(
            "SELECT i.ip FROM ip_cache i
             LEFT JOIN asn_cache a ON a.ip = i.ip
             WHERE (a.ip IS NULL OR a.fetched_ts < ?1)
               AND (?2 IS NULL OR i.ip_sort_key > ?2)
             ORDER BY i.ip_sort_key ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![min_fetched_ts, cursor_key, batch as i64], |r| {
                r.get(0)
            })?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    pub fn list_realtime_seed_ips(&self, n: usize) -> rusqlite::Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn
            .prepare_cached("SELECT ip FROM ip_cache ORDER BY last_seen_ts DESC LIMIT ?1")?;
        let rows = stmt
            .query_map([n as i64], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    pub fn list_ip_cache(&self, search: &str, limit: usize) -> rusqlite::Result<Vec<IpRow>> {
        let order = "ORDER BY ban_count_total DESC, bans DESC, fails DESC, last_seen_ts DESC";
        if search.is_empty() {
            let sql = format!("SELECT {IP_COLS} FROM ip_cache {order} LIMIT ?1");
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([limit as i64], ip_row_from)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            return Ok(rows);
        }
        let like = like_pattern(search);
        let sql = format!(
            "SELECT {IP_COLS} FROM ip_cache
             WHERE lower(ip) LIKE ?1 OR lower(provider_name) LIKE ?1 OR lower(provider_asn) LIKE ?1
             {order} LIMIT ?2"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![like, limit as i64], ip_row_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_top_subnets(&self, top_n: usize, search: &str) -> rusqlite::Result<Vec<SubnetRow>> {
        let order = "ORDER BY (bans + fails) DESC, unique_ips DESC, last_seen_ts DESC";
        if search.is_empty() {
            let sql = format!("SELECT {SUBNET_COLS} FROM subnet_cache {order} LIMIT ?1");
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([top_n as i64], subnet_row_from)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            return Ok(rows);
        }
        let sql = format!(
            "SELECT {SUBNET_COLS} FROM subnet_cache WHERE lower(subnet) LIKE ?1 {order} LIMIT ?2"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![like_pattern(search), top_n as i64], subnet_row_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_asn_summary(
        &self,
        search: &str,
        limit: usize,
    ) -> rusqlite::Result<Vec<AsnSummaryRow>> {
        let select = "SELECT provider_asn AS asn,
                    MAX(provider_name) AS as_name,
                    MAX(provider_cc) AS cc,
                    COUNT(*) AS ip_count,
                    SUM(ban_count_total) AS ban_total_sum,
                    SUM(bans) AS bans_sum,
                    SUM(fails) AS fails_sum,
                    MAX(provider_fetched_ts) AS last_fetch_ts
             FROM ip_cache";
        let tail = "GROUP BY provider_asn
             ORDER BY ban_total_sum DESC, bans_sum DESC, fails_sum DESC, ip_count DESC
             LIMIT";
        if search.is_empty() {
            let sql = format!("{select} WHERE provider_asn <> '' {tail} ?1");
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([limit as i64], asn_summary_from)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            return Ok(rows);
        }
        let sql = format!(
            "{select}
             WHERE provider_asn <> '' AND (lower(provider_asn) LIKE ?1
                OR lower(provider_name) LIKE ?1 OR lower(provider_cc) LIKE ?1)
             {tail} ?2"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![like_pattern(search), limit as i64], asn_summary_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_ip_row(&self, ip: &str) -> rusqlite::Result<Option<IpRow>> {
        let sql = format!("SELECT {IP_COLS} FROM ip_cache WHERE ip=?1");
        self.conn
            .query_row(&sql, [ip], ip_row_from)
            .optional()
    }

    pub fn get_subnet_row(&self, subnet: &str) -> rusqlite::Result<Option<SubnetRow>> {
        let sql = format!("SELECT {SUBNET_COLS} FROM subnet_cache WHERE subnet=?1");
        self.conn
            .query_row(&sql, [subnet], subnet_row_from)
            .optional()
    }

    pub fn list_ips_in_subnet(&self, subnet: &str, limit: usize) -> rusqlite::Result<Vec<IpRow>> {
        let cols: String = IP_COLS
            .split(", ")
            .map(|c| format!("i.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {cols}
             FROM subnet_ip s
             JOIN ip_cache i ON i.ip = s.ip
             WHERE s.subnet = ?1
             ORDER BY i.ban_count_total DESC, i.bans DESC, i.fails DESC, s.last_seen_ts DESC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![subnet, limit as i64], ip_row_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_ips_in_asn(&self, asn: &str, limit: usize) -> rusqlite::Result<Vec<IpRow>> {
        let sql = format!(
            "SELECT {IP_COLS} FROM ip_cache WHERE provider_asn = ?1
             ORDER BY ban_count_total DESC, bans DESC, fails DESC, last_seen_ts DESC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![asn, limit as i64], ip_row_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn like_pattern(search: &str) -> String {
    format!("%{}%", search.to_lowercase())
}

fn ip_row_from(r: &rusqlite::Row) -> rusqlite::Result<IpRow> {
    Ok(IpRow {
        ip: r.get(0)?,
        first_seen_ts: r.get(1)?,
        last_seen_ts: r.get(2)?,
        fails: r.get(3)?,
        oks: r.get(4)?,
        bans: r.get(5)?,
        unbans: r.get(6)?,
        last_event: r.get(7)?,
        last_jail: r.get(8)?,
        last_ban_ts: r.get(9)?,
        last_ban_jail: r.get(10)?,
        ban_count_total: r.get(11)?,
        provider_asn: r.get(12)?,
        provider_cc: r.get(13)?,
        provider_name: r.get(14)?,
        provider_fetched_ts: r.get(15)?,
    })
}

fn subnet_row_from(r: &rusqlite::Row) -> rusqlite::Result<SubnetRow> {
    Ok(SubnetRow {
        subnet: r.get(0)?,
        prefix: r.get(1)?,
        first_seen_ts: r.get(2)?,
        last_seen_ts: r.get(3)?,
        fails: r.get(4)?,
        bans: r.get(5)?,
        unbans: r.get(6)?,
        unique_ips: r.get(7)?,
        last_ip: r.get(8)?,
    })
}

fn asn_summary_from(r: &rusqlite::Row) -> rusqlite::Result<AsnSummaryRow> {
    Ok(AsnSummaryRow {
        asn: r.get(0)?,
        as_name: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
        cc: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
        ip_count: r.get(3)?,
        ban_total_sum: r.get::<_, Option<i64>>(4)?.unwrap_or(0),
        bans_sum: r.get::<_, Option<i64>>(5)?.unwrap_or(0),
        fails_sum: r.get::<_, Option<i64>>(6)?.unwrap_or(0),
        last_fetch_ts: r.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subnet::SubnetMask;

    fn store() -> CacheStore {
        CacheStore::open_in_memory().unwrap()
    }

    fn mask24() -> SubnetMask {
        SubnetMask::new(24)
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn fail_event_creates_ip_and_subnet_rows() {
        let store = store();
        store
            .upsert_ip_event(ip("203.0.113.5"), 100, EventKind::Fail, "", false, mask24())
            .unwrap();
        store.refresh_subnet_unique_counts().unwrap();
        store.commit().unwrap();

        let row = store.get_ip_row("203.0.113.5").unwrap().unwrap();
        assert_eq!(row.fails, 1);
        assert_eq!(row.oks, 0);
        assert_eq!(row.bans, 0);
        assert_eq!(row.unbans, 0);
        assert_eq!(row.first_seen_ts, 100);
        assert_eq!(row.last_seen_ts, 100);
        assert_eq!(row.last_event, "FAIL");

        let sub = store.get_subnet_row("203.0.113.0/24").unwrap().unwrap();
        assert_eq!(sub.fails, 1);
        assert_eq!(sub.prefix, 24);
        assert_eq!(sub.unique_ips, 1);
        assert_eq!(sub.last_ip, "203.0.113.5");
    }

    #[test]
    fn ban_then_unban_tracks_last_event() {
        let store = store();
        store
            .upsert_ip_event(ip("198.51.100.7"), 10, EventKind::Ban, "sshd", false, mask24())
            .unwrap();
        store
            .upsert_ip_event(ip("198.51.100.7"), 20, EventKind::Unban, "sshd", false, mask24())
            .unwrap();

        let row = store.get_ip_row("198.51.100.7").unwrap().unwrap();
        assert_eq!(row.bans, 1);
        assert_eq!(row.unbans, 1);
        assert_eq!(row.last_event, "UNBAN");
        assert_eq!(row.last_jail, "sshd");
        assert_eq!(row.first_seen_ts, 10);
        assert_eq!(row.last_seen_ts, 20);
    }

    #[test]
    fn ok_events_respect_count_flag_and_skip_subnet_counters() {
        let store = store();
        store
            .upsert_ip_event(ip("192.0.2.1"), 10, EventKind::Ok, "", false, mask24())
            .unwrap();
        let row = store.get_ip_row("192.0.2.1").unwrap().unwrap();
        assert_eq!(row.oks, 0);
        assert_eq!(row.last_event, "OK");

        store
            .upsert_ip_event(ip("192.0.2.1"), 11, EventKind::Ok, "", true, mask24())
            .unwrap();
        let row = store.get_ip_row("192.0.2.1").unwrap().unwrap();
        assert_eq!(row.oks, 1);

        let sub = store.get_subnet_row("192.0.2.0/24").unwrap().unwrap();
        assert_eq!(sub.fails + sub.bans + sub.unbans, 0);
    }

    #[test]
    fn unique_counts_restored_after_refresh() {
        let store = store();
        for (addr, ts) in [("10.0.0.1", 1), ("10.0.0.2", 2), ("10.0.0.2", 3)] {
            store
                .upsert_ip_event(ip(addr), ts, EventKind::Fail, "", false, mask24())
                .unwrap();
        }
        store.refresh_subnet_unique_counts().unwrap();
        let sub = store.get_subnet_row("10.0.0.0/24").unwrap().unwrap();
        assert_eq!(sub.unique_ips, 2);
        assert_eq!(sub.fails, 3);
    }

    #[test]
    fn imported_bips_merge_is_idempotent() {
        let store = store();
        for _ in 0..2 {
            store
                .upsert_imported_bips(ip("192.0.2.9"), 3, Some(1700000000), "sshd", mask24())
                .unwrap();
        }
        let row = store.get_ip_row("192.0.2.9").unwrap().unwrap();
        assert_eq!(row.ban_count_total, 3);
        assert_eq!(row.last_ban_ts, Some(1700000000));
        assert_eq!(row.last_ban_jail, "sshd");

        // An older import never regresses the merged fields.
        store
            .upsert_imported_bips(ip("192.0.2.9"), 2, Some(1600000000), "postfix", mask24())
            .unwrap();
        let row = store.get_ip_row("192.0.2.9").unwrap().unwrap();
        assert_eq!(row.ban_count_total, 3);
        assert_eq!(row.last_ban_ts, Some(1700000000));
        assert_eq!(row.last_ban_jail, "sshd");
    }

    #[test]
    fn imported_bips_without_ts_leaves_subnets_alone() {
        let store = store();
        store
            .upsert_imported_bips(ip("192.0.2.9"), 1, None, "", mask24())
            .unwrap();
        assert!(store.get_subnet_row("192.0.2.0/24").unwrap().is_none());
        let row = store.get_ip_row("192.0.2.9").unwrap().unwrap();
        assert_eq!(row.ban_count_total, 1);
        assert_eq!(row.last_ban_ts, None);
    }

    #[test]
    fn asn_upsert_rehydrates_provider_columns() {
        let store = store();
        store
            .upsert_ip_event(ip("192.0.2.9"), 10, EventKind::Fail, "", false, mask24())
            .unwrap();

        let mut lookups = HashMap::new();
        lookups.insert(
            "192.0.2.9".to_owned(),
            AsnInfo {
                asn: "64500".to_owned(),
                cc: "US".to_owned(),
                as_name: "EXAMPLE".to_owned(),
                fetched_ts: 1700000500,
            },
        );
        let (asked, written) = store.upsert_asn_info(&lookups).unwrap();
        assert_eq!((asked, written), (1, 1));

        // Applying the same map again leaves the state unchanged.
        store.upsert_asn_info(&lookups).unwrap();

        let row = store.get_ip_row("192.0.2.9").unwrap().unwrap();
        assert_eq!(row.provider_asn, "64500");
        assert_eq!(row.provider_cc, "US");
        assert_eq!(row.provider_name, "EXAMPLE");
        assert_eq!(row.provider_fetched_ts, Some(1700000500));

        let summary = store.list_asn_summary("", 10).unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].asn, "64500");
        assert_eq!(summary[0].ip_count, 1);
    }

    #[test]
    fn refresh_scan_filters_by_ttl_and_cursor() {
        let store = store();
        for addr in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            store
                .upsert_ip_event(ip(addr), 10, EventKind::Fail, "", false, mask24())
                .unwrap();
        }
        let mut lookups = HashMap::new();
        lookups.insert(
            "10.0.0.2".to_owned(),
            AsnInfo {
                asn: "1".to_owned(),
                cc: "US".to_owned(),
                as_name: "X".to_owned(),
                fetched_ts: 1000,
            },
        );
        store.upsert_asn_info(&lookups).unwrap();

        // 10.0.0.2 is fresh relative to min_fetched_ts=500.
        let need = store.list_ips_needing_asn_refresh(None, 10, 500).unwrap();
        assert_eq!(need, ["10.0.0.1", "10.0.0.3"]);

        // With the TTL expired it reappears.
        let need = store.list_ips_needing_asn_refresh(None, 10, 2000).unwrap();
        assert_eq!(need, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        // Cursor selects strictly past the given ip.
        let need = store
            .list_ips_needing_asn_refresh(Some("10.0.0.1"), 10, 2000)
            .unwrap();
        assert_eq!(need, ["10.0.0.2", "10.0.0.3"]);

        let need = store
            .list_ips_needing_asn_refresh(Some("10.0.0.3"), 10, 2000)
            .unwrap();
        assert!(need.is_empty());
    }

    #[test]
    fn refresh_scan_walks_addresses_numerically() {
        let store = store();
        // Octet widths vary, so string order would put 10.* and 100.* before 2.*.
        for addr in ["10.0.0.1", "2.0.0.1", "100.0.0.1", "9.9.9.9"] {
            store
                .upsert_ip_event(ip(addr), 10, EventKind::Fail, "", false, mask24())
                .unwrap();
        }
        store
            .upsert_imported_bips(ip("3.3.3.3"), 1, Some(20), "sshd", mask24())
            .unwrap();

        let need = store.list_ips_needing_asn_refresh(None, 10, 500).unwrap();
        assert_eq!(
            need,
            ["2.0.0.1", "3.3.3.3", "9.9.9.9", "10.0.0.1", "100.0.0.1"]
        );

        let need = store
            .list_ips_needing_asn_refresh(Some("9.9.9.9"), 10, 500)
            .unwrap();
        assert_eq!(need, ["10.0.0.1", "100.0.0.1"]);
    }

    #[test]
    fn ip_list_sorted_and_searchable() {
        let store = store();
        store
            .upsert_ip_event(ip("10.0.0.1"), 10, EventKind::Fail, "", false, mask24())
            .unwrap();
        store
            .upsert_ip_event(ip("10.0.0.2"), 20, EventKind::Ban, "sshd", false, mask24())
            .unwrap();
        store
            .upsert_imported_bips(ip("10.0.0.3"), 9, Some(5), "sshd", mask24())
            .unwrap();

        let rows = store.list_ip_cache("", 500).unwrap();
        let ips: Vec<&str> = rows.iter().map(|r| r.ip.as_str()).collect();
        // Highest ban_count_total first, then bans, then fails.
        assert_eq!(ips, ["10.0.0.3", "10.0.0.2", "10.0.0.1"]);

        let rows = store.list_ip_cache("0.0.1", 500).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ip, "10.0.0.1");
    }

    #[test]
    fn top_subnets_ranked_by_pressure() {
        let store = store();
        for _ in 0..3 {
            store
                .upsert_ip_event(ip("10.0.0.1"), 10, EventKind::Fail, "", false, mask24())
                .unwrap();
        }
        store
            .upsert_ip_event(ip("10.1.0.1"), 20, EventKind::Fail, "", false, mask24())
            .unwrap();
        store.refresh_subnet_unique_counts().unwrap();

        let subs = store.list_top_subnets(10, "").unwrap();
        assert_eq!(subs[0].subnet, "10.0.0.0/24");
        assert_eq!(subs[1].subnet, "10.1.0.0/24");

        let subs = store.list_top_subnets(10, "10.1").unwrap();
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn seed_ips_are_most_recent_first() {
        let store = store();
        store
            .upsert_ip_event(ip("10.0.0.1"), 10, EventKind::Fail, "", false, mask24())
            .unwrap();
        store
            .upsert_ip_event(ip("10.0.0.2"), 20, EventKind::Fail, "", false, mask24())
            .unwrap();
        assert_eq!(
            store.list_realtime_seed_ips(1).unwrap(),
            ["10.0.0.2".to_owned()]
        );
        assert!(store.list_realtime_seed_ips(0).unwrap().is_empty());
    }

    #[test]
    fn subnet_membership_lookups() {
        let store = store();
        store
            .upsert_ip_event(ip("10.0.0.1"), 10, EventKind::Fail, "", false, mask24())
            .unwrap();
        store
            .upsert_ip_event(ip("10.0.0.2"), 20, EventKind::Ban, "sshd", false, mask24())
            .unwrap();

        let rows = store.list_ips_in_subnet("10.0.0.0/24", 50).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ip, "10.0.0.2"); // bans outrank fails
    }

    #[test]
    fn state_roundtrip_and_rollback() {
        let store = store();
        store.set_state("source_mtime", "123").unwrap();
        store.commit().unwrap();
        assert_eq!(store.get_state("source_mtime").unwrap().as_deref(), Some("123"));

        store.set_state("source_mtime", "456").unwrap();
        store.rollback().unwrap();
        assert_eq!(store.get_state("source_mtime").unwrap().as_deref(), Some("123"));
        assert_eq!(store.get_state("missing").unwrap(), None);
    }
}
