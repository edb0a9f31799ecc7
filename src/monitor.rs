use std::{
    collections::{BTreeSet, VecDeque},
    error::Error,
    io,
    net::Ipv4Addr,
    process::{Command, Output, Stdio},
    str::FromStr,
    time::{Duration, Instant},
};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::error;
use rustc_hash::FxHashMap;

use crate::{
    cache::CacheStore,
    history,
    model::{fmt_epoch_utc, now_ts, Event, EventKind, EventSource, RtCounters},
    parsers::{parse_jail_line, parse_ssh_line},
    subnet::SubnetMask,
    tailer::{LogTailer, DEFAULT_MAX_LINES},
    whois, Args,
};

const EVENTS_CAP: usize = 2000;
const IP_EVENTS_CAP: usize = 50;
const COMMIT_INTERVAL: Duration = Duration::from_millis(800);
const IMPORT_CHUNK: usize = 2000;
const CLI_TIMEOUT: Duration = Duration::from_secs(3);
const IP_LIST_LIMIT: usize = 500;
const ASN_LIST_LIMIT: usize = 200;
const MEMBER_LIST_LIMIT: usize = 50;

/// A zero period disables pacing: the operation then runs on every tick.
fn pacer(period: Duration) -> Option<DefaultDirectRateLimiter> {
    Quota::with_period(period).map(|quota| RateLimiter::direct(quota))
}

/// The aggregation engine. Owns the cache store, the in-memory realtime
/// state, and both log tailers; driven by [`tick`] from the outer loop.
pub struct Monitor {
    args: Args,
    mask: SubnetMask,
    cache: CacheStore,

    events: VecDeque<Event>,
    events_total: u64,
    ip_events: FxHashMap<String, VecDeque<Event>>,
    realtime: FxHashMap<String, RtCounters>,

    pending_ops: u64,
    last_commit: Instant,

    t_auth: LogTailer,
    t_f2b: LogTailer,

    poll_pace: Option<DefaultDirectRateLimiter>,
    poll_known: BTreeSet<Ipv4Addr>,

    asn_pace: Option<DefaultDirectRateLimiter>,
    asn_cursor: Option<String>,
}

impl Monitor {
    pub fn new(args: Args) -> Result<Monitor, Box<dyn Error>> {
        let cache = CacheStore::open(&args.cache_path)
            .map_err(|err| format!("cannot open cache {:?}: {err}", args.cache_path))?;

        let mut monitor = Monitor {
            mask: SubnetMask::new(args.subnet_prefix),
            cache,
            events: VecDeque::with_capacity(EVENTS_CAP),
            events_total: 0,
            ip_events: FxHashMap::default(),
            realtime: FxHashMap::default(),
            pending_ops: 0,
            last_commit: Instant::now(),
            t_auth: LogTailer::new(&args.auth_log, true),
            t_f2b: LogTailer::new(&args.f2b_log, true),
            poll_pace: pacer(args.poll_interval),
            poll_known: BTreeSet::new(),
            asn_pace: pacer(args.asn_refresh_interval),
            asn_cursor: None,
            args,
        };

        if monitor.args.import_on_start {
            monitor.import_jail_history();
        }
        if monitor.args.bootstrap_from_cache > 0 {
            monitor.bootstrap_realtime(monitor.args.bootstrap_from_cache);
        }
        if let Err(err) = monitor
            .cache
            .refresh_subnet_unique_counts()
            .and_then(|()| monitor.cache.commit())
        {
            monitor.log_sys(EventKind::Err, "", format!("unique count refresh failed: {err}"));
        }
        Ok(monitor)
    }

    /// Flush whatever is pending and drop the store handle.
    pub fn close(self) {
        let _ = self.cache.commit();
    }

    /// One cooperative turn: drain the tailers, maybe poll the jail
    /// controller, maybe refresh ASN records, maybe commit.
    pub fn tick(&mut self) {
        self.process_log_tails();
        self.poll_jail_bans();
        let (asked, written) = self.refresh_asn();
        if asked > 0 && written > 0 {
            self.log_sys(
                EventKind::Info,
                "",
                format!("asn refresh: asked={asked} got={written}"),
            );
        }
        self.maybe_commit();
    }

    fn log_sys(&mut self, kind: EventKind, ip: &str, msg: String) {
        if kind == EventKind::Err {
            error!("{msg}");
        }
        let ev = Event {
            ts: now_ts(),
            src: EventSource::Sys,
            kind,
            ip: ip.to_owned(),
            jail: String::new(),
            msg,
        };
        if self.events.len() == EVENTS_CAP {
            self.events.pop_front();
        }
        self.events.push_back(ev);
        self.events_total += 1;
    }

    fn push_event(&mut self, ev: Event) {
        let ring = self.ip_events.entry(ev.ip.clone()).or_default();
        if ring.len() == IP_EVENTS_CAP {
            ring.pop_front();
        }
        ring.push_back(ev.clone());

        if self.events.len() == EVENTS_CAP {
            self.events.pop_front();
        }
        self.events.push_back(ev);
        self.events_total += 1;
    }

    fn bootstrap_realtime(&mut self, n: usize) {
        match self.cache.list_realtime_seed_ips(n) {
            Ok(ips) => {
                let count = ips.len();
                for ip in ips {
                    self.realtime.entry(ip).or_default();
                }
                self.log_sys(
                    EventKind::Info,
                    "",
                    format!("bootstrap realtime from cache: {count} IPs"),
                );
            }
            Err(err) => {
                self.log_sys(EventKind::Err, "", format!("bootstrap from cache failed: {err}"));
            }
        }
    }

    /// One-shot merge of the external jail database, gated by its
    /// (mtime, size) fingerprint so restarts never double-import.
    fn import_jail_history(&mut self) {
        let src = self.args.f2b_sqlite.clone();
        let (mtime, size) = match history::source_fingerprint(&src) {
            Ok(fp) => fp,
            Err(err) => {
                self.log_sys(EventKind::Err, "", format!("history source stat failed: {err}"));
                return;
            }
        };

        let prev_mtime = self.cache.get_state("source_mtime").ok().flatten();
        let prev_size = self.cache.get_state("source_size").ok().flatten();
        if prev_mtime.as_deref() == Some(mtime.to_string().as_str())
            && prev_size.as_deref() == Some(size.to_string().as_str())
        {
            return;
        }

        let agg = match history::import_aggregates(&src) {
            Ok(agg) => agg,
            Err(err) => {
                self.log_sys(EventKind::Err, "", format!("history import failed: {err}"));
                return;
            }
        };

        let mask = self.mask;
        let mut imported = 0usize;
        let result: rusqlite::Result<()> = (|| {
            for (ip, d) in &agg {
                // Source rows that are not IPv4 (or garbage) are dropped.
                let Ok(addr) = Ipv4Addr::from_str(ip) else {
                    continue;
                };
                self.cache.upsert_imported_bips(
                    addr,
                    d.ban_count_total,
                    d.last_ban_ts,
                    &d.last_ban_jail,
                    mask,
                )?;
                imported += 1;
                if imported % IMPORT_CHUNK == 0 {
                    self.cache.commit()?;
                }
            }
            self.cache.refresh_subnet_unique_counts()?;
            self.cache.set_state("imported_at_ts", &now_ts().to_string())?;
            self.cache
                .set_state("source_sqlite_path", &src.display().to_string())?;
            self.cache.set_state("source_mtime", &mtime.to_string())?;
            self.cache.set_state("source_size", &size.to_string())?;
            self.cache.set_state("last_import_rows", &imported.to_string())?;
            self.cache.commit()
        })();

        match result {
            Ok(()) => {
                self.log_sys(
                    EventKind::Info,
                    "",
                    format!("imported fail2ban history: {imported} IPs"),
                );
            }
            Err(err) => {
                let _ = self.cache.rollback();
                self.log_sys(EventKind::Err, "", format!("import failed (rolled back): {err}"));
            }
        }
    }

    fn process_log_tails(&mut self) {
        for line in self.t_auth.read_available(DEFAULT_MAX_LINES) {
            let Some((ip, kind)) = parse_ssh_line(&line) else {
                continue;
            };
            if kind == EventKind::Ok && !self.args.show_ok {
                continue;
            }
            self.handle_event(EventSource::Auth, kind, ip, "");
        }
        for line in self.t_f2b.read_available(DEFAULT_MAX_LINES) {
            let Some((ip, kind, jail)) = parse_jail_line(&line) else {
                continue;
            };
            self.handle_event(EventSource::F2b, kind, ip, &jail);
        }
    }

    fn handle_event(&mut self, src: EventSource, kind: EventKind, ip: Ipv4Addr, jail: &str) {
        let ts = now_ts();
        let key = ip.to_string();

        self.realtime.entry(key.clone()).or_default().bump(kind);

        match self
            .cache
            .upsert_ip_event(ip, ts, kind, jail, self.args.show_ok, self.mask)
        {
            Ok(()) => self.pending_ops += 1,
            Err(err) => self.log_sys(EventKind::Err, &key, format!("cache upsert failed: {err}")),
        }

        self.push_event(Event {
            ts,
            src,
            kind,
            ip: key,
            jail: jail.to_owned(),
            msg: String::new(),
        });
    }

    /// Belt-and-braces ban discovery via the jail controller CLI; diffs the
    /// reported set against the last poll and synthesizes BAN/UNBAN events.
    fn poll_jail_bans(&mut self) {
        if !self.args.poll_bans || self.args.jail.is_empty() {
            return;
        }
        if let Some(pace) = &self.poll_pace {
            if pace.check().is_err() {
                return;
            }
        }

        let jail = self.args.jail.clone();
        let output = match run_with_timeout("fail2ban-client", &["status", jail.as_str()], CLI_TIMEOUT) {
            Ok(output) => output,
            Err(err) => {
                self.log_sys(EventKind::Err, "", format!("poll fail2ban-client failed: {err}"));
                return;
            }
        };
        if !output.status.success() {
            return;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut banned = BTreeSet::new();
        for line in stdout.lines() {
            if let Some((_, rest)) = line.split_once("Banned IP list:") {
                for token in rest.split_whitespace() {
                    if let Ok(ip) = Ipv4Addr::from_str(token) {
                        banned.insert(ip);
                    }
                }
            }
        }

        let added: Vec<Ipv4Addr> = banned.difference(&self.poll_known).copied().collect();
        let removed: Vec<Ipv4Addr> = self.poll_known.difference(&banned).copied().collect();
        if added.is_empty() && removed.is_empty() {
            return;
        }
        for ip in added {
            self.handle_event(EventSource::Poll, EventKind::Ban, ip, &jail);
        }
        for ip in removed {
            self.handle_event(EventSource::Poll, EventKind::Unban, ip, &jail);
        }
        self.poll_known = banned;
    }

    /// TTL-bounded cursor walk over the IP set; returns (asked, written).
    fn refresh_asn(&mut self) -> (usize, usize) {
        if !self.args.asn_enable {
            return (0, 0);
        }
        if let Some(pace) = &self.asn_pace {
            if pace.check().is_err() {
                return (0, 0);
            }
        }

        let min_fetched_ts = now_ts() - self.args.asn_cache_ttl.as_secs() as i64;
        let need = match self.select_asn_batch(min_fetched_ts) {
            Ok(need) => need,
            Err(err) => {
                self.log_sys(EventKind::Err, "", format!("asn cache scan failed: {err}"));
                return (0, 0);
            }
        };
        if need.is_empty() {
            return (0, 0);
        }

        let found = whois::bulk_lookup(&need, &self.args.cymru_host, self.args.asn_timeout);
        if found.is_empty() {
            return (need.len(), 0);
        }

        match self.cache.upsert_asn_info(&found) {
            Ok((asked, written)) => {
                self.pending_ops += 1;
                (asked, written)
            }
            Err(err) => {
                self.log_sys(EventKind::Err, "", format!("asn cache write failed: {err}"));
                (need.len(), 0)
            }
        }
    }

    /// Next batch of stale IPs strictly past the cursor, wrapping around once
    /// when the tail of the keyspace is exhausted.
    fn select_asn_batch(&mut self, min_fetched_ts: i64) -> rusqlite::Result<Vec<String>> {
        let batch = self.args.asn_batch;
        let mut need =
            self.cache
                .list_ips_needing_asn_refresh(self.asn_cursor.as_deref(), batch, min_fetched_ts)?;
        if need.is_empty() && self.asn_cursor.is_some() {
            self.asn_cursor = None;
            need = self
                .cache
                .list_ips_needing_asn_refresh(None, batch, min_fetched_ts)?;
        }
        if let Some(last) = need.last() {
            self.asn_cursor = Some(last.clone());
        }
        Ok(need)
    }

    fn maybe_commit(&mut self) {
        if self.pending_ops == 0 || self.last_commit.elapsed() < COMMIT_INTERVAL {
            return;
        }
        match self.cache.commit() {
            Ok(()) => {}
            Err(err) => {
                let _ = self.cache.rollback();
                self.log_sys(EventKind::Err, "", format!("cache commit failed: {err}"));
            }
        }
        self.pending_ops = 0;
        self.last_commit = Instant::now();
    }

    // ---- Query surface for the UI ----

    /// Live counters, all-zero rows hidden, heaviest offenders first.
    pub fn get_realtime_rows(&self, search: &str) -> Vec<(String, RtCounters)> {
        let needle = search.to_lowercase();
        let mut items: Vec<(String, RtCounters)> = self
            .realtime
            .iter()
            .filter(|(ip, st)| {
                st.total() > 0 && (needle.is_empty() || ip.to_lowercase().contains(&needle))
            })
            .map(|(ip, st)| (ip.clone(), *st))
            .collect();
        items.sort_by(|a, b| {
            (b.1.ban, b.1.fail, b.1.total()).cmp(&(a.1.ban, a.1.fail, a.1.total()))
        });
        items
    }

    pub fn get_ip_rows(&mut self, search: &str) -> Vec<crate::model::IpRow> {
        match self.cache.list_ip_cache(search, IP_LIST_LIMIT) {
            Ok(rows) => rows,
            Err(err) => {
                self.log_sys(EventKind::Err, "", format!("ip cache query failed: {err}"));
                Vec::new()
            }
        }
    }

    pub fn get_subnet_rows(&mut self, search: &str) -> Vec<crate::model::SubnetRow> {
        match self.cache.list_top_subnets(self.args.top_subnets, search) {
            Ok(rows) => rows,
            Err(err) => {
                self.log_sys(EventKind::Err, "", format!("subnet query failed: {err}"));
                Vec::new()
            }
        }
    }

    pub fn get_asn_rows(&mut self, search: &str) -> Vec<crate::model::AsnSummaryRow> {
        match self.cache.list_asn_summary(search, ASN_LIST_LIMIT) {
            Ok(rows) => rows,
            Err(err) => {
                self.log_sys(EventKind::Err, "", format!("asn summary query failed: {err}"));
                Vec::new()
            }
        }
    }

    pub fn get_ip_details(&mut self, ip: &str) -> Vec<String> {
        let mut lines = vec![format!("IP: {ip}"), String::new()];

        if let Some(rt) = self.realtime.get(ip) {
            lines.push("Realtime counters:".to_owned());
            lines.push(format!(
                "  FAIL={} OK={} BAN={} UNBAN={}",
                rt.fail, rt.ok, rt.ban, rt.unban
            ));
            lines.push(String::new());
        }

        match self.cache.get_ip_row(ip) {
            Ok(Some(row)) => {
                lines.push("Cache ip_cache:".to_owned());
                lines.push(format!("  first_seen: {}", fmt_epoch_utc(Some(row.first_seen_ts))));
                lines.push(format!("  last_seen : {}", fmt_epoch_utc(Some(row.last_seen_ts))));
                lines.push(format!(
                    "  fails={} oks={} bans={} unbans={}",
                    row.fails, row.oks, row.bans, row.unbans
                ));
                lines.push(format!(
                    "  last_event={} last_jail={}",
                    row.last_event, row.last_jail
                ));
                lines.push(String::new());
                lines.push("Fail2ban history import (aggregates):".to_owned());
                lines.push(format!("  ban_count_total={}", row.ban_count_total));
                lines.push(format!("  last_ban_ts  ={}", fmt_epoch_utc(row.last_ban_ts)));
                lines.push(format!("  last_ban_jail={}", row.last_ban_jail));
                lines.push(String::new());
                lines.push("Provider (cached):".to_owned());
                lines.push(format!("  ASN={} CC={}", row.provider_asn, row.provider_cc));
                lines.push(format!("  Name={}", row.provider_name));
                lines.push(format!("  Updated={}", fmt_epoch_utc(row.provider_fetched_ts)));
                lines.push(String::new());
            }
            Ok(None) => {
                lines.push("Cache ip_cache: (no row)".to_owned());
                lines.push(String::new());
            }
            Err(err) => lines.push(format!("Cache read error: {err}")),
        }

        let subnet = Ipv4Addr::from_str(ip)
            .map(|addr| self.mask.apply(addr).to_string())
            .unwrap_or_default();
        lines.push(self.top_subnet_membership(&subnet));
        lines.push(String::new());

        lines.push("Fail2ban history:".to_owned());
        match history::fetch_ip_history(&self.args.f2b_sqlite, ip, None) {
            Ok(rows) if rows.is_empty() => lines.push("  (no rows)".to_owned()),
            Ok(rows) => {
                for r in rows {
                    lines.push(format!(
                        "  {} jail={} bantime={} bancount={}",
                        fmt_epoch_utc(Some(r.timeofban)),
                        r.jail,
                        r.bantime,
                        r.bancount
                    ));
                }
            }
            Err(err) => lines.push(format!("  error: {err}")),
        }
        lines.push(String::new());

        lines.push(format!("Recent events (in-memory, up to {IP_EVENTS_CAP}):"));
        match self.ip_events.get(ip) {
            None => lines.push("  (none)".to_owned()),
            Some(ring) => {
                for ev in ring {
                    lines.push(format!(
                        "  {} {} {} jail={}",
                        fmt_epoch_utc(Some(ev.ts)),
                        ev.src,
                        ev.kind,
                        ev.jail
                    ));
                }
            }
        }
        lines
    }

    pub fn get_subnet_details(&mut self, subnet: &str) -> Vec<String> {
        let mut lines = vec![format!("Subnet: {subnet}"), String::new()];

        match self.cache.get_subnet_row(subnet) {
            Ok(Some(row)) => {
                lines.push("Subnet cache:".to_owned());
                lines.push(format!("  prefix={}", row.prefix));
                lines.push(format!("  first_seen={}", fmt_epoch_utc(Some(row.first_seen_ts))));
                lines.push(format!("  last_seen ={}", fmt_epoch_utc(Some(row.last_seen_ts))));
                lines.push(format!(
                    "  fails={} bans={} unbans={} unique_ips={}",
                    row.fails, row.bans, row.unbans, row.unique_ips
                ));
                lines.push(format!("  last_ip={}", row.last_ip));
            }
            Ok(None) => lines.push("Subnet cache: (no row)".to_owned()),
            Err(err) => lines.push(format!("Subnet cache read error: {err}")),
        }
        lines.push(String::new());

        lines.push(self.top_subnet_membership(subnet));
        lines.push(String::new());

        lines.push("Top IPs in subnet:".to_owned());
        match self.cache.list_ips_in_subnet(subnet, MEMBER_LIST_LIMIT) {
            Ok(rows) if rows.is_empty() => lines.push("  (no rows)".to_owned()),
            Ok(rows) => {
                for r in rows {
                    lines.push(format!(
                        "  {} ban_total={} bans={} fails={} last_seen={}",
                        r.ip,
                        r.ban_count_total,
                        r.bans,
                        r.fails,
                        fmt_epoch_utc(Some(r.last_seen_ts))
                    ));
                }
            }
            Err(err) => lines.push(format!("  error: {err}")),
        }
        lines
    }

    pub fn get_asn_details(&mut self, asn: &str) -> Vec<String> {
        let mut lines = vec![format!("ASN: {asn}"), String::new()];

        match self.cache.list_asn_summary(asn, 10) {
            Ok(rows) => match rows.into_iter().find(|r| r.asn == asn) {
                Some(row) => {
                    lines.push("ASN summary:".to_owned());
                    lines.push(format!("  CC={}", row.cc));
                    lines.push(format!("  Name={}", row.as_name));
                    lines.push(format!("  ip_count={}", row.ip_count));
                    lines.push(format!(
                        "  ban_total_sum={} bans_sum={} fails_sum={}",
                        row.ban_total_sum, row.bans_sum, row.fails_sum
                    ));
                    lines.push(format!("  last_fetch={}", fmt_epoch_utc(row.last_fetch_ts)));
                }
                None => lines.push("ASN summary: (no row)".to_owned()),
            },
            Err(err) => lines.push(format!("ASN summary error: {err}")),
        }
        lines.push(String::new());

        lines.push("Top IPs in ASN:".to_owned());
        match self.cache.list_ips_in_asn(asn, MEMBER_LIST_LIMIT) {
            Ok(rows) if rows.is_empty() => lines.push("  (no rows)".to_owned()),
            Ok(rows) => {
                for r in rows {
                    lines.push(format!(
                        "  {} ban_total={} bans={} fails={} last_seen={}",
                        r.ip,
                        r.ban_count_total,
                        r.bans,
                        r.fails,
                        fmt_epoch_utc(Some(r.last_seen_ts))
                    ));
                }
            }
            Err(err) => lines.push(format!("  error: {err}")),
        }
        lines
    }

    fn top_subnet_membership(&mut self, subnet: &str) -> String {
        if subnet.is_empty() {
            return "belongs_to_top10_subnets: -".to_owned();
        }
        match self.cache.list_top_subnets(self.args.top_subnets, "") {
            Ok(rows) => {
                let total = rows.len();
                match rows.iter().position(|r| r.subnet == subnet) {
                    Some(i) => format!("belongs_to_top10_subnets: yes (rank {}/{})", i + 1, total),
                    None => "belongs_to_top10_subnets: no".to_owned(),
                }
            }
            Err(_) => "belongs_to_top10_subnets: -".to_owned(),
        }
    }

    /// Tail of the shared events pane.
    pub fn get_events_lines(&self, max_lines: usize) -> Vec<String> {
        let skip = self.events.len().saturating_sub(max_lines);
        self.events
            .iter()
            .skip(skip)
            .map(|ev| match ev.kind {
                EventKind::Info | EventKind::Err => {
                    format!("{} {} {}", fmt_epoch_utc(Some(ev.ts)), ev.kind, ev.msg)
                }
                _ => {
                    let jail = if ev.jail.is_empty() {
                        String::new()
                    } else {
                        format!(" jail={}", ev.jail)
                    };
                    format!(
                        "{} {} {} {}{jail}",
                        fmt_epoch_utc(Some(ev.ts)),
                        ev.src,
                        ev.kind,
                        ev.ip
                    )
                }
            })
            .collect()
    }

    /// Monotonic count of every event ever pushed, for headless consumers
    /// that render the pane incrementally.
    pub fn events_total(&self) -> u64 {
        self.events_total
    }
}

/// Run a CLI with a hard deadline; the child is killed on expiry.
fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> io::Result<Output> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(_) => return child.wait_with_output(),
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "child timed out"));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}
