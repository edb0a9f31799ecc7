use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Current wall clock as UTC epoch seconds.
pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn fmt_epoch_utc(ts: Option<i64>) -> String {
    match ts {
        None => "-".to_owned(),
        Some(ts) => {
            let when = UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64);
            humantime::format_rfc3339_seconds(when).to_string()
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EventSource {
    Auth,
    F2b,
    Poll,
    Sys,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSource::Auth => "auth",
            EventSource::F2b => "f2b",
            EventSource::Poll => "poll",
            EventSource::Sys => "sys",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EventKind {
    Fail,
    Ok,
    Ban,
    Unban,
    Info,
    Err,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Fail => "FAIL",
            EventKind::Ok => "OK",
            EventKind::Ban => "BAN",
            EventKind::Unban => "UNBAN",
            EventKind::Info => "INFO",
            EventKind::Err => "ERR",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed action. Held in bounded in-memory rings, never persisted.
#[derive(Debug, Clone)]
pub struct Event {
    pub ts: i64,
    pub src: EventSource,
    pub kind: EventKind,
    pub ip: String,
    pub jail: String,
    pub msg: String,
}

/// Per-IP live counters backing the realtime tab.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtCounters {
    pub fail: u64,
    pub ok: u64,
    pub ban: u64,
    pub unban: u64,
}

impl RtCounters {
    pub fn bump(&mut self, kind: EventKind) {
        match kind {
            EventKind::Fail => self.fail += 1,
            EventKind::Ok => self.ok += 1,
            EventKind::Ban => self.ban += 1,
            EventKind::Unban => self.unban += 1,
            EventKind::Info | EventKind::Err => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.fail + self.ok + self.ban + self.unban
    }
}

/// ASN record for one IP as returned by the bulk whois service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsnInfo {
    pub asn: String,
    pub cc: String,
    pub as_name: String,
    pub fetched_ts: i64,
}

/// Row of `ip_cache`.
#[derive(Debug, Clone)]
pub struct IpRow {
    pub ip: String,
    pub first_seen_ts: i64,
    pub last_seen_ts: i64,
    pub fails: i64,
    pub oks: i64,
    pub bans: i64,
    pub unbans: i64,
    pub last_event: String,
    pub last_jail: String,
    pub last_ban_ts: Option<i64>,
    pub last_ban_jail: String,
    pub ban_count_total: i64,
    pub provider_asn: String,
    pub provider_cc: String,
    pub provider_name: String,
    pub provider_fetched_ts: Option<i64>,
}

/// Row of `subnet_cache`.
#[derive(Debug, Clone)]
pub struct SubnetRow {
    pub subnet: String,
    pub prefix: i64,
    pub first_seen_ts: i64,
    pub last_seen_ts: i64,
    pub fails: i64,
    pub bans: i64,
    pub unbans: i64,
    pub unique_ips: i64,
    pub last_ip: String,
}

/// One `GROUP BY provider_asn` aggregate over `ip_cache`.
#[derive(Debug, Clone)]
pub struct AsnSummaryRow {
    pub asn: String,
    pub as_name: String,
    pub cc: String,
    pub ip_count: i64,
    pub ban_total_sum: i64,
    pub bans_sum: i64,
    pub fails_sum: i64,
    pub last_fetch_ts: Option<i64>,
}
