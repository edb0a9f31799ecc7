pub mod cache;
pub mod history;
pub mod model;
mod monitor;
pub mod parsers;
pub mod subnet;
pub mod tailer;
pub mod whois;

use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Parser};

pub use crate::monitor::Monitor;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path of the sshd log to tail.
    #[arg(long = "auth", default_value = "/var/log/auth.log")]
    pub auth_log: PathBuf,

    /// Path of the fail2ban log to tail.
    #[arg(long = "f2b", default_value = "/var/log/fail2ban.log")]
    pub f2b_log: PathBuf,

    /// Path of the fail2ban sqlite database the history import reads.
    #[arg(long = "sqlite", default_value = "/var/lib/fail2ban/fail2ban.sqlite3")]
    pub f2b_sqlite: PathBuf,

    /// Jail to poll active bans from. Empty disables polling.
    #[arg(long, default_value = "")]
    pub jail: String,

    /// Show OK (Accepted ...) events and count them in the cache.
    #[arg(long)]
    pub show_ok: bool,

    /// Do not poll the jail controller for its banned set. The jail log
    /// already reports Ban/Unban actions; polling is belt and braces for
    /// controllers that do not log them.
    #[arg(long = "no-poll-bans", action = ArgAction::SetFalse)]
    pub poll_bans: bool,

    /// Minimum time between jail controller polls.
    /// Uses humantime to parse the duration.
    /// See: https://docs.rs/humantime/latest/humantime/ for details
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    pub poll_interval: Duration,

    /// Path of the local aggregate cache database.
    #[arg(long = "cache", default_value = "f2b_cache.sqlite3")]
    pub cache_path: PathBuf,

    /// Prefix the subnet aggregates are keyed at (8, 16, 24 or 32).
    #[arg(long, default_value_t = 24, value_parser = subnet::parse_prefix)]
    pub subnet_prefix: u8,

    /// Seed the realtime tab with the N most recently seen cached IPs at
    /// startup, so it is not empty on the first render (0 = off).
    #[arg(long, default_value_t = 100)]
    pub bootstrap_from_cache: usize,

    /// Do not import fail2ban ban history into the cache at startup.
    #[arg(long = "no-import-on-start", action = ArgAction::SetFalse)]
    pub import_on_start: bool,

    /// Do not enrich cached IPs with ASN whois data.
    #[arg(long = "no-asn-enable", action = ArgAction::SetFalse)]
    pub asn_enable: bool,

    /// Minimum time between enrichment rounds; each round refreshes at most
    /// --asn-batch IPs.
    /// Uses humantime to parse the duration.
    /// See: https://docs.rs/humantime/latest/humantime/ for details
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub asn_refresh_interval: Duration,

    /// How long a fetched ASN record stays fresh before the scan picks it
    /// up again.
    /// Uses humantime to parse the duration.
    /// See: https://docs.rs/humantime/latest/humantime/ for details
    #[arg(long, default_value = "1day", value_parser = parse_duration)]
    pub asn_cache_ttl: Duration,

    /// Number of IPs per bulk whois query.
    #[arg(long, default_value_t = 20)]
    pub asn_batch: usize,

    /// Network timeout for one bulk whois exchange.
    /// Uses humantime to parse the duration.
    /// See: https://docs.rs/humantime/latest/humantime/ for details
    #[arg(long, default_value = "4s", value_parser = parse_duration)]
    pub asn_timeout: Duration,

    /// Bulk whois host (name or address, optionally host:port).
    #[arg(long, default_value = "whois.cymru.com")]
    pub cymru_host: String,

    /// Size of the top subnets list.
    #[arg(long, default_value_t = 10)]
    pub top_subnets: usize,
}

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    s.parse::<humantime::Duration>().map(Into::into)
}
