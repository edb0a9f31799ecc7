use std::{net::Ipv4Addr, str::FromStr, sync::LazyLock};

use regex::Regex;

use crate::model::EventKind;

static IP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\d{1,3}\.){3}\d{1,3}").unwrap());

static SSH_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(Failed password|Invalid user|authentication failure)\b").unwrap()
});
static SSH_OK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bAccepted (?:password|publickey)\b").unwrap());

// 2026-01-29 12:34:56,789 fail2ban.actions [1234]: NOTICE [sshd] Ban 1.2.3.4
static JAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([A-Za-z0-9_.:-]+)\]").unwrap());
static BAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bBan\s+((?:\d{1,3}\.){3}\d{1,3})\b").unwrap());
static UNBAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bUnban\s+((?:\d{1,3}\.){3}\d{1,3})\b").unwrap());

/// Classify one sshd log line as (ip, FAIL | OK). A dotted quad only counts
/// when it survives address validation, so `999.1.1.1` never gets through.
pub fn parse_ssh_line(line: &str) -> Option<(Ipv4Addr, EventKind)> {
    let ip = Ipv4Addr::from_str(IP_RE.find(line)?.as_str()).ok()?;
    if SSH_FAIL_RE.is_match(line) {
        return Some((ip, EventKind::Fail));
    }
    if SSH_OK_RE.is_match(line) {
        return Some((ip, EventKind::Ok));
    }
    None
}

/// Last bracketed token before `pos` (the jail tag sits right before the
/// action keyword; earlier brackets hold the pid).
fn jail_before(line: &str, pos: usize) -> String {
    JAIL_RE
        .captures_iter(&line[..pos])
        .last()
        .map(|c| c[1].to_owned())
        .unwrap_or_default()
}

/// Classify one fail2ban log line as (ip, BAN | UNBAN, jail).
pub fn parse_jail_line(line: &str) -> Option<(Ipv4Addr, EventKind, String)> {
    if let Some(c) = BAN_RE.captures(line) {
        if let Ok(ip) = Ipv4Addr::from_str(&c[1]) {
            let jail = jail_before(line, c.get(0).map_or(0, |m| m.start()));
            return Some((ip, EventKind::Ban, jail));
        }
    }
    if let Some(c) = UNBAN_RE.captures(line) {
        if let Ok(ip) = Ipv4Addr::from_str(&c[1]) {
            let jail = jail_before(line, c.get(0).map_or(0, |m| m.start()));
            return Some((ip, EventKind::Unban, jail));
        }
    }
    None
}
