use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};

use log::debug;

use crate::model::{now_ts, AsnInfo};

/// Slack on top of the per-call timeout before the whole exchange is abandoned.
const RESPONSE_GRACE: Duration = Duration::from_secs(3);

/// Bulk-query the ASN lookup service on TCP/43. `host` may carry an explicit
/// `:port`. Any failure yields an empty map; empty input never touches the
/// network.
pub fn bulk_lookup(ips: &[String], host: &str, timeout: Duration) -> HashMap<String, AsnInfo> {
    let asked: Vec<&str> = ips
        .iter()
        .map(|ip| ip.trim())
        .filter(|ip| !ip.is_empty())
        .collect();
    if asked.is_empty() {
        return HashMap::new();
    }

    let mut query = String::from("begin\nverbose\n");
    for ip in &asked {
        query.push_str(ip);
        query.push('\n');
    }
    query.push_str("end\n");

    match exchange(host, &query, timeout) {
        Ok(text) => parse_bulk_response(&text, now_ts()),
        Err(err) => {
            debug!("whois bulk lookup via {host} failed: {err}");
            HashMap::new()
        }
    }
}

fn exchange(host: &str, query: &str, timeout: Duration) -> io::Result<String> {
    let deadline = Instant::now() + timeout + RESPONSE_GRACE;
    let target = if host.contains(':') {
        host.to_owned()
    } else {
        format!("{host}:43")
    };
    let addr = target
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host did not resolve"))?;

    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.write_all(query.as_bytes())?;
    stream.shutdown(Shutdown::Write)?;

    let mut body = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "response deadline exceeded",
            ));
        }
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(err) => return Err(err),
        }
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Parse one record per `|`-separated line:
///   non-verbose: AS | IP | CC | Registry | Allocated | AS Name
///   verbose    : AS | IP | BGP Prefix | CC | Registry | Allocated | AS Name
pub fn parse_bulk_response(text: &str, fetched_ts: i64) -> HashMap<String, AsnInfo> {
    let mut out = HashMap::new();
    for line in text.lines() {
        if line.is_empty()
            || line.starts_with("AS")
            || line.starts_with("Bulk mode")
            || line.starts_with('#')
        {
            continue;
        }
        let parts: Vec<&str> = line.split('|').map(str::trim).collect();
        if parts.len() < 6 {
            continue;
        }
        let asn = parts[0];
        let ip = parts[1];
        let (cc, as_name) = if parts.len() >= 7 {
            (parts[3], parts[6])
        } else {
            (parts[2], parts[5])
        };
        if !ip.is_empty() {
            out.insert(
                ip.to_owned(),
                AsnInfo {
                    asn: asn.to_owned(),
                    cc: cc.to_owned(),
                    as_name: as_name.to_owned(),
                    fetched_ts,
                },
            );
        }
    }
    out
}
