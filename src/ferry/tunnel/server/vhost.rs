//! Name-based routing for the shared HTTP, HTTPS and CONNECT listeners.

use std::{borrow::Cow, sync::Arc};

use dashmap::DashMap;
use regex::Regex;
use thiserror::Error;

use crate::ferry::tunnel::{error::TunnelError, kind::VhostKind, server::registry::ProxyRoute};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("need more data")]
    NeedMoreData,
    #[error("no match")]
    NoMatch,
}

/// Routing key found at the start of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sniffed {
    pub host: String,
    /// Bytes that belong to the routing handshake and must not be forwarded.
    pub consumed: usize,
}

pub fn sniff(kind: VhostKind, prelude: &[u8]) -> Result<Sniffed, ParseError> {
    match kind {
        VhostKind::Http => http_host(prelude).map(|host| Sniffed { host, consumed: 0 }),
        VhostKind::Https => tls_sni(prelude).map(|host| Sniffed { host, consumed: 0 }),
        VhostKind::Tcpmux => connect_target(prelude),
    }
}

fn header_end(b: &[u8]) -> Option<usize> {
    b.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Strips an optional `:port` (IPv6 literals keep their brackets) and lowercases.
pub fn normalize_host(h: &str) -> String {
    let h = h.trim();
    let host = if let Some(rest) = h.strip_prefix('[') {
        match rest.find(']') {
            Some(i) => &h[..i + 2],
            None => h,
        }
    } else {
        match h.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => h,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

pub fn http_host(prelude: &[u8]) -> Result<String, ParseError> {
    let Some(end) = header_end(prelude) else {
        // A request line must start with a method token.
        if prelude
            .iter()
            .take_while(|b| **b != b' ')
            .any(|b| !b.is_ascii_uppercase())
        {
            return Err(ParseError::NoMatch);
        }
        return Err(ParseError::NeedMoreData);
    };
    let head = std::str::from_utf8(&prelude[..end]).map_err(|_| ParseError::NoMatch)?;
    for line in head.split("\r\n").skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                let host = normalize_host(value);
                if host.is_empty() {
                    return Err(ParseError::NoMatch);
                }
                return Ok(host);
            }
        }
    }
    Err(ParseError::NoMatch)
}

fn connect_target(prelude: &[u8]) -> Result<Sniffed, ParseError> {
    let n = prelude.len().min(8);
    if prelude[..n] != b"CONNECT "[..n] {
        return Err(ParseError::NoMatch);
    }
    let end = header_end(prelude).ok_or(ParseError::NeedMoreData)?;
    let head = std::str::from_utf8(&prelude[..end]).map_err(|_| ParseError::NoMatch)?;
    let line = head.split("\r\n").next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    let _method = parts.next();
    let target = parts.next().ok_or(ParseError::NoMatch)?;
    let host = normalize_host(target);
    if host.is_empty() {
        return Err(ParseError::NoMatch);
    }
    Ok(Sniffed {
        host,
        consumed: end,
    })
}

/// Extracts the server name from a TLS ClientHello.
pub fn tls_sni(b: &[u8]) -> Result<String, ParseError> {
    if b.is_empty() {
        return Err(ParseError::NeedMoreData);
    }
    // Handshake record.
    if b[0] != 0x16 {
        return Err(ParseError::NoMatch);
    }
    if b.len() < 5 {
        return Err(ParseError::NeedMoreData);
    }
    let rec_len = u16::from_be_bytes([b[3], b[4]]) as usize;
    if b.len() < 5 + rec_len {
        return Err(ParseError::NeedMoreData);
    }
    let hs = &b[5..5 + rec_len];
    // ClientHello.
    if hs.len() < 4 || hs[0] != 0x01 {
        return Err(ParseError::NoMatch);
    }

    let mut off = 4 + 2 + 32;
    let sid_len = *hs.get(off).ok_or(ParseError::NoMatch)? as usize;
    off += 1 + sid_len;
    let cs_len = read_u16(hs, off)? as usize;
    off += 2 + cs_len;
    let comp_len = *hs.get(off).ok_or(ParseError::NoMatch)? as usize;
    off += 1 + comp_len;
    let ext_len = read_u16(hs, off)? as usize;
    off += 2;
    let ext_end = off + ext_len;
    if ext_end > hs.len() {
        return Err(ParseError::NoMatch);
    }

    while off + 4 <= ext_end {
        let ty = read_u16(hs, off)?;
        let len = read_u16(hs, off + 2)? as usize;
        off += 4;
        if off + len > ext_end {
            return Err(ParseError::NoMatch);
        }
        if ty == 0x0000 {
            // server_name_list: u16 len, then (u8 type, u16 len, name)*
            let mut p = off + 2;
            while p + 3 <= off + len {
                let name_ty = hs[p];
                let name_len = read_u16(hs, p + 1)? as usize;
                p += 3;
                if p + name_len > off + len {
                    return Err(ParseError::NoMatch);
                }
                if name_ty == 0 {
                    let name = std::str::from_utf8(&hs[p..p + name_len])
                        .map_err(|_| ParseError::NoMatch)?;
                    return Ok(normalize_host(name));
                }
                p += name_len;
            }
            return Err(ParseError::NoMatch);
        }
        off += len;
    }
    Err(ParseError::NoMatch)
}

fn read_u16(b: &[u8], off: usize) -> Result<u16, ParseError> {
    match b.get(off..off + 2) {
        Some(s) => Ok(u16::from_be_bytes([s[0], s[1]])),
        None => Err(ParseError::NoMatch),
    }
}

struct WildcardRoute {
    pattern: String,
    re: Regex,
    route: Arc<ProxyRoute>,
}

/// Domain to proxy map for one shared listener.
///
/// Exact names win over wildcards; among wildcards the longest pattern wins.
#[derive(Default)]
pub struct VhostRouter {
    exact: DashMap<String, Arc<ProxyRoute>>,
    wildcard: std::sync::RwLock<Vec<WildcardRoute>>,
}

impl VhostRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes every domain to `route`, or none of them.
    pub fn insert_all(&self, domains: &[String], route: &Arc<ProxyRoute>) -> Result<(), TunnelError> {
        let mut done: Vec<&String> = Vec::new();
        for d in domains {
            if let Err(err) = self.insert(d, route) {
                for undo in done {
                    self.remove(undo, route.id);
                }
                return Err(err);
            }
            done.push(d);
        }
        Ok(())
    }

    fn insert(&self, domain: &str, route: &Arc<ProxyRoute>) -> Result<(), TunnelError> {
        let domain = domain.trim().to_ascii_lowercase();
        if domain.is_empty() {
            return Err(TunnelError::InvalidConfig("empty domain".into()));
        }
        if domain.contains('*') || domain.contains('?') {
            let re = compile_wildcard_pattern(&domain)?;
            let mut w = self.wildcard.write().unwrap_or_else(|e| e.into_inner());
            if w.iter().any(|r| r.pattern == domain) {
                return Err(TunnelError::DomainConflict(domain));
            }
            w.push(WildcardRoute {
                pattern: domain,
                re,
                route: route.clone(),
            });
            w.sort_by(|a, b| b.pattern.len().cmp(&a.pattern.len()));
            return Ok(());
        }
        match self.exact.entry(domain) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                Err(TunnelError::DomainConflict(e.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(route.clone());
                Ok(())
            }
        }
    }

    /// Removes `domain` if it still points at the route with `route_id`.
    pub fn remove(&self, domain: &str, route_id: u64) {
        let domain = domain.trim().to_ascii_lowercase();
        self.exact.remove_if(&domain, |_, r| r.id == route_id);
        let mut w = self.wildcard.write().unwrap_or_else(|e| e.into_inner());
        w.retain(|r| !(r.pattern == domain && r.route.id == route_id));
    }

    pub fn lookup(&self, host: &str) -> Option<Arc<ProxyRoute>> {
        let host = normalize_host(host);
        if let Some(r) = self.exact.get(&host) {
            return Some(r.clone());
        }
        let w = self.wildcard.read().unwrap_or_else(|e| e.into_inner());
        w.iter()
            .find(|r| r.re.is_match(&host))
            .map(|r| r.route.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.read().map(|w| w.is_empty()).unwrap_or(true)
    }
}

fn compile_wildcard_pattern(pattern: &str) -> Result<Regex, TunnelError> {
    let pattern = pattern.trim().to_ascii_lowercase();
    let mut out = String::with_capacity(pattern.len() + 16);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str("(.*?)"),
            '?' => out.push_str("(.)"),
            other => {
                if ".^$+()[]{}|\\".contains(other) {
                    out.push('\\');
                }
                out.push(other);
            }
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| TunnelError::InvalidConfig(format!("domain {pattern:?}: {e}")))
}

pub fn http_response(status: u16, reason: &str) -> Vec<u8> {
    let body = format!("{status} {reason}\n");
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

const HOP_HEADERS: [&str; 3] = ["connection", "keep-alive", "proxy-connection"];

/// Rewrites the first request so the backend closes after answering it.
///
/// The route is picked from the first `Host` only, so a kept-alive client
/// connection would carry later requests for other hosts to the same proxy.
/// With `Connection: close` the client opens a fresh, freshly routed
/// connection for its next request. Upgrade requests pass through as-is.
pub fn close_after_first_request(prelude: &[u8]) -> Cow<'_, [u8]> {
    let Some(end) = header_end(prelude) else {
        return Cow::Borrowed(prelude);
    };
    let Ok(head) = std::str::from_utf8(&prelude[..end - 2]) else {
        return Cow::Borrowed(prelude);
    };

    let mut out = String::with_capacity(end + 20);
    for (i, line) in head.split_terminator("\r\n").enumerate() {
        if i > 0
            && let Some((name, value)) = line.split_once(':')
        {
            let name = name.trim();
            if name.eq_ignore_ascii_case("connection")
                && value.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
            {
                return Cow::Borrowed(prelude);
            }
            if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&prelude[end..]);
    Cow::Owned(bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ferry::tunnel::{
        kind::{ProxyConfig, ProxyKind},
        server::registry::ProxyRoute,
    };

    fn route(name: &str) -> Arc<ProxyRoute> {
        let cfg = ProxyConfig::new(name, ProxyKind::Http, "127.0.0.1:80");
        Arc::new(ProxyRoute::new(cfg, "run".into(), None))
    }

    /// Minimal TLS 1.2 ClientHello carrying only an SNI extension.
    pub(crate) fn client_hello(name: &str) -> Vec<u8> {
        let name = name.as_bytes();
        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni.push(0);
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        let mut ext = Vec::new();
        ext.extend_from_slice(&0u16.to_be_bytes());
        ext.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        ext.extend_from_slice(&sni);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x13, 0x01]);
        body.extend_from_slice(&[1, 0]); // compression
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        let mut hs = vec![0x01];
        hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&body);

        let mut rec = vec![0x16, 0x03, 0x01];
        rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        rec.extend_from_slice(&hs);
        rec
    }

    #[test]
    fn http_host_needs_full_header() {
        let req = b"GET / HTTP/1.1\r\nHost: Web.Example.com:8080\r\nAccept: */*\r\n\r\nbody";
        assert_eq!(http_host(&req[..20]), Err(ParseError::NeedMoreData));
        assert_eq!(http_host(req).unwrap(), "web.example.com");
        assert_eq!(http_host(b"\x16\x03\x01"), Err(ParseError::NoMatch));
        assert_eq!(
            http_host(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n"),
            Err(ParseError::NoMatch)
        );
    }

    #[test]
    fn sni_is_extracted_from_client_hello() {
        let hello = client_hello("secure.example.com");
        assert_eq!(tls_sni(&hello).unwrap(), "secure.example.com");
        assert_eq!(tls_sni(&hello[..10]), Err(ParseError::NeedMoreData));
        assert_eq!(tls_sni(b"GET / HTTP/1.1"), Err(ParseError::NoMatch));
    }

    #[test]
    fn connect_target_reports_consumed_header() {
        let req = b"CONNECT db.internal:5432 HTTP/1.1\r\nHost: db.internal:5432\r\n\r\nPAYLOAD";
        let s = sniff(VhostKind::Tcpmux, req).unwrap();
        assert_eq!(s.host, "db.internal");
        assert_eq!(&req[s.consumed..], b"PAYLOAD");
        assert_eq!(sniff(VhostKind::Tcpmux, b"CONN"), Err(ParseError::NeedMoreData));
        assert_eq!(
            sniff(VhostKind::Tcpmux, b"GET / HTTP/1.1\r\n\r\n"),
            Err(ParseError::NoMatch)
        );
    }

    #[test]
    fn first_request_is_marked_close() {
        let req = b"GET /a HTTP/1.1\r\nHost: a.example.com\r\nConnection: keep-alive\r\nKeep-Alive: timeout=5\r\nAccept: */*\r\n\r\nBODY";
        let out = close_after_first_request(req);
        assert_eq!(
            out.as_ref(),
            &b"GET /a HTTP/1.1\r\nHost: a.example.com\r\nAccept: */*\r\nConnection: close\r\n\r\nBODY"[..]
        );

        // No connection header at all.
        let out = close_after_first_request(b"GET / HTTP/1.1\r\nHost: b\r\n\r\n");
        assert_eq!(out.as_ref(), &b"GET / HTTP/1.1\r\nHost: b\r\nConnection: close\r\n\r\n"[..]);
    }

    #[test]
    fn upgrade_requests_are_left_alone() {
        let req = b"GET /ws HTTP/1.1\r\nHost: a\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n";
        assert!(matches!(close_after_first_request(req), Cow::Borrowed(_)));
        assert!(matches!(close_after_first_request(b"GET / HTTP/1.1\r\n"), Cow::Borrowed(_)));
    }

    #[test]
    fn normalize_host_handles_ports_and_ipv6() {
        assert_eq!(normalize_host("A.b.C:80"), "a.b.c");
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
        assert_eq!(normalize_host("example.com."), "example.com");
    }

    #[test]
    fn router_prefers_exact_then_longest_wildcard() {
        let r = VhostRouter::new();
        let exact = route("exact");
        let broad = route("broad");
        let narrow = route("narrow");
        r.insert_all(&["api.example.com".into()], &exact).unwrap();
        r.insert_all(&["*.example.com".into()], &broad).unwrap();
        r.insert_all(&["*.eu.example.com".into()], &narrow).unwrap();

        assert_eq!(r.lookup("API.example.com:443").unwrap().id, exact.id);
        assert_eq!(r.lookup("x.eu.example.com").unwrap().id, narrow.id);
        assert_eq!(r.lookup("www.example.com").unwrap().id, broad.id);
        assert!(r.lookup("example.org").is_none());
    }

    #[test]
    fn router_rejects_taken_domains_atomically() {
        let r = VhostRouter::new();
        let a = route("a");
        let b = route("b");
        r.insert_all(&["a.example.com".into()], &a).unwrap();
        let err = r
            .insert_all(&["b.example.com".into(), "a.example.com".into()], &b)
            .unwrap_err();
        assert!(matches!(err, TunnelError::DomainConflict(_)));
        // The partial insert was rolled back.
        assert!(r.lookup("b.example.com").is_none());

        r.remove("a.example.com", b.id);
        assert!(r.lookup("a.example.com").is_some());
        r.remove("a.example.com", a.id);
        assert!(r.is_empty());
    }
}
