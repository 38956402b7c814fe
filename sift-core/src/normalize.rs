//! Canonicalization of raw indicator values
//!
//! Feeds report the same entity with superficial differences (case,
//! scheme prefixes, ports, zero-padded octets). `normalize` reduces a raw
//! value to the canonical form used as the deduplication key. It is total
//! and idempotent for every indicator type.

use crate::IndicatorType;

const SCHEMES: [&str; 2] = ["http://", "https://"];

/// Map a typed raw value to its canonical form
pub fn normalize(indicator_type: &IndicatorType, raw_value: &str) -> String {
    match indicator_type {
        IndicatorType::Ip => normalize_ip(raw_value),
        IndicatorType::Domain => normalize_domain(raw_value),
        IndicatorType::Url => normalize_url(raw_value),
        IndicatorType::Hash | IndicatorType::Email => raw_value.to_lowercase(),
        IndicatorType::Cve | IndicatorType::Other(_) => raw_value.trim().to_lowercase(),
    }
}

fn normalize_ip(ip: &str) -> String {
    let ip = ip.trim().to_lowercase();

    if is_dotted_quad(&ip) {
        return ip
            .split('.')
            .map(|octet| {
                let stripped = octet.trim_start_matches('0');
                if stripped.is_empty() { "0" } else { stripped }
            })
            .collect::<Vec<_>>()
            .join(".");
    }

    // IPv6 stays lowercase and unreduced (no zero compression)
    ip
}

fn is_dotted_quad(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

fn normalize_domain(domain: &str) -> String {
    let lowered = domain.to_lowercase();
    let host = strip_schemes(&lowered);
    let host = host.split('/').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    host.trim_end().to_string()
}

fn normalize_url(url: &str) -> String {
    let lowered = url.to_lowercase();
    let rest = strip_schemes(&lowered);
    let rest = rest.split('?').next().unwrap_or_default();
    let rest = rest.split('#').next().unwrap_or_default();
    rest.trim_end().to_string()
}

/// Trim and strip leading `http://`/`https://` until neither remains
fn strip_schemes(value: &str) -> &str {
    let mut rest = value.trim();
    while let Some(stripped) = SCHEMES.iter().find_map(|scheme| rest.strip_prefix(*scheme)) {
        rest = stripped.trim();
    }
    rest
}
