use cachetime_core::CacheStatus;
use std::collections::BTreeMap;

/// Headers inspected for a cache outcome, in priority order. The value
/// grammar varies by vendor; only the common HIT/MISS/DYNAMIC tokens are
/// recognised.
const STATUS_HEADERS: [&str; 7] = [
    "cf-cache-status",
    "x-cache",
    "x-cache-status",
    "x-cache-lookup",
    "cache-status",
    "x-proxy-cache",
    "x-vercel-cache",
];

fn parse_token(value: &str) -> CacheStatus {
    let value = value.to_ascii_lowercase();
    if value.contains("hit") {
        CacheStatus::Hit
    } else if value.contains("miss") || value.contains("expired") {
        CacheStatus::Miss
    } else if value.contains("dynamic") || value.contains("bypass") {
        CacheStatus::Dynamic
    } else {
        CacheStatus::None
    }
}

/// Read an advisory cache outcome off response headers. Corroborating
/// evidence only; many deployments strip or misreport these.
///
/// Expects lower-cased header names (the clients in this crate normalise
/// them on receipt).
pub fn cache_status(headers: &BTreeMap<String, String>) -> CacheStatus {
    for name in STATUS_HEADERS {
        if let Some(value) = headers.get(name) {
            let status = parse_token(value);
            if status != CacheStatus::None {
                return status;
            }
        }
    }

    if let Some(hits) = headers.get("x-cache-hits") {
        // Fastly-style: one count per cache node, comma separated.
        let any_hit = hits
            .split(',')
            .filter_map(|n| n.trim().parse::<u64>().ok())
            .any(|n| n > 0);
        if any_hit {
            return CacheStatus::Hit;
        }
        return CacheStatus::Miss;
    }

    if let Some(age) = headers.get("age") {
        if age.trim().parse::<u64>().map(|a| a > 0).unwrap_or(false) {
            return CacheStatus::Hit;
        }
    }

    CacheStatus::None
}

/// True when the response carries any cache-evidence header at all,
/// conclusive or not.
pub fn has_cache_headers(headers: &BTreeMap<String, String>) -> bool {
    STATUS_HEADERS.iter().any(|h| headers.contains_key(*h))
        || headers.contains_key("x-cache-hits")
        || headers.contains_key("age")
}
