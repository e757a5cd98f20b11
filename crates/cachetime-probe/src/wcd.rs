use crate::buster::CacheBuster;
use cachetime_core::{Error, Result, WcdMode};
use std::collections::BTreeSet;

/// Static-file extensions appended to attack URLs.
pub const EXTENSIONS: [&str; 1] = [".css"];

fn split_url(url: &str) -> Result<(String, String, Option<String>)> {
    let parsed =
        url::Url::parse(url).map_err(|e| Error::Crawl(format!("invalid url {url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Crawl(format!("url has no host: {url}")))?;
    let origin = match parsed.port() {
        Some(p) => format!("{}://{host}:{p}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    };
    let path = parsed.path().to_string();
    let query = parsed.query().map(|q| q.to_string());
    Ok((origin, path, query))
}

fn reassemble(origin: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{origin}{path}?{q}"),
        _ => format!("{origin}{path}"),
    }
}

/// Build a payloaded URL carrying a static-file extension. The token is
/// fresh on every call, so two generations of the same attack are always
/// distinct URLs.
///
/// The encoded delimiters are appended literally: `%3F`/`%3B` must reach
/// the origin un-decoded for the path-confusion to work, so the path is
/// spliced by hand rather than through a URL setter that would re-encode
/// the percent sign.
pub fn attack_url(
    buster: &mut CacheBuster,
    base: &str,
    mode: WcdMode,
    extension: &str,
) -> Result<String> {
    if mode == WcdMode::Direct {
        return Ok(base.to_string());
    }
    let tok = buster.unique_token();
    let (origin, path, query) = split_url(base)?;
    let path = match mode {
        WcdMode::PathParameter => {
            if path.ends_with('/') {
                format!("{path}{tok}{extension}")
            } else {
                format!("{path}/{tok}{extension}")
            }
        }
        WcdMode::EncodedQuestion => format!("{path}%3F{tok}{extension}"),
        WcdMode::EncodedSemicolon => format!("{path}%3B{tok}{extension}"),
        WcdMode::Direct => unreachable!(),
    };
    Ok(reassemble(&origin, &path, query.as_deref()))
}

fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            for lc in ch.to_lowercase() {
                cur.push(lc);
            }
        } else if !cur.is_empty() {
            out.push(std::mem::take(&mut cur));
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

fn shingles(tokens: &[String], k: usize) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if k == 0 || tokens.len() < k {
        return out;
    }
    for w in tokens.windows(k) {
        out.insert(w.join(" "));
    }
    out
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f64;
    let uni = a.union(b).count() as f64;
    inter / uni
}

/// Word-shingle similarity of two bodies, in [0, 1].
pub fn body_similarity(a: &str, b: &str) -> f64 {
    let sa = shingles(&tokenize(a), 3);
    let sb = shingles(&tokenize(b), 3);
    jaccard(&sa, &sb)
}

/// Identicality pre-check: two independently generated attack URLs whose
/// bodies match (byte-for-byte, or within `noise` when set) expose no
/// observable dynamism, so the (mode, extension) cell is skipped.
pub fn responses_identical(a: &str, b: &str, noise: f64) -> bool {
    if a == b {
        return true;
    }
    if noise <= 0.0 {
        return false;
    }
    body_similarity(a, b) >= 1.0 - noise
}
