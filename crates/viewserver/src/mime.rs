use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;
use tracing::debug;

use crate::error::ViewServerError;
use crate::eval::{CallContext, CallError, Evaluator, ProviderHandle};

/// Default shorthand keys preloaded into every provider registry.
///
/// Ported from the Rails mime table; see
/// <http://www.iana.org/assignments/media-types/>.
const DEFAULT_TYPES: &[(&str, &[&str])] = &[
    ("all", &["*/*"]),
    ("text", &["text/plain; charset=utf-8", "txt"]),
    ("html", &["text/html; charset=utf-8"]),
    ("xhtml", &["application/xhtml+xml", "xhtml"]),
    ("xml", &["application/xml", "text/xml", "application/x-xml"]),
    (
        "js",
        &[
            "text/javascript",
            "application/javascript",
            "application/x-javascript",
        ],
    ),
    ("css", &["text/css"]),
    ("ics", &["text/calendar"]),
    ("csv", &["text/csv"]),
    ("rss", &["application/rss+xml"]),
    ("atom", &["application/atom+xml"]),
    ("yaml", &["application/x-yaml", "text/yaml"]),
    ("multipart_form", &["multipart/form-data"]),
    ("url_encoded_form", &["application/x-www-form-urlencoded"]),
    ("json", &["application/json", "text/x-json"]),
];

/// A parsed media range: `type/subtype` plus parameters, with the `q`
/// parameter lifted out and normalized.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaRange {
    pub kind: String,
    pub subtype: String,
    pub params: BTreeMap<String, String>,
    pub quality: f64,
}

/// Splits a mime string into `(type, subtype, params)`.
///
/// A bare `*` expands to `*/*`. Malformed inputs never fail; a missing
/// subtype parses as empty.
pub fn parse_mimetype(mimetype: &str) -> (String, String, BTreeMap<String, String>) {
    let parts: Vec<&str> = mimetype.split(';').collect();
    let mut params = BTreeMap::new();
    for item in &parts {
        if let Some((key, value)) = item.split_once('=') {
            params.insert(key.to_string(), value.to_string());
        }
    }
    let mut fulltype = parts[0].trim();
    if fulltype == "*" {
        fulltype = "*/*";
    }
    let (kind, subtype) = fulltype.split_once('/').unwrap_or((fulltype, ""));
    (kind.to_string(), subtype.to_string(), params)
}

/// Like [`parse_mimetype`] but reads the `q` parameter.
///
/// `q` must be a float in `[0, 1)`; anything else (including a missing or
/// unparsable value) normalizes to 1. An explicit `q=0` survives.
pub fn parse_media_range(range: &str) -> MediaRange {
    let (kind, subtype, mut params) = parse_mimetype(range);
    let q = params
        .remove("q")
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .unwrap_or(1.0);
    let quality = if (0.0..1.0).contains(&q) { q } else { 1.0 };
    MediaRange {
        kind,
        subtype,
        params,
        quality,
    }
}

/// Scores `mimetype` against a comma-separated `Accept` header.
///
/// An exact type match scores 100, an exact subtype match 10, and each extra
/// matching parameter 1 more. Wildcards match but contribute nothing. Returns
/// the best fitness together with the quality of the range that produced it;
/// `(-1, 0.0)` when nothing matches.
pub fn fitness_and_quality(mimetype: &str, ranges: &str) -> (i32, f64) {
    let base = parse_media_range(mimetype);
    let mut best_fitness = -1;
    let mut best_quality = 0.0;
    for range in ranges.split(',').map(parse_media_range) {
        let type_match = range.kind == base.kind || range.kind == "*" || base.kind == "*";
        let subtype_match =
            range.subtype == base.subtype || range.subtype == "*" || base.subtype == "*";
        if !(type_match && subtype_match) {
            continue;
        }
        let match_count = base
            .params
            .iter()
            .filter(|(key, value)| range.params.get(*key) == Some(value))
            .count() as i32;
        let mut fitness = if range.kind == base.kind { 100 } else { 0 };
        fitness += if range.subtype == base.subtype { 10 } else { 0 };
        fitness += match_count;
        if fitness > best_fitness {
            best_fitness = fitness;
            best_quality = range.quality;
        }
    }
    (best_fitness, best_quality)
}

/// Picks the best supported mime for an `Accept` header.
///
/// Candidates are ranked by `(fitness, quality, position)` and the last one
/// wins. A winner whose quality is zero yields the empty string: explicitly
/// unacceptable ranges never match.
pub fn best_match(supported: &[String], header: &str) -> String {
    let mut weighted: Vec<((i32, f64), usize, &String)> = supported
        .iter()
        .enumerate()
        .map(|(index, mime)| (fitness_and_quality(mime, header), index, mime))
        .collect();
    weighted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    debug!(?weighted, "best match rating, last wins");
    match weighted.last() {
        Some(&((_, quality), _, mime)) if quality > 0.0 => mime.clone(),
        _ => String::new(),
    }
}

/// Registry mapping shorthand keys to media types and render providers.
///
/// Type registrations live for the whole process; providers are scoped to a
/// single `show`/`list` call and cleared by [`reset_provides`].
///
/// [`reset_provides`]: MimeProvider::reset_provides
pub struct MimeProvider {
    mimes_by_key: BTreeMap<String, Vec<String>>,
    keys_by_mime: BTreeMap<String, String>,
    providers: Vec<(String, ProviderHandle)>,
    resp_content_type: Option<String>,
}

impl Default for MimeProvider {
    fn default() -> Self {
        let mut provider = MimeProvider {
            mimes_by_key: BTreeMap::new(),
            keys_by_mime: BTreeMap::new(),
            providers: Vec::new(),
            resp_content_type: None,
        };
        for (key, types) in DEFAULT_TYPES {
            provider.register_type(key, types.iter().map(|s| s.to_string()).collect());
        }
        provider
    }
}

impl MimeProvider {
    pub fn register_type(&mut self, key: &str, types: Vec<String>) {
        for mime in &types {
            self.keys_by_mime.insert(mime.clone(), key.to_string());
        }
        self.mimes_by_key.insert(key.to_string(), types);
    }

    /// Registers a render provider under `key`, replacing any previous
    /// provider for the same key in place.
    pub fn provides(&mut self, key: &str, provider: ProviderHandle) {
        if let Some(slot) = self.providers.iter_mut().find(|(k, _)| k == key) {
            slot.1 = provider;
        } else {
            self.providers.push((key.to_string(), provider));
        }
    }

    pub fn provides_used(&self) -> bool {
        !self.providers.is_empty()
    }

    pub fn reset_provides(&mut self) {
        self.providers.clear();
        self.resp_content_type = None;
    }

    pub fn resp_content_type(&self) -> Option<&str> {
        self.resp_content_type.as_deref()
    }

    /// Picks a provider for `req`, recording the negotiated content type.
    ///
    /// Selection order: an explicitly requested `?format=` key, then the best
    /// `Accept` match over the registered providers' media types, then the
    /// first provider registered.
    pub fn select(&mut self, req: &Value) -> Option<ProviderHandle> {
        let accept = req
            .get("headers")
            .and_then(|headers| headers.get("Accept"))
            .and_then(Value::as_str);
        let format = req
            .get("query")
            .and_then(|query| query.get("format"))
            .and_then(Value::as_str);

        let best_key = if let Some(format) = format {
            if let Some(types) = self.mimes_by_key.get(format) {
                self.resp_content_type = types.first().cloned();
            }
            Some(format.to_string())
        } else if let Some(accept) = accept {
            let supported: Vec<String> = self
                .providers
                .iter()
                .filter_map(|(key, _)| self.mimes_by_key.get(key))
                .flatten()
                .cloned()
                .collect();
            let matched = best_match(&supported, accept);
            self.resp_content_type = (!matched.is_empty()).then(|| matched.clone());
            self.keys_by_mime.get(&matched).cloned()
        } else {
            self.providers.first().map(|(key, _)| key.clone())
        };

        debug!(
            best_key = best_key.as_deref(),
            best_mime = self.resp_content_type.as_deref(),
            "provider selection"
        );
        let best_key = best_key?;
        self.lookup_provider(&best_key)
    }

    /// Falls back to an explicitly named provider key, recording its primary
    /// media type as the negotiated content type.
    pub fn select_fallback(&mut self, fallback: &str) -> Option<ProviderHandle> {
        let provider = self.lookup_provider(fallback)?;
        self.resp_content_type = self
            .mimes_by_key
            .get(fallback)
            .and_then(|types| types.first().cloned());
        Some(provider)
    }

    /// Human-readable list of everything registered, for error messages.
    pub fn supported_types(&self) -> String {
        self.mimes_by_key
            .iter()
            .map(|(key, types)| {
                if types.is_empty() {
                    key.clone()
                } else {
                    types.join(", ")
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    fn lookup_provider(&self, key: &str) -> Option<ProviderHandle> {
        self.providers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, provider)| provider.clone())
    }
}

/// Runs content negotiation for `req` and invokes the chosen provider.
///
/// With no acceptable provider, an optional registered `fallback` key is
/// consulted before failing with `not_acceptable`.
pub fn run_provides(
    evaluator: &dyn Evaluator,
    ctx: &Rc<RefCell<CallContext>>,
    req: &Value,
    fallback: Option<&str>,
) -> Result<Value, CallError> {
    let provider = ctx.borrow_mut().mime.select(req);
    if let Some(provider) = provider {
        return evaluator.call_provider(&provider);
    }
    if let Some(fallback) = fallback {
        let provider = ctx.borrow_mut().mime.select_fallback(fallback);
        if let Some(provider) = provider {
            return evaluator.call_provider(&provider);
        }
    }
    let (content_type, supported) = {
        let c = ctx.borrow();
        let accept = req
            .get("headers")
            .and_then(|headers| headers.get("Accept"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let content_type = accept.or_else(|| c.mime.resp_content_type().map(str::to_string));
        (content_type, c.mime.supported_types())
    };
    Err(CallError::Protocol(ViewServerError::error(
        "not_acceptable",
        format!(
            "Content-Type {} not supported, try one of:\n {supported}",
            content_type.unwrap_or_default()
        ),
    )))
}
