//! Classifies a proxied request's path (and query string, for
//! `commit`) into the action the proxy takes before forwarding it.

use std::sync::LazyLock;

use regex::Regex;

/// What the proxy does with a request before (and after) forwarding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// `POST /containers/create` — rewrite the body to inject a
    /// trust-store volume and environment variables.
    PatchEnvVarsDuring,
    /// `POST /containers/{id}/{start,restart,unpause}` — ensure the
    /// container's truststore is patched before forwarding.
    PatchTruststoreBefore { container_id: String },
    /// `GET /containers/{id}/export` — revert, forward, re-apply.
    UnpatchTruststoreDuring { container_id: String },
    /// `POST /commit?container={id}` — revert, strip env vars from
    /// the body, forward, re-apply.
    UnpatchTruststoreAndEnvVarsDuring { container_id: String },
    /// Anything else: forward unmodified.
    NoAction,
}

/// Optional leading `/v1.xx` API version prefix the Docker CLI/SDK
/// sometimes includes.
static VERSION_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^/v[0-9]+(\.[0-9]+)?").unwrap());

static CREATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^/containers/create/?$").unwrap());
static START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/containers/([^/]+)/start/?$").unwrap());
static RESTART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/containers/([^/]+)/restart/?$").unwrap());
static UNPAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/containers/([^/]+)/unpause/?$").unwrap());
static EXPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/containers/([^/]+)/export/?$").unwrap());
static COMMIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^/commit/?$").unwrap());
static COMMIT_CONTAINER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|&)container=([^&]+)").unwrap());

/// Split a proxied request target into `(path, query)`, stripping any
/// leading API version prefix from the path.
fn split_target(target: &str) -> (&str, &str) {
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    let path = VERSION_PREFIX.replace(path, "");
    // `replace` returns a `Cow`; since we only ever strip a literal
    // prefix and borrow the rest, this is always the borrowed form.
    match path {
        std::borrow::Cow::Borrowed(p) => (p, query),
        std::borrow::Cow::Owned(_) => unreachable!("version prefix strip never allocates"),
    }
}

/// Classify a request by method, path, and query string.
pub fn classify(method: &str, target: &str) -> Action {
    let (path, query) = split_target(target);

    if method.eq_ignore_ascii_case("POST") && CREATE.is_match(path) {
        return Action::PatchEnvVarsDuring;
    }
    if method.eq_ignore_ascii_case("POST") {
        if let Some(caps) = START.captures(path).or_else(|| RESTART.captures(path)).or_else(|| UNPAUSE.captures(path)) {
            return Action::PatchTruststoreBefore {
                container_id: caps[1].to_string(),
            };
        }
        if COMMIT.is_match(path) {
            if let Some(caps) = COMMIT_CONTAINER.captures(query) {
                return Action::UnpatchTruststoreAndEnvVarsDuring {
                    container_id: urlencoding_decode(&caps[1]),
                };
            }
            return Action::NoAction;
        }
    }
    if method.eq_ignore_ascii_case("GET") {
        if let Some(caps) = EXPORT.captures(path) {
            return Action::UnpatchTruststoreDuring {
                container_id: caps[1].to_string(),
            };
        }
    }

    Action::NoAction
}

/// Minimal `application/x-www-form-urlencoded` decode for the
/// `?container=` query parameter — container ids/names never contain
/// characters beyond what Docker's own naming rules allow plus the
/// occasional encoded slash, so this only needs to handle `%XX`.
fn urlencoding_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
