//! Classify an outbound HTTP(S) URL observed by the MITM proxy into a
//! canonical package identifier (a pURL), or into one of the
//! non-package outcomes below.
//!
//! [`classify`] is a pure, deterministic function: the first
//! ecosystem-specific pattern that matches the URL's host determines
//! the branch, and a sub-pattern within that branch determines the
//! outcome. `Skipped` means "known-irrelevant, don't log it as
//! interesting"; `Unclassified` means "caller should log/escalate".

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Outcome of classifying a single URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// A canonical package identifier, e.g. `pkg:pypi/requests@2.31.0`.
    Package(String),
    /// Intentionally filtered — known-irrelevant traffic.
    Skipped,
    /// Unknown URL shape; a visibility signal for callers.
    Unclassified,
    /// Filename had a `.whl` extension but didn't parse as PEP 491.
    BadPyWheel,
    /// Filename had a recognized sdist extension but didn't parse.
    BadPySource,
}

impl Outcome {
    /// The pURL string, if this outcome classified to a package.
    pub fn purl(&self) -> Option<&str> {
        match self {
            Outcome::Package(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped)
    }
}

struct ParsedUrl<'a> {
    host: &'a str,
    path: &'a str,
}

fn split_url(url: &str) -> Option<ParsedUrl<'_>> {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let (host_port, path) = match after_scheme.find('/') {
        Some(idx) => (&after_scheme[..idx], &after_scheme[idx..]),
        None => (after_scheme, "/"),
    };
    let host = host_port.split(':').next().unwrap_or(host_port);
    if host.is_empty() {
        return None;
    }
    Some(ParsedUrl { host, path })
}

/// Classify a URL. Never panics, runs in O(patterns) time and constant
/// memory with respect to the URL length.
pub fn classify(url: &str) -> Outcome {
    let Some(parsed) = split_url(url) else {
        return Outcome::Unclassified;
    };

    if let Some(outcome) = classify_oci(&parsed) {
        return outcome;
    }
    if let Some(outcome) = classify_git(&parsed) {
        return outcome;
    }
    if let Some(outcome) = classify_alpine(&parsed) {
        return outcome;
    }
    if let Some(outcome) = classify_pypi(&parsed) {
        return outcome;
    }
    if let Some(outcome) = classify_npm(&parsed) {
        return outcome;
    }
    if let Some(outcome) = classify_maven(&parsed) {
        return outcome;
    }
    if let Some(outcome) = classify_cargo(&parsed) {
        return outcome;
    }
    if let Some(outcome) = classify_gcs(&parsed) {
        return outcome;
    }
    if parsed.host == "auth.docker.io" {
        return Outcome::Skipped;
    }

    Outcome::Unclassified
}

const OCI_HOSTS: &[&str] = &["registry-1.docker.io", "ghcr.io"];

static OCI_MANIFEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v2/(?P<image>.+)/manifests/(?P<reference>[^/]+)$").unwrap());
static OCI_BLOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v2/(?P<image>.+)/blobs/(?P<digest>[^/]+)$").unwrap());

fn classify_oci(url: &ParsedUrl<'_>) -> Option<Outcome> {
    if !OCI_HOSTS.contains(&url.host) {
        return None;
    }
    if let Some(c) = OCI_MANIFEST.captures(url.path) {
        return Some(Outcome::Package(format!(
            "pkg:docker/{}@{}",
            &c["image"], &c["reference"]
        )));
    }
    if let Some(c) = OCI_BLOB.captures(url.path) {
        if url.path.contains("/blobs/uploads") {
            return Some(Outcome::Skipped);
        }
        return Some(Outcome::Package(format!(
            "pkg:docker-blob/{}@{}",
            &c["image"], &c["digest"]
        )));
    }
    Some(Outcome::Skipped)
}

static GIT_PACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/(?P<owner>[^/]+)/(?P<repo>[^/]+?)(?:\.git)?/(?:info/refs$|git-upload-pack$|git-receive-pack$|HEAD$|objects/info/|objects/pack/pack-[0-9a-f]+\.(?:pack|idx)$|objects/[0-9a-f]{2}/[0-9a-f]{38}$)").unwrap()
});

fn classify_git(url: &ParsedUrl<'_>) -> Option<Outcome> {
    if url.host != "github.com" {
        return None;
    }
    let c = GIT_PACK.captures(url.path)?;
    if url.path.ends_with("/info/refs")
        || url.path.ends_with("/git-receive-pack")
        || url.path.ends_with("/HEAD")
        || url.path.contains("/objects/info/")
    {
        return Some(Outcome::Skipped);
    }
    Some(Outcome::Package(format!(
        "pkg:github/{}/{}",
        &c["owner"], &c["repo"]
    )))
}

static ALPINE_APK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(?P<name>[A-Za-z0-9][A-Za-z0-9_+-]*?)-(?P<ver>[0-9][A-Za-z0-9.]*-r[0-9]+)\.apk$")
        .unwrap()
});

fn classify_alpine(url: &ParsedUrl<'_>) -> Option<Outcome> {
    if url.host != "dl-cdn.alpinelinux.org" {
        return None;
    }
    let c = ALPINE_APK.captures(url.path)?;
    Some(Outcome::Package(format!(
        "pkg:alpine/{}@{}",
        &c["name"], &c["ver"]
    )))
}

static PY_WHEEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<name>[A-Za-z0-9_.]+)-(?P<version>[A-Za-z0-9_.!+]+)-(?:(?P<build>[0-9][A-Za-z0-9_.]*)-)?(?P<pytag>[A-Za-z0-9_.]+)-(?P<abitag>[A-Za-z0-9_.]+)-(?P<platform>[A-Za-z0-9_.]+)\.whl$",
    )
    .unwrap()
});

const SDIST_EXTS: &[&str] = &[".tar.gz", ".zip", ".tar", ".tar.bz2", ".tar.xz", ".tar.Z"];

fn classify_pypi(url: &ParsedUrl<'_>) -> Option<Outcome> {
    if url.host == "pypi.org" && url.path.starts_with("/simple/") {
        return Some(Outcome::Skipped);
    }
    if url.host != "files.pythonhosted.org" {
        return None;
    }
    let filename = url.path.rsplit('/').next().unwrap_or(url.path);

    if filename.ends_with(".whl") {
        return Some(match PY_WHEEL.captures(filename) {
            Some(c) => Outcome::Package(format!("pkg:pypi/{}@{}", &c["name"], &c["version"])),
            None => Outcome::BadPyWheel,
        });
    }
    if filename.ends_with(".metadata") {
        return Some(Outcome::Skipped);
    }
    if filename.ends_with(".egg") {
        return Some(Outcome::Unclassified);
    }
    if let Some(ext) = SDIST_EXTS.iter().find(|ext| filename.ends_with(**ext)) {
        let stem = &filename[..filename.len() - ext.len()];
        return Some(match stem.rsplit_once('-') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Outcome::Package(format!("pkg:pypi/{name}@{version}"))
            }
            _ => Outcome::BadPySource,
        });
    }
    Some(Outcome::Unclassified)
}

const NPM_HOSTS: &[&str] = &["registry.npmjs.org", "registry.yarnpkg.com"];

static NPM_TARBALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/(?P<pkg>(?:@[^/]+/)?[^/]+)/-/[^/]+-(?P<version>[0-9][^/]*)\.tgz$").unwrap()
});

fn classify_npm(url: &ParsedUrl<'_>) -> Option<Outcome> {
    if !NPM_HOSTS.contains(&url.host) {
        return None;
    }
    if let Some(c) = NPM_TARBALL.captures(url.path) {
        return Some(Outcome::Package(format!(
            "pkg:npm/{}@{}",
            &c["pkg"], &c["version"]
        )));
    }
    Some(Outcome::Skipped)
}

const MAVEN_HOSTS: &[&str] = &["repo1.maven.org", "repo.maven.apache.org", "plugins.gradle.org"];

static MAVEN_ARTIFACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/(?:maven2|maven-releases|gradle-plugins)/(?P<group>[^/]+(?:/[^/]+)*)/(?P<artifact>[^/]+)/(?P<version>[^/]+)/[^/]+\.(?:jar|pom|module)$").unwrap()
});

fn classify_maven(url: &ParsedUrl<'_>) -> Option<Outcome> {
    if !MAVEN_HOSTS.contains(&url.host) {
        return None;
    }
    let c = MAVEN_ARTIFACT.captures(url.path)?;
    let group = c["group"].replace('/', ".");
    Some(Outcome::Package(format!(
        "pkg:maven/{}/{}@{}",
        group, &c["artifact"], &c["version"]
    )))
}

static CARGO_DOWNLOAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/api/v1/crates/(?P<name>[^/]+)/(?P<version>[^/]+)/download$").unwrap());
static CARGO_API: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^/api/v1/crates(?:/|$)").unwrap());

fn classify_cargo(url: &ParsedUrl<'_>) -> Option<Outcome> {
    if url.host != "crates.io" {
        return None;
    }
    if let Some(c) = CARGO_DOWNLOAD.captures(url.path) {
        return Some(Outcome::Package(format!(
            "pkg:cargo/{}@{}",
            &c["name"], &c["version"]
        )));
    }
    if CARGO_API.is_match(url.path) {
        return Some(Outcome::Skipped);
    }
    Some(Outcome::Unclassified)
}

static GCS_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/storage/v1/b/(?P<bucket>[^/]+)/o/(?P<object>[^/?]+)").unwrap());
static GCS_XML: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^/(?P<bucket>[^/]+)/(?P<object>.+)$").unwrap());
static GCS_SUBDOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<bucket>[^.]+)\.storage\.googleapis\.com$").unwrap());

fn classify_gcs(url: &ParsedUrl<'_>) -> Option<Outcome> {
    if url.host == "storage.googleapis.com" {
        if let Some(c) = GCS_JSON.captures(url.path) {
            return Some(Outcome::Package(format!(
                "pkg:generic/gcs/{}/{}",
                &c["bucket"], &c["object"]
            )));
        }
        if let Some(c) = GCS_XML.captures(url.path) {
            return Some(Outcome::Package(format!(
                "pkg:generic/gcs/{}/{}",
                &c["bucket"], &c["object"]
            )));
        }
        return None;
    }
    if let Some(c) = GCS_SUBDOMAIN.captures(url.host) {
        let object = url.path.trim_start_matches('/');
        if object.is_empty() {
            return None;
        }
        return Some(Outcome::Package(format!(
            "pkg:generic/gcs/{}/{}",
            &c["bucket"], object
        )));
    }
    None
}
