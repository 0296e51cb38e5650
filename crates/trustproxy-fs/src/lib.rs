//! Stat/Open/Write/Resolve files inside a running container over the
//! Docker `/containers/{id}/archive` endpoint.
//!
//! Every call opens its own connection through a [`Dialer`] — the
//! underlying transport (`trustproxy-http1`) is one-shot, so a
//! `ContainerFs` is cheap to construct per request and holds only a
//! weak reference to however connections get dialed.

use std::io::{Cursor, Read};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use trustproxy_http1::{Connection, Request};

/// `os.ModeSymlink` as Go (and therefore the Docker daemon) encodes
/// it: bit 27 of the 32-bit mode word.
pub const MODE_SYMLINK: u32 = 1 << 27;
/// `os.ModeDir`, bit 31.
pub const MODE_DIR: u32 = 1 << 31;

const MAX_SYMLINK_CHAIN: u32 = 255;

/// Something that can open a fresh byte stream to the Docker daemon.
/// Implementations dial a Unix socket or TCP address; trait-object
/// friendly since `ContainerFs` only ever needs to hold one weakly.
pub trait Dialer: Send + Sync {
    fn dial(&self) -> Result<Box<dyn ReadWrite>>;
}

pub trait ReadWrite: Read + std::io::Write {}
impl<T: Read + std::io::Write> ReadWrite for T {}

#[derive(Debug, thiserror::Error)]
#[error("container not found: {0}")]
pub struct ContainerNotFound(pub String);

#[derive(Debug, Clone, Deserialize)]
struct RawStat {
    name: String,
    size: u64,
    mode: u32,
    mtime: String,
    #[serde(rename = "linkTarget", default)]
    link_target: String,
}

/// Metadata Docker returns for a path inside a container's filesystem.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    pub link_target: Option<String>,
}

impl FileInfo {
    pub fn is_symlink(&self) -> bool {
        self.mode & MODE_SYMLINK != 0
    }

    pub fn is_dir(&self) -> bool {
        self.mode & MODE_DIR != 0
    }

    fn from_raw(raw: RawStat) -> Result<Self> {
        let mtime = DateTime::parse_from_rfc3339(&raw.mtime)
            .context("fs: malformed mtime in path-stat header")?
            .with_timezone(&Utc);
        Ok(Self {
            name: raw.name,
            size: raw.size,
            mode: raw.mode,
            mtime,
            link_target: if raw.link_target.is_empty() {
                None
            } else {
                Some(raw.link_target)
            },
        })
    }
}

/// A file (or symlink) pulled out of, or destined for, a container's
/// filesystem. Ownership is by value — reading or writing copies.
#[derive(Debug, Clone)]
pub struct File {
    pub path: String,
    pub info: FileInfo,
    pub contents: Vec<u8>,
}

pub enum StatOutcome {
    Info(FileInfo),
    NotExist,
    Invalid,
}

pub enum OpenOutcome {
    File(File),
    NotExist,
    Invalid,
}

pub enum WriteOutcome {
    Ok,
    NotExist,
}

/// A handle onto one container's filesystem via the Docker archive API.
pub struct ContainerFs {
    dialer: Arc<dyn Dialer>,
    container_id: String,
}

impl ContainerFs {
    pub fn new(dialer: Arc<dyn Dialer>, container_id: impl Into<String>) -> Self {
        Self {
            dialer,
            container_id: container_id.into(),
        }
    }

    fn archive_target(&self, path: &str) -> String {
        format!(
            "/containers/{}/archive?path={}",
            self.container_id,
            percent_encode(path)
        )
    }

    pub fn stat(&self, path: &str) -> Result<StatOutcome> {
        if !path.starts_with('/') {
            bail!("fs: path must be absolute: {path}");
        }
        let req = Request::new("HEAD", self.archive_target(path));
        let resp = self.roundtrip(req)?;

        match resp.status {
            400 => Ok(StatOutcome::Invalid),
            404 => Ok(StatOutcome::NotExist),
            200 => {
                let header = resp
                    .header("x-docker-container-path-stat")
                    .context("fs: 200 response missing X-Docker-Container-Path-Stat")?;
                let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, header)
                    .context("fs: path-stat header is not valid base64")?;
                let raw: RawStat =
                    serde_json::from_slice(&decoded).context("fs: path-stat header is not valid JSON")?;
                Ok(StatOutcome::Info(FileInfo::from_raw(raw)?))
            }
            other => bail!("fs: unexpected stat response status {other}"),
        }
    }

    pub fn open(&self, path: &str) -> Result<OpenOutcome> {
        if !path.starts_with('/') {
            bail!("fs: path must be absolute: {path}");
        }
        let req = Request::new("GET", self.archive_target(path));
        let resp = self.roundtrip(req)?;

        match resp.status {
            400 => return Ok(OpenOutcome::Invalid),
            404 => return Ok(OpenOutcome::NotExist),
            200 => {}
            other => bail!("fs: unexpected open response status {other}"),
        }

        let mut archive = tar::Archive::new(Cursor::new(resp.body));
        let mut entries = archive.entries().context("fs: malformed tar stream")?;

        let mut entry = entries
            .next()
            .context("fs: empty tar stream")?
            .context("fs: malformed tar entry")?;

        if entry.header().entry_type().is_dir() {
            return Ok(OpenOutcome::Invalid);
        }

        let mode = entry.header().mode().unwrap_or(0);
        let mtime_secs = entry.header().mtime().unwrap_or(0) as i64;
        let mtime = DateTime::from_timestamp(mtime_secs, 0).unwrap_or_else(Utc::now);
        let link_target = entry
            .link_name()
            .ok()
            .flatten()
            .map(|p| p.to_string_lossy().into_owned());
        let is_symlink = entry.header().entry_type().is_symlink();

        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .context("fs: failed to read tar entry contents")?;

        if entries.next().is_some() {
            // A directory's archive tars up its children alongside it;
            // more than one entry means `path` wasn't a regular file.
            return Ok(OpenOutcome::Invalid);
        }

        let mode = if is_symlink { mode | MODE_SYMLINK } else { mode };

        Ok(OpenOutcome::File(File {
            path: path.to_string(),
            info: FileInfo {
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                size: contents.len() as u64,
                mode,
                mtime,
                link_target,
            },
            contents,
        }))
    }

    /// Iteratively follow symlinks (relative targets joined against
    /// the parent directory of the path being resolved) until a
    /// regular file is found, or the chain exceeds 255 hops.
    pub fn open_and_resolve(&self, path: &str) -> Result<File> {
        let mut current = path.to_string();
        for _ in 0..MAX_SYMLINK_CHAIN {
            match self.stat(&current)? {
                StatOutcome::NotExist => bail!("fs: {current} does not exist"),
                StatOutcome::Invalid => bail!("fs: {current} is not a valid path"),
                StatOutcome::Info(info) if info.is_symlink() => {
                    current = join_link_target(&current, info.link_target.as_deref().unwrap_or(""));
                }
                StatOutcome::Info(_) => {
                    return match self.open(&current)? {
                        OpenOutcome::File(file) => Ok(file),
                        OpenOutcome::NotExist => bail!("fs: {current} does not exist"),
                        OpenOutcome::Invalid => bail!("fs: {current} is not a valid path"),
                    };
                }
            }
        }
        bail!("fs: too many levels of symbolic links resolving {path}")
    }

    /// Given a `File` already known to be a symlink, open its target.
    pub fn resolve(&self, file: &File) -> Result<File> {
        if !file.info.is_symlink() {
            bail!("fs: resolve called on a non-symlink: {}", file.path);
        }
        let target = join_link_target(&file.path, file.info.link_target.as_deref().unwrap_or(""));
        self.open_and_resolve(&target)
    }

    pub fn write_file(&self, file: &File) -> Result<WriteOutcome> {
        let dir = dirname(&file.path);
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            let mut header = tar::Header::new_gnu();
            header.set_path(file.path.trim_start_matches('/'))?;
            header.set_size(file.contents.len() as u64);
            header.set_mode(file.info.mode & 0o7777);
            header.set_mtime(file.info.mtime.timestamp() as u64);
            if file.info.is_symlink() {
                header.set_entry_type(tar::EntryType::Symlink);
                if let Some(target) = &file.info.link_target {
                    header.set_link_name(target)?;
                }
                header.set_cksum();
                builder.append(&header, std::io::empty())?;
            } else {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_cksum();
                builder.append(&header, file.contents.as_slice())?;
            }
            builder.finish()?;
        }

        let target = format!(
            "/containers/{}/archive?path={}",
            self.container_id,
            percent_encode(&dir)
        );
        let req = Request::new("PUT", target)
            .with_header("Content-Type", "application/x-tar")
            .with_header("Content-Length", tar_bytes.len().to_string());
        let mut req = req;
        req.body = tar_bytes;

        let resp = self.roundtrip(req)?;
        match resp.status {
            200 | 201 => Ok(WriteOutcome::Ok),
            400 | 404 => Ok(WriteOutcome::NotExist),
            other => bail!("fs: unexpected write response status {other}"),
        }
    }

    /// Resolve a possibly short container id/name to its canonical
    /// full id via `/containers/{id}/json`.
    pub fn resolve_container_id(&self) -> Result<String> {
        let req = Request::new("GET", format!("/containers/{}/json", self.container_id));
        let resp = self.roundtrip(req)?;

        if resp.status == 404 {
            return Err(ContainerNotFound(self.container_id.clone()).into());
        }
        if resp.status != 200 {
            bail!("fs: unexpected /json response status {}", resp.status);
        }

        #[derive(Deserialize)]
        struct Inspect {
            #[serde(rename = "Id")]
            id: String,
        }
        let inspect: Inspect =
            serde_json::from_slice(&resp.body).context("fs: malformed container inspect body")?;
        Ok(inspect.id)
    }

    fn roundtrip(&self, req: Request) -> Result<trustproxy_http1::Response> {
        let stream = self.dialer.dial().context("fs: failed to dial docker daemon")?;
        let mut conn = Connection::new(stream);
        conn.write_request(&req).context("fs: failed to write request")?;
        conn.read_response().context("fs: failed to read response")
    }
}

fn dirname(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
        None => "/".to_string(),
    }
}

fn join_link_target(path: &str, target: &str) -> String {
    if target.starts_with('/') {
        target.to_string()
    } else {
        format!("{}/{}", dirname(path), target)
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirname_handles_root_and_nested() {
        assert_eq!(dirname("/etc/ssl/certs/ca-certificates.crt"), "/etc/ssl/certs");
        assert_eq!(dirname("/etc"), "/");
    }

    #[test]
    fn join_link_target_handles_absolute_and_relative() {
        assert_eq!(join_link_target("/etc/ssl/cert.pem", "/etc/ssl/certs/ca.pem"), "/etc/ssl/certs/ca.pem");
        assert_eq!(join_link_target("/etc/ssl/cert.pem", "certs/ca.pem"), "/etc/ssl/certs/ca.pem");
    }

    #[test]
    fn percent_encode_escapes_reserved_bytes() {
        assert_eq!(percent_encode("/a b"), "/a%20b");
        assert_eq!(percent_encode("/etc/ssl/certs"), "/etc/ssl/certs");
    }

    #[test]
    fn raw_stat_parses_symlink_mode() {
        let info = FileInfo::from_raw(RawStat {
            name: "cert.pem".to_string(),
            size: 0,
            mode: MODE_SYMLINK | 0o777,
            mtime: "2024-01-01T00:00:00Z".to_string(),
            link_target: "ca-certificates.crt".to_string(),
        })
        .expect("parse");
        assert!(info.is_symlink());
        assert_eq!(info.link_target.as_deref(), Some("ca-certificates.crt"));
    }
}
