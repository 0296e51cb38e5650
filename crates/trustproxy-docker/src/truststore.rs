//! Locating a container's distro CA bundle and building the patch
//! that appends the proxy's CA certificate to it.

use anyhow::Result;
use chrono::Utc;
use trustproxy_fs::{ContainerFs, File, StatOutcome};

/// Well-known CA bundle paths, most-specific distro first. The first
/// one that stats as a regular file wins.
const CANDIDATES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt", // Debian, Ubuntu
    "/etc/pki/tls/certs/ca-bundle.crt",   // RHEL, CentOS, Fedora
    "/etc/ssl/cert.pem",                  // Alpine, Arch
    "/etc/ca-certificates/extracted/tls-ca-bundle.pem", // SUSE
];

/// Stat each candidate path in priority order and open the first one
/// that exists as a regular (non-directory, non-symlink-unresolved)
/// file, resolving symlinks along the way.
pub fn locate(fs: &ContainerFs) -> Result<Option<File>> {
    for path in CANDIDATES {
        match fs.stat(path)? {
            StatOutcome::Info(info) if info.is_symlink() => {
                return Ok(Some(fs.open_and_resolve(path)?));
            }
            StatOutcome::Info(info) if !info.is_dir() => {
                return Ok(Some(fs.open_and_resolve(path)?));
            }
            _ => continue,
        }
    }
    Ok(None)
}

/// Build the `after` side of a truststore patch: the existing bundle
/// with the proxy CA's PEM appended.
pub fn build_patched_file(truststore: &File, ca_pem: &str) -> File {
    let mut contents = truststore.contents.clone();
    if !contents.ends_with(b"\n") {
        contents.push(b'\n');
    }
    contents.extend_from_slice(ca_pem.as_bytes());

    let mut info = truststore.info.clone();
    info.size = contents.len() as u64;
    info.mtime = Utc::now();

    File {
        path: truststore.path.clone(),
        info,
        contents,
    }
}

/// Error raised when no candidate truststore path exists in the
/// container. Distinguished from other failures so the caller can
/// treat it as a warn-and-skip rather than fatal condition.
pub fn not_located_error(container_id: &str) -> anyhow::Error {
    anyhow::anyhow!("truststore not located in container {container_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustproxy_fs::FileInfo;

    fn file(path: &str, contents: &[u8]) -> File {
        File {
            path: path.to_string(),
            info: FileInfo {
                name: path.rsplit('/').next().unwrap().to_string(),
                size: contents.len() as u64,
                mode: 0o644,
                mtime: Utc::now(),
                link_target: None,
            },
            contents: contents.to_vec(),
        }
    }

    #[test]
    fn appends_pem_with_separating_newline() {
        let truststore = file("/etc/ssl/certs/ca-certificates.crt", b"-----BEGIN CERTIFICATE-----\n...\n-----END CERTIFICATE-----");
        let patched = build_patched_file(&truststore, "-----BEGIN CERTIFICATE-----\nPROXY\n-----END CERTIFICATE-----\n");
        assert!(patched.contents.ends_with(b"PROXY\n-----END CERTIFICATE-----\n"));
        assert_eq!(patched.info.size, patched.contents.len() as u64);
    }

    #[test]
    fn does_not_double_newline_when_already_present() {
        let truststore = file("/etc/ssl/cert.pem", b"existing\n");
        let patched = build_patched_file(&truststore, "added\n");
        assert_eq!(patched.contents, b"existing\nadded\n");
    }
}
