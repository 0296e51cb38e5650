//! The Docker API proxy itself: accepts client connections, classifies
//! each request, mutates/patches as needed, forwards to the real
//! daemon, and tunnels protocol upgrades through untouched.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use trustproxy_certfmt::{self as certfmt, Certificate};
use trustproxy_config::ProxyConfig;
use trustproxy_core::ProxyError;
use trustproxy_core::Reporter;
use trustproxy_core::reporter::NullReporter;
use trustproxy_fs::{ContainerFs, Dialer, File as ContainerFile, StatOutcome, WriteOutcome};
use trustproxy_http1::{Connection, Request, Response};
use trustproxy_patch::{Patch, PatchSetRegistry};

use crate::action::{classify, Action};
use crate::commit::{self, NULL_COMMIT_BODY};
use crate::dialer::UnixDialer;
use crate::envpatch::{self, VolumeCounter};
use crate::truststore;

/// The proxy's view of a client connection, abstracting over the TCP
/// listener and the (optional) recursive-proxy Unix socket listener.
enum ClientConn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for ClientConn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ClientConn::Tcp(s) => s.read(buf),
            ClientConn::Unix(s) => s.read(buf),
        }
    }
}

impl Write for ClientConn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ClientConn::Tcp(s) => s.write(buf),
            ClientConn::Unix(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ClientConn::Tcp(s) => s.flush(),
            ClientConn::Unix(s) => s.flush(),
        }
    }
}

impl ClientConn {
    fn try_clone(&self) -> std::io::Result<ClientConn> {
        match self {
            ClientConn::Tcp(s) => s.try_clone().map(ClientConn::Tcp),
            ClientConn::Unix(s) => s.try_clone().map(ClientConn::Unix),
        }
    }
}

/// Ties the config, patch-set registry, and proxy CA together for the
/// lifetime of a running proxy. Cheap to clone (everything inside is
/// already `Arc`-backed or `Copy`).
#[derive(Clone)]
pub struct Proxy {
    config: Arc<ProxyConfig>,
    registry: Arc<PatchSetRegistry>,
    cert_pem: Arc<String>,
    cert_jks: Arc<Option<Vec<u8>>>,
    volumes: Arc<VolumeCounter>,
}

impl Proxy {
    pub fn new(config: ProxyConfig, ca_cert: &Certificate) -> Result<Self> {
        let cert_pem = certfmt::to_pem(ca_cert);
        let cert_jks = if config.truststore.java {
            Some(certfmt::to_jks(ca_cert).context("proxy: failed to encode CA as JKS")?)
        } else {
            None
        };

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(PatchSetRegistry::new()),
            cert_pem: Arc::new(cert_pem),
            cert_jks: Arc::new(cert_jks),
            volumes: Arc::new(VolumeCounter::new()),
        })
    }

    /// Dial the daemon as a concrete `UnixStream`, with retry/backoff
    /// for the startup window. Used for the proxy's own forwarding
    /// connection, which needs `try_clone` for the upgrade tunnel —
    /// [`Self::fs_dialer`] covers the boxed-trait-object case
    /// `ContainerFs` needs for its one-shot archive API calls.
    fn dial_daemon(&self) -> Result<UnixStream> {
        let retry = self.config.retry.to_strategy_config();
        let executor = trustproxy_retry::RetryExecutor::new(retry);
        executor
            .run(|_| UnixStream::connect(&self.config.daemon.socket_path))
            .with_context(|| format!("proxy: failed to dial daemon socket {}", self.config.daemon.socket_path.display()))
    }

    fn fs_dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(UnixDialer::new(
            self.config.daemon.socket_path.clone(),
            self.config.retry.to_strategy_config(),
        ))
    }

    /// Run the proxy in the foreground: bind the TCP listener (and,
    /// if configured, a Unix socket for the recursive-proxy case),
    /// accepting connections forever. Each accepted connection is
    /// handled on its own thread.
    pub fn serve(&self, reporter: &mut dyn Reporter) -> Result<()> {
        let tcp = TcpListener::bind(&self.config.listen.tcp_addr)
            .with_context(|| format!("proxy: failed to bind {}", self.config.listen.tcp_addr))?;
        reporter.info(&format!("listening on tcp {}", self.config.listen.tcp_addr));

        let unix_listener = if self.config.listen.recursive_proxy {
            let dir = self
                .config
                .listen
                .unix_socket_dir
                .clone()
                .context("proxy: recursive_proxy enabled without listen.unix_socket_dir")?;
            std::fs::create_dir_all(&dir).context("proxy: failed to create unix socket dir")?;
            let path = dir.join("trustproxy.sock");
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path).context("proxy: failed to bind unix socket")?;
            set_socket_mode(&path, 0o660)?;
            reporter.info(&format!("listening on unix {}", path.display()));
            Some((listener, path))
        } else {
            None
        };

        if let Some((listener, _path)) = unix_listener {
            let this = self.clone();
            std::thread::spawn(move || {
                for stream in listener.incoming().flatten() {
                    let this = this.clone();
                    std::thread::spawn(move || {
                        let mut reporter = NullReporter;
                        let _ = this.handle_connection(ClientConn::Unix(stream), &mut reporter);
                    });
                }
            });
        }

        for stream in tcp.incoming() {
            let stream = stream.context("proxy: failed to accept tcp connection")?;
            let this = self.clone();
            std::thread::spawn(move || {
                let mut reporter = NullReporter;
                let _ = this.handle_connection(ClientConn::Tcp(stream), &mut reporter);
            });
        }

        Ok(())
    }

    fn handle_connection(&self, client: ClientConn, reporter: &mut dyn Reporter) -> Result<()> {
        let mut client_conn = Connection::new(client);
        let mut req = client_conn.read_request().context("proxy: failed to read client request")?;
        let action = classify(&req.method, &req.target);

        match action {
            Action::NoAction => self.forward(client_conn, req),

            Action::PatchEnvVarsDuring => match self.patch_env_vars(&mut req) {
                Ok(()) => self.forward(client_conn, req),
                Err(e) => self.write_error(client_conn, &ProxyError::from_anyhow(e)),
            },

            Action::PatchTruststoreBefore { container_id } => {
                match self.patch_truststore_before(&container_id, reporter) {
                    Ok(ActionOutcome::Continue) => self.forward(client_conn, req),
                    Ok(ActionOutcome::ClientError(err)) => self.write_error(client_conn, &err),
                    Err(fatal) => {
                        reporter.error(&format!("fatal invariant violation: {fatal:#}"));
                        std::process::exit(1);
                    }
                }
            }

            Action::UnpatchTruststoreDuring { container_id } => {
                self.handle_excursion(&container_id, client_conn, req, false, reporter)
            }

            Action::UnpatchTruststoreAndEnvVarsDuring { container_id } => {
                self.handle_excursion(&container_id, client_conn, req, true, reporter)
            }
        }
    }

    fn patch_env_vars(&self, req: &mut Request) -> Result<()> {
        let patched = envpatch::patch_create_body(
            &req.body,
            &self.config.truststore,
            self.config.listen.recursive_proxy,
            self.config
                .listen
                .unix_socket_dir
                .as_ref()
                .map(|d| d.join("trustproxy.sock"))
                .as_deref()
                .map(|p| p.to_string_lossy().into_owned())
                .as_deref(),
            &self.volumes,
        )?;
        req.set_header("Content-Length", patched.len().to_string());
        req.body = patched;
        Ok(())
    }

    /// The `export`/`commit` excursion: resolve the container id,
    /// lease its `PatchSet`, and hold that lock for the *entire*
    /// revert → forward → re-apply round trip so a concurrent request
    /// against the same container can't observe it mid-excursion.
    fn handle_excursion(
        &self,
        container_id: &str,
        client_conn: Connection<ClientConn>,
        mut req: Request,
        is_commit: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let dialer = self.fs_dialer();
        let fs = ContainerFs::new(dialer, container_id.to_string());

        let canonical_id = match fs.resolve_container_id() {
            Ok(id) => id,
            Err(e) => return self.write_error(client_conn, &ProxyError::from_anyhow(e)),
        };

        let patch_set = self.registry.lease(&canonical_id);
        let mut guard = patch_set.lock().expect("patch set mutex poisoned");

        if guard.is_empty() {
            drop(guard);
            return self.forward(client_conn, req);
        }

        let dialer = self.fs_dialer();
        let fs = ContainerFs::new(dialer, canonical_id.clone());
        if let Err(fatal) = guard.revert_all(&fs) {
            reporter.error(&format!("revert failed (fatal): {fatal:#}"));
            std::process::exit(1);
        }

        if is_commit {
            if let Err(e) = self.strip_commit_body(&canonical_id, &mut req, reporter) {
                if let Err(fatal) = guard.reapply_all(&fs) {
                    reporter.error(&format!("re-apply failed (fatal): {fatal:#}"));
                    std::process::exit(1);
                }
                return self.write_error(client_conn, &ProxyError::from_anyhow(e));
            }
        }

        let result = self.forward(client_conn, req);

        if let Err(fatal) = guard.reapply_all(&fs) {
            reporter.error(&format!("re-apply failed (fatal): {fatal:#}"));
            std::process::exit(1);
        }

        result
    }

    fn write_error(&self, mut conn: Connection<ClientConn>, err: &ProxyError) -> Result<()> {
        let status = err.http_status().unwrap_or(500);
        let body = err.to_string().into_bytes();
        let resp = Response {
            status,
            reason: String::new(),
            headers: vec![
                ("Content-Length".to_string(), body.len().to_string()),
                ("Connection".to_string(), "close".to_string()),
            ],
            body,
        };
        conn.write_response(&resp).context("proxy: failed to write error response")
    }

    /// Forward the (possibly mutated) request to the daemon and
    /// relay its response back, tunneling raw bytes through if the
    /// daemon answers an HTTP Upgrade with `101 Switching Protocols`.
    fn forward(&self, mut client_conn: Connection<ClientConn>, req: Request) -> Result<()> {
        let is_upgrade = req.header("upgrade").is_some()
            || req
                .header("connection")
                .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));

        let daemon_stream = self.dial_daemon()?;
        let mut daemon_conn = Connection::new(daemon_stream);
        daemon_conn.write_request(&req).context("proxy: failed to forward request")?;
        let mut resp = daemon_conn.read_response().context("proxy: failed to read daemon response")?;
        resp.set_header("Connection", "close");

        if is_upgrade && resp.is_upgrade() {
            client_conn.write_response(&resp).context("proxy: failed to write upgrade response")?;
            let (client_stream, client_leftover) = client_conn.into_parts();
            let (daemon_stream, daemon_leftover) = daemon_conn.into_parts();

            let client_write = client_stream.try_clone().context("proxy: failed to clone client stream")?;
            let daemon_write = daemon_stream.try_clone().context("proxy: failed to clone daemon stream")?;

            crate::tunnel::pump_split(
                client_stream,
                client_write,
                daemon_stream,
                daemon_write,
                client_leftover,
                daemon_leftover,
            );
            return Ok(());
        }

        client_conn.write_response(&resp).context("proxy: failed to write response to client")?;
        Ok(())
    }

    fn patch_truststore_before(&self, container_id: &str, reporter: &mut dyn Reporter) -> Result<ActionOutcome> {
        let dialer = self.fs_dialer();
        let fs = ContainerFs::new(dialer, container_id.to_string());

        let canonical_id = match fs.resolve_container_id() {
            Ok(id) => id,
            Err(e) => return Ok(ActionOutcome::ClientError(ProxyError::from_anyhow(e))),
        };

        let dialer = self.fs_dialer();
        let fs = ContainerFs::new(dialer, canonical_id.clone());

        self.write_proxy_cert_if_absent(&fs, reporter)?;

        let patch_set = self.registry.lease(&canonical_id);
        let mut guard = patch_set.lock().expect("patch set mutex poisoned");

        if !guard.is_empty() {
            reporter.info(&format!("{canonical_id}: already patched, skipping"));
            return Ok(ActionOutcome::Continue);
        }

        let truststore_file = match truststore::locate(&fs)? {
            Some(file) => file,
            None => {
                reporter.warn(&format!("{}", truststore::not_located_error(&canonical_id)));
                return Ok(ActionOutcome::Continue);
            }
        };

        let after = truststore::build_patched_file(&truststore_file, &self.cert_pem);
        let patch = match Patch::new(Some(truststore_file), Some(after)) {
            Ok(p) => p,
            Err(e) => {
                reporter.warn(&format!("{canonical_id}: patch creation failed, skipping: {e:#}"));
                return Ok(ActionOutcome::Continue);
            }
        };

        // Nothing has been pushed to the PatchSet yet, so a failed
        // apply here can't leave on-disk state diverged from it —
        // this is an operation-scoped failure, not a fatal one.
        if let Err(e) = patch.apply(&fs) {
            return Ok(ActionOutcome::ClientError(ProxyError::from_anyhow(e)));
        }
        guard.push(patch);

        Ok(ActionOutcome::Continue)
    }

    fn write_proxy_cert_if_absent(&self, fs: &ContainerFs, reporter: &mut dyn Reporter) -> Result<()> {
        let cert_path = self.config.truststore.proxy_cert_path.to_string_lossy().into_owned();
        match fs.stat(&cert_path)? {
            StatOutcome::Info(_) => {}
            _ => {
                let file = ContainerFile {
                    path: cert_path.clone(),
                    info: trustproxy_fs::FileInfo {
                        name: cert_path.rsplit('/').next().unwrap_or(&cert_path).to_string(),
                        size: self.cert_pem.len() as u64,
                        mode: 0o644,
                        mtime: chrono::Utc::now(),
                        link_target: None,
                    },
                    contents: self.cert_pem.as_bytes().to_vec(),
                };
                if let WriteOutcome::NotExist = fs.write_file(&file)? {
                    reporter.warn("failed to write proxy CA PEM, parent path missing");
                }
            }
        }

        if let Some(jks) = self.cert_jks.as_ref() {
            let jks_path = self.config.truststore.proxy_jks_path.to_string_lossy().into_owned();
            if matches!(fs.stat(&jks_path)?, StatOutcome::NotExist) {
                let file = ContainerFile {
                    path: jks_path.clone(),
                    info: trustproxy_fs::FileInfo {
                        name: jks_path.rsplit('/').next().unwrap_or(&jks_path).to_string(),
                        size: jks.len() as u64,
                        mode: 0o644,
                        mtime: chrono::Utc::now(),
                        link_target: None,
                    },
                    contents: jks.clone(),
                };
                fs.write_file(&file)?;
            }
        }

        Ok(())
    }

    fn strip_commit_body(&self, container_id: &str, req: &mut Request, reporter: &mut dyn Reporter) -> Result<()> {
        let names = commit::injected_names(&self.config.truststore.env_var_names, self.config.listen.recursive_proxy);
        let jks_path = self.config.truststore.proxy_jks_path.to_string_lossy().into_owned();

        if req.body.as_slice() == NULL_COMMIT_BODY.as_bytes() || req.body.is_empty() {
            self.commit_via_temporary_container(container_id, req, reporter)?;
            return Ok(());
        }

        let stripped = commit::strip_body(&req.body, &names, &jks_path)?;
        req.set_header("Content-Length", stripped.len().to_string());
        req.body = stripped;
        Ok(())
    }

    /// The `Config: null` commit special case: commit a temporary
    /// stripped-config image, create a temporary container from it,
    /// and redirect the outgoing `?container=` at that temporary
    /// container instead, leaving the body as `null`.
    fn commit_via_temporary_container(&self, container_id: &str, req: &mut Request, reporter: &mut dyn Reporter) -> Result<()> {
        let daemon = self.dial_daemon()?;
        let mut conn = Connection::new(daemon);

        let inspect_req = Request::new("GET", format!("/containers/{container_id}/json"));
        conn.write_request(&inspect_req)?;
        let inspect_resp = conn.read_response()?;
        if inspect_resp.status != 200 {
            bail!("proxy: failed to inspect container {container_id} for null-body commit");
        }

        let mut inspect: serde_json::Value = serde_json::from_slice(&inspect_resp.body)
            .context("proxy: malformed /json response during null-body commit")?;
        let mut config = inspect
            .get_mut("Config")
            .context("proxy: inspect response missing Config")?
            .take();

        let names = commit::injected_names(&self.config.truststore.env_var_names, self.config.listen.recursive_proxy);
        let jks_path = self.config.truststore.proxy_jks_path.to_string_lossy().into_owned();
        commit::strip_env_vars(&mut config, &names, &jks_path)?;

        let commit_body = serde_json::to_vec(&config)?;
        let daemon = self.dial_daemon()?;
        let mut conn = Connection::new(daemon);
        let mut commit_req = Request::new("POST", format!("/commit?container={container_id}"))
            .with_header("Content-Type", "application/json")
            .with_header("Content-Length", commit_body.len().to_string());
        commit_req.body = commit_body;
        conn.write_request(&commit_req)?;
        let commit_resp = conn.read_response()?;
        if commit_resp.status != 201 {
            bail!("proxy: failed to commit stripped-config image for {container_id}");
        }
        #[derive(serde::Deserialize)]
        struct CommitResp {
            #[serde(rename = "Id")]
            id: String,
        }
        let temp_image: CommitResp = serde_json::from_slice(&commit_resp.body)?;

        let daemon = self.dial_daemon()?;
        let mut conn = Connection::new(daemon);
        let create_body = serde_json::json!({ "Image": temp_image.id });
        let create_body = serde_json::to_vec(&create_body)?;
        let mut create_req = Request::new("POST", "/containers/create")
            .with_header("Content-Type", "application/json")
            .with_header("Content-Length", create_body.len().to_string());
        create_req.body = create_body;
        conn.write_request(&create_req)?;
        let create_resp = conn.read_response()?;
        if create_resp.status != 201 {
            bail!("proxy: failed to create temporary container for {container_id}");
        }
        #[derive(serde::Deserialize)]
        struct CreateResp {
            #[serde(rename = "Id")]
            id: String,
        }
        let temp_container: CreateResp = serde_json::from_slice(&create_resp.body)?;

        reporter.info(&format!(
            "{container_id}: null-body commit redirected through temporary container {}",
            temp_container.id
        ));
        req.target = rewrite_container_query(&req.target, &temp_container.id);
        Ok(())
    }
}

enum ActionOutcome {
    Continue,
    ClientError(ProxyError),
}

fn rewrite_container_query(target: &str, new_id: &str) -> String {
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    let rewritten: Vec<String> = query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| {
            if kv.starts_with("container=") {
                format!("container={new_id}")
            } else {
                kv.to_string()
            }
        })
        .collect();
    if rewritten.is_empty() {
        format!("{path}?container={new_id}")
    } else {
        format!("{path}?{}", rewritten.join("&"))
    }
}

#[cfg(unix)]
fn set_socket_mode(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("proxy: failed to set socket mode on {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_container_query_replaces_existing_id() {
        assert_eq!(
            rewrite_container_query("/commit?container=abc123&repo=x", "deadbeef"),
            "/commit?container=deadbeef&repo=x"
        );
    }

    #[test]
    fn rewrite_container_query_appends_when_missing() {
        assert_eq!(rewrite_container_query("/commit?repo=x", "deadbeef"), "/commit?repo=x&container=deadbeef");
    }
}
