//! `PatchEnvVarsDuring`: rewriting a `POST /containers/create` body to
//! inject the trust-store volume, environment variables, and
//! (optionally) the recursive-proxy socket mount.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde_json::Value;
use trustproxy_config::TruststoreConfig;

/// Fixed path the recursive-proxy socket is bind-mounted to inside
/// the container.
pub const RECURSIVE_PROXY_SOCKET_PATH: &str = "/var/cache/proxy.sock";

/// Monotonic counter backing the `proxy-vol<N>` volume names so that
/// concurrently created containers don't collide. Starts at 1.
pub struct VolumeCounter(AtomicU64);

impl VolumeCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Rewrite a `create` request body in place: append the trust-store
/// volume and environment variables, re-marshal, and return the new
/// bytes for the caller to set as the request body (updating
/// `Content-Length` itself).
pub fn patch_create_body(
    body: &[u8],
    truststore: &TruststoreConfig,
    recursive_proxy: bool,
    host_socket_path: Option<&str>,
    volumes: &VolumeCounter,
) -> Result<Vec<u8>> {
    let mut root: Value = serde_json::from_slice(body).context("envpatch: create body is not valid JSON")?;
    let obj = root.as_object_mut().context("envpatch: create body is not a JSON object")?;

    let host_config = obj
        .entry("HostConfig")
        .or_insert_with(|| Value::Object(Default::default()));
    let host_config = host_config
        .as_object_mut()
        .context("envpatch: HostConfig is not a JSON object")?;

    let binds = host_config
        .entry("Binds")
        .or_insert_with(|| Value::Array(Vec::new()));
    let binds = binds.as_array_mut().context("envpatch: HostConfig.Binds is not an array")?;

    let cert_dir = dirname(truststore.proxy_cert_path.to_string_lossy().as_ref());
    let volume_name = format!("proxy-vol{}", volumes.next());
    binds.push(Value::String(format!("{volume_name}:{cert_dir}:rw")));

    if recursive_proxy {
        let socket_path = host_socket_path.context("envpatch: recursive proxy enabled without a socket path")?;
        binds.push(Value::String(format!(
            "{socket_path}:{RECURSIVE_PROXY_SOCKET_PATH}:rw"
        )));
    }

    let env = obj.entry("Env").or_insert_with(|| Value::Array(Vec::new()));
    let env = env.as_array_mut().context("envpatch: Env is not an array")?;

    for var_name in &truststore.env_var_names {
        env.push(Value::String(format!(
            "{var_name}={}",
            truststore.proxy_cert_path.display()
        )));
    }

    if truststore.java {
        let existing = env
            .iter()
            .position(|v| v.as_str().is_some_and(|s| s.starts_with("JAVA_TOOL_OPTIONS=")));
        let trust_store_opt = format!("-Djavax.net.ssl.trustStore={}", truststore.proxy_jks_path.display());
        let merged = match existing {
            Some(idx) => {
                let current = env[idx].as_str().unwrap_or("");
                let (_, value) = current.split_once('=').unwrap_or(("", ""));
                let value = value.trim_matches('"');
                env.remove(idx);
                if value.is_empty() {
                    trust_store_opt
                } else {
                    format!("{value} {trust_store_opt}")
                }
            }
            None => trust_store_opt,
        };
        env.push(Value::String(format!("JAVA_TOOL_OPTIONS={merged}")));
    }

    if recursive_proxy {
        env.push(Value::String(format!(
            "DOCKER_HOST=unix://{RECURSIVE_PROXY_SOCKET_PATH}"
        )));
    }

    serde_json::to_vec(&root).context("envpatch: failed to re-marshal create body")
}

fn dirname(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
        // A relative proxy-cert-path config value is a
        // misconfiguration; fall back to the path itself rather than
        // panicking deep inside a request-handling path.
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cfg(java: bool) -> TruststoreConfig {
        TruststoreConfig {
            env_var_names: vec!["SSL_CERT_FILE".to_string(), "NODE_EXTRA_CA_CERTS".to_string()],
            java,
            proxy_cert_path: PathBuf::from("/var/cache/proxy-ca.pem"),
            proxy_jks_path: PathBuf::from("/var/cache/proxy-ca.jks"),
        }
    }

    #[test]
    fn injects_volume_and_env_vars() {
        let body = br#"{"Image":"alpine","HostConfig":{}}"#;
        let volumes = VolumeCounter::new();
        let out = patch_create_body(body, &cfg(false), false, None, &volumes).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();

        let binds = value["HostConfig"]["Binds"].as_array().unwrap();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].as_str().unwrap(), "proxy-vol1:/var/cache:rw");

        let env = value["Env"].as_array().unwrap();
        let env_strs: Vec<&str> = env.iter().map(|v| v.as_str().unwrap()).collect();
        assert!(env_strs.contains(&"SSL_CERT_FILE=/var/cache/proxy-ca.pem"));
        assert!(env_strs.contains(&"NODE_EXTRA_CA_CERTS=/var/cache/proxy-ca.pem"));
    }

    #[test]
    fn volume_counter_is_monotonic_across_calls() {
        let body = br#"{"Image":"alpine"}"#;
        let volumes = VolumeCounter::new();
        let first = patch_create_body(body, &cfg(false), false, None, &volumes).unwrap();
        let second = patch_create_body(body, &cfg(false), false, None, &volumes).unwrap();

        let first: Value = serde_json::from_slice(&first).unwrap();
        let second: Value = serde_json::from_slice(&second).unwrap();
        assert!(first["HostConfig"]["Binds"][0].as_str().unwrap().starts_with("proxy-vol1:"));
        assert!(second["HostConfig"]["Binds"][0].as_str().unwrap().starts_with("proxy-vol2:"));
    }

    #[test]
    fn merges_existing_java_tool_options_stripping_quotes() {
        let body = br#"{"Image":"alpine","Env":["JAVA_TOOL_OPTIONS=\"-Xmx512m\""]}"#;
        let volumes = VolumeCounter::new();
        let out = patch_create_body(body, &cfg(true), false, None, &volumes).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        let env: Vec<&str> = value["Env"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();

        let merged = env
            .iter()
            .find(|s| s.starts_with("JAVA_TOOL_OPTIONS="))
            .expect("merged JAVA_TOOL_OPTIONS present");
        assert_eq!(
            *merged,
            "JAVA_TOOL_OPTIONS=-Xmx512m -Djavax.net.ssl.trustStore=/var/cache/proxy-ca.jks"
        );
    }

    #[test]
    fn recursive_proxy_adds_socket_bind_and_docker_host() {
        let body = br#"{"Image":"alpine"}"#;
        let volumes = VolumeCounter::new();
        let out = patch_create_body(body, &cfg(false), true, Some("/var/run/trustproxy/abc.sock"), &volumes).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();

        let binds: Vec<&str> = value["HostConfig"]["Binds"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
        assert!(binds.iter().any(|b| b.ends_with(":/var/cache/proxy.sock:rw")));

        let env: Vec<&str> = value["Env"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
        assert!(env.contains(&"DOCKER_HOST=unix:///var/cache/proxy.sock"));
    }
}
