//! `UnpatchTruststoreAndEnvVarsDuring`: stripping proxy-injected
//! environment variables from a `/commit` request body before it
//! reaches the daemon, including the `Config: null` special case
//! where the daemon would otherwise re-read the live container's own
//! (proxy-tainted) config.

use anyhow::{Context, Result};
use serde_json::Value;

/// The literal body Docker sends when committing without a `Config`
/// override — the daemon re-reads the container's live config, which
/// would leak the proxy's injected env vars into the committed image.
pub const NULL_COMMIT_BODY: &str = "null\n";

/// Names of every environment variable the proxy may have injected,
/// so a commit can strip them back out.
pub fn injected_names(trust_env_vars: &[String], recursive_proxy: bool) -> Vec<String> {
    let mut names: Vec<String> = trust_env_vars.to_vec();
    names.push("JAVA_TOOL_OPTIONS".to_string());
    if recursive_proxy {
        names.push("DOCKER_HOST".to_string());
    }
    names
}

/// Strip the named env vars from a container spec's `Env` array
/// in-place. `JAVA_TOOL_OPTIONS` is special-cased: only the injected
/// `-Djavax.net.ssl.trustStore=...` token is removed, since a build
/// may have set other JVM options through the same variable.
pub fn strip_env_vars(config: &mut Value, names: &[String], proxy_jks_path: &str) -> Result<()> {
    let obj = config.as_object_mut().context("commit: Config is not a JSON object")?;
    let Some(env) = obj.get_mut("Env").and_then(Value::as_array_mut) else {
        return Ok(());
    };

    let trust_store_opt = format!("-Djavax.net.ssl.trustStore={proxy_jks_path}");

    env.retain_mut(|entry| {
        let Some(s) = entry.as_str() else { return true };
        let Some((name, value)) = s.split_once('=') else {
            return true;
        };

        if name == "JAVA_TOOL_OPTIONS" {
            let stripped: Vec<&str> = value
                .trim_matches('"')
                .split(' ')
                .filter(|tok| *tok != trust_store_opt)
                .collect();
            if stripped.is_empty() {
                return false;
            }
            *entry = Value::String(format!("JAVA_TOOL_OPTIONS={}", stripped.join(" ")));
            return true;
        }

        !names.iter().any(|n| n == name)
    });

    Ok(())
}

/// Rewrite a non-`null` commit body's `Config` object to remove
/// proxy-injected env vars, re-marshaling the whole body.
pub fn strip_body(body: &[u8], names: &[String], proxy_jks_path: &str) -> Result<Vec<u8>> {
    let mut root: Value = serde_json::from_slice(body).context("commit: body is not valid JSON")?;
    strip_env_vars(&mut root, names, proxy_jks_path)?;
    serde_json::to_vec(&root).context("commit: failed to re-marshal body")
}
