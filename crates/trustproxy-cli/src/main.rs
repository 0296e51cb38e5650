use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use trustproxy_core::{Certificate, ProxyConfig, Reporter};
use trustproxy_docker::Proxy;

#[derive(Parser, Debug)]
#[command(name = "trustproxy", version)]
#[command(about = "Transparent Docker API proxy that patches container trust stores in-band")]
struct Cli {
    /// Path to a `.trustproxy.toml` config file. Defaults to
    /// `.trustproxy.toml` in the current directory if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy in the foreground.
    Serve {
        /// Path to the Docker daemon's Unix socket.
        #[arg(long)]
        daemon_socket: Option<PathBuf>,

        /// TCP address the Docker API proxy listens on.
        #[arg(long)]
        listen: Option<String>,

        /// Bind an additional Unix socket for the recursive-proxy mode.
        #[arg(long)]
        recursive_proxy: bool,

        /// Write a Java KeyStore alongside the PEM truststore file.
        #[arg(long)]
        java: bool,

        /// Environment variable name to point at the PEM truststore
        /// (repeatable). Replaces the config/default list if given.
        #[arg(long = "trust-env-var")]
        trust_env_vars: Vec<String>,

        /// PEM-encoded CA certificate to inject into patched containers.
        #[arg(long)]
        ca_cert: PathBuf,
    },
    /// Classify a single URL and print the outcome.
    Classify {
        /// The URL to classify.
        url: String,
    },
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Serve {
            daemon_socket,
            listen,
            recursive_proxy,
            java,
            trust_env_vars,
            ca_cert,
        } => run_serve(
            cli.config,
            daemon_socket,
            listen,
            recursive_proxy,
            java,
            trust_env_vars,
            ca_cert,
        ),
        Commands::Classify { url } => run_classify(&url),
    }
}

fn load_config(config_path: Option<PathBuf>) -> Result<ProxyConfig> {
    let mut config = match config_path {
        Some(path) => ProxyConfig::load_from_file(&path)?,
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            ProxyConfig::load_from_workspace(&cwd)?.unwrap_or_default()
        }
    };
    config.apply_env_overrides();
    Ok(config)
}

fn run_serve(
    config_path: Option<PathBuf>,
    daemon_socket: Option<PathBuf>,
    listen: Option<String>,
    recursive_proxy: bool,
    java: bool,
    trust_env_vars: Vec<String>,
    ca_cert_path: PathBuf,
) -> Result<()> {
    let mut config = load_config(config_path)?;

    if let Some(socket) = daemon_socket {
        config.daemon.socket_path = socket;
    }
    if let Some(addr) = listen {
        config.listen.tcp_addr = addr;
    }
    if recursive_proxy {
        config.listen.recursive_proxy = true;
    }
    if java {
        config.truststore.java = true;
    }
    if !trust_env_vars.is_empty() {
        config.truststore.env_var_names = trust_env_vars;
    }
    config.validate()?;

    let ca_cert = load_ca_cert(&ca_cert_path)?;

    let proxy = Proxy::new(config, &ca_cert).context("failed to initialize proxy")?;
    let mut reporter = CliReporter;
    reporter.info("starting trustproxy");
    proxy.serve(&mut reporter)
}

fn load_ca_cert(path: &PathBuf) -> Result<Certificate> {
    let content = std::fs::read(path)
        .with_context(|| format!("failed to read CA certificate: {}", path.display()))?;

    if let Ok(text) = std::str::from_utf8(&content) {
        if let Ok(parsed) = pem::parse(text) {
            return Ok(Certificate::from_der(parsed.contents().to_vec()));
        }
    }
    bail!("{}: expected a PEM-encoded certificate", path.display());
}

fn run_classify(url: &str) -> Result<()> {
    let outcome = trustproxy_core::classifier::classify(url);
    match outcome.purl() {
        Some(purl) => println!("{purl}"),
        None => println!("{outcome:?}"),
    }
    Ok(())
}
