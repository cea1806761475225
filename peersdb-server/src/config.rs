use crate::Cli;
use peersdb_core::{NodeOptions, PeersError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// URL peers use to reach this node. Derived from `bind_addr` when unset.
    #[serde(default)]
    pub advertise_url: Option<String>,
    #[serde(default)]
    pub root: bool,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub http: bool,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    #[serde(default)]
    pub benchmark: bool,
    #[serde(default)]
    pub full_replica: bool,
    #[serde(default)]
    pub region: String,
    /// Peer URL to CONNECT to once the node is up.
    #[serde(default)]
    pub bootstrap: Option<String>,
    #[serde(default)]
    pub dev_logs: bool,
}

fn default_repo() -> String {
    "peersdb".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_bind_addr() -> String {
    "127.0.0.1:4001".to_string()
}

fn default_download_dir() -> String {
    "~/Downloads/".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo: default_repo(),
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            advertise_url: None,
            root: false,
            shell: false,
            http: false,
            download_dir: default_download_dir(),
            benchmark: false,
            full_replica: false,
            region: String::new(),
            bootstrap: None,
            dev_logs: false,
        }
    }
}

impl Config {
    /// Layer an optional file and `PEERSDB_*` variables over the defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }

        let settings = builder
            .add_source(::config::Environment::with_prefix("PEERSDB"))
            .build()
            .map_err(|e| PeersError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| PeersError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Command-line flags win over file and environment values.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(repo) = &cli.repo {
            self.repo = repo.clone();
        }
        if let Some(data_dir) = &cli.data_dir {
            self.data_dir = data_dir.clone();
        }
        if let Some(bind_addr) = &cli.bind_addr {
            self.bind_addr = bind_addr.clone();
        }
        if let Some(advertise_url) = &cli.advertise_url {
            self.advertise_url = Some(advertise_url.clone());
        }
        if let Some(download_dir) = &cli.download_dir {
            self.download_dir = download_dir.clone();
        }
        if let Some(region) = &cli.region {
            self.region = region.clone();
        }
        if let Some(bootstrap) = &cli.bootstrap {
            self.bootstrap = Some(bootstrap.clone());
        }

        self.root |= cli.root;
        self.shell |= cli.shell;
        self.http |= cli.http;
        self.benchmark |= cli.benchmark;
        self.full_replica |= cli.full_replica;
        self.dev_logs |= cli.dev_logs;
    }

    pub fn validate(&self) -> Result<()> {
        if self.repo.trim().is_empty() {
            return Err(PeersError::Config("repo cannot be empty".to_string()));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(PeersError::Config("bind_addr cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn effective_advertise_url(&self) -> String {
        match &self.advertise_url {
            Some(url) if !url.trim().is_empty() => normalize_url(url),
            _ => normalize_url(&self.bind_addr),
        }
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            repo: self.repo.clone(),
            data_dir: self.data_dir.clone(),
            download_dir: self.download_dir.clone(),
            benchmark: self.benchmark,
            full_replica: self.full_replica,
            root: self.root,
            region: self.region.clone(),
        }
    }
}

/// Default `EnvFilter` directives when `RUST_LOG` is unset.
pub fn log_filter(dev_logs: bool) -> &'static str {
    if dev_logs {
        "peersdb=debug,peersdb_core=debug,peersdb_server=debug"
    } else {
        "peersdb=info,peersdb_core=info,peersdb_server=info"
    }
}

/// Add an http scheme to bare `host:port` addresses and drop trailing slashes.
pub fn normalize_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}
