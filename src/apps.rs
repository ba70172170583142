//! Maps a query's source port to the application that sent it.
//!
//! On Linux the UDP socket tables (`/proc/net/udp`, `/proc/net/udp6`) give
//! the owning uid of a local port, and an Android-style `packages.list` maps
//! uids to package names. Attribution is best effort.

use std::collections::HashMap;
use std::path::PathBuf;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tokio::fs;
use tracing::{debug, info};

use crate::config::AppsConfig;

#[async_trait::async_trait]
pub trait AppResolver: Send + Sync {
    /// Package owning the local socket bound to `source_port`.
    async fn package_for_port(&self, source_port: u16) -> Option<String>;

    /// Label shown for `package` in logs.
    fn display_name(&self, package: &str) -> String {
        package.to_string()
    }

    /// Display name for log attribution; empty when unresolvable.
    async fn resolve_app_name(&self, source_port: u16) -> String {
        match self.package_for_port(source_port).await {
            Some(package) => self.display_name(&package),
            None => String::new(),
        }
    }
}

/// Resolver for hosts without per-app attribution.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAppResolver;

#[async_trait::async_trait]
impl AppResolver for NullAppResolver {
    async fn package_for_port(&self, _source_port: u16) -> Option<String> {
        None
    }
}

pub struct ProcNetAppResolver {
    proc_net_paths: Vec<PathBuf>,
    packages_path: Option<PathBuf>,
    labels: HashMap<String, String>,
    packages: ArcSwap<FxHashMap<u32, String>>,
}

impl ProcNetAppResolver {
    pub fn new(cfg: &AppsConfig) -> Self {
        Self {
            proc_net_paths: cfg.proc_net_paths.iter().map(PathBuf::from).collect(),
            packages_path: cfg.packages_path.as_ref().map(PathBuf::from),
            labels: cfg.labels.clone(),
            packages: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }

    /// Re-read the uid to package table. Returns the number of packages.
    pub async fn reload_packages(&self) -> usize {
        let Some(path) = &self.packages_path else {
            return 0;
        };
        match fs::read_to_string(path).await {
            Ok(text) => {
                let map = parse_packages_list(&text);
                let count = map.len();
                self.packages.store(map.into());
                info!("Loaded {} packages from {}", count, path.display());
                count
            }
            Err(e) => {
                debug!("Cannot read {}: {}", path.display(), e);
                0
            }
        }
    }

    async fn uid_for_port(&self, port: u16) -> Option<u32> {
        for path in &self.proc_net_paths {
            match fs::read_to_string(path).await {
                Ok(text) => {
                    if let Some(uid) = uid_for_local_port(&text, port) {
                        return Some(uid);
                    }
                }
                Err(e) => debug!("Cannot read {}: {}", path.display(), e),
            }
        }
        None
    }
}

#[async_trait::async_trait]
impl AppResolver for ProcNetAppResolver {
    async fn package_for_port(&self, source_port: u16) -> Option<String> {
        let uid = self.uid_for_port(source_port).await?;
        self.packages.load().get(&uid).cloned()
    }

    fn display_name(&self, package: &str) -> String {
        self.labels
            .get(package)
            .cloned()
            .unwrap_or_else(|| package.to_string())
    }
}

/// Owning uid of the socket bound to local `port` in a `/proc/net/udp`
/// style table.
pub fn uid_for_local_port(table: &str, port: u16) -> Option<u32> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let local = fields.get(1)?;
        let (_, hex_port) = local.rsplit_once(':')?;
        if u16::from_str_radix(hex_port, 16).ok()? != port {
            return None;
        }
        fields.get(7)?.parse().ok()
    })
}

/// `package uid ...` lines. The first package listed for a shared uid wins.
pub fn parse_packages_list(text: &str) -> FxHashMap<u32, String> {
    let mut map = FxHashMap::default();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(package), Some(uid)) = (fields.next(), fields.next()) else {
            continue;
        };
        if let Ok(uid) = uid.parse::<u32>() {
            map.entry(uid).or_insert_with(|| package.to_string());
        }
    }
    map
}
