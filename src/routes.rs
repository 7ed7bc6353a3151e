use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use color_eyre::eyre::Context;
use notify::RecommendedWatcher;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{directory::watch_file, droppable_handle::DroppableHandle};

// Target that routes a host to the administrative router.
pub(crate) const HOME_TARGET: &str = "home";
// Prefix that turns a target into a redirect.
pub(crate) const REDIRECT_PREFIX: char = '!';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteKind {
    Home,
    Proxy,
    Redirect,
}

// How requests for a host are handled. Only constructible through `parse` and the
// constructors below, so `Proxy` and `Redirect` always have a destination and `Home` never does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostRoute {
    kind: RouteKind,
    destination: Option<String>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum RouteError {
    #[error("Route must be in the form HOST=TARGET: {0}")]
    MissingSeparator(String),
    #[error("Empty host in route")]
    EmptyHost,
    #[error("Empty destination for host {0}")]
    EmptyDestination(String),
}

impl HostRoute {
    pub(crate) fn home() -> Self {
        HostRoute {
            kind: RouteKind::Home,
            destination: None,
        }
    }

    pub(crate) fn proxy(destination: impl Into<String>) -> Option<Self> {
        let destination = destination.into();
        (!destination.is_empty()).then_some(HostRoute {
            kind: RouteKind::Proxy,
            destination: Some(destination),
        })
    }

    pub(crate) fn redirect(destination: impl Into<String>) -> Option<Self> {
        let destination = destination.into();
        (!destination.is_empty()).then_some(HostRoute {
            kind: RouteKind::Redirect,
            destination: Some(destination),
        })
    }

    // Parse a target: `home`, `!redirect.host`, or a proxy destination.
    pub(crate) fn parse(host: &str, target: &str) -> Result<Self, RouteError> {
        let target = target.trim();
        if target == HOME_TARGET {
            return Ok(HostRoute::home());
        }
        let route = match target.strip_prefix(REDIRECT_PREFIX) {
            Some(redirect) => HostRoute::redirect(redirect.trim()),
            None => HostRoute::proxy(target),
        };
        route.ok_or_else(|| RouteError::EmptyDestination(host.to_string()))
    }

    pub(crate) fn kind(&self) -> RouteKind {
        self.kind
    }

    pub(crate) fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }
}

impl fmt::Display for HostRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.destination.as_deref()) {
            (RouteKind::Home, _) => f.write_str(HOME_TARGET),
            (RouteKind::Redirect, Some(destination)) => write!(f, "{REDIRECT_PREFIX}{destination}"),
            (_, destination) => f.write_str(destination.unwrap_or_default()),
        }
    }
}

// Canonical form of a hostname used as a routing key.
pub(crate) fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

// Parse a `HOST=TARGET` pair, as given on the command line.
pub(crate) fn parse_route_arg(value: &str) -> Result<(String, HostRoute), RouteError> {
    let (host, target) = value
        .split_once('=')
        .ok_or_else(|| RouteError::MissingSeparator(value.to_string()))?;
    let host = normalize_host(host.trim());
    if host.is_empty() {
        return Err(RouteError::EmptyHost);
    }
    let route = HostRoute::parse(&host, target)?;
    Ok((host, route))
}

pub(crate) type Routes = HashMap<String, HostRoute>;

// Parse every entry of a host to target map.
pub(crate) fn parse_routes<I, K, V>(entries: I) -> Result<Routes, RouteError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    entries
        .into_iter()
        .map(|(host, target)| {
            let host = normalize_host(host.as_ref().trim());
            if host.is_empty() {
                return Err(RouteError::EmptyHost);
            }
            let route = HostRoute::parse(&host, target.as_ref())?;
            Ok((host, route))
        })
        .collect()
}

// Host routing table, replaced wholesale on every reconfiguration.
#[derive(Debug)]
pub(crate) struct RouteTable {
    routes: RwLock<Arc<Routes>>,
    version: watch::Sender<u64>,
}

impl RouteTable {
    pub(crate) fn new(routes: Routes) -> Self {
        RouteTable {
            routes: RwLock::new(Arc::new(routes)),
            version: watch::Sender::new(0),
        }
    }

    // Look up the route for a host. Trailing dots and case are ignored.
    pub(crate) fn get(&self, host: &str) -> Option<HostRoute> {
        self.snapshot().get(&normalize_host(host)).cloned()
    }

    pub(crate) fn contains(&self, host: &str) -> bool {
        self.snapshot().contains_key(&normalize_host(host))
    }

    pub(crate) fn snapshot(&self) -> Arc<Routes> {
        let routes = self
            .routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&routes)
    }

    pub(crate) fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.snapshot().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub(crate) fn replace(&self, routes: Routes) {
        *self
            .routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(routes);
        self.version.send_modify(|version| *version += 1);
    }

    // Receive a notification every time the table is replaced.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

// Read a JSON object of host to target strings.
pub(crate) async fn load_routes_file(path: &Path) -> color_eyre::Result<Routes> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Error reading routes file {}", path.display()))?;
    let entries: HashMap<String, String> = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid routes file {}", path.display()))?;
    Ok(parse_routes(entries)?)
}

// Keeps the routing table in sync with a routes file.
pub(crate) struct RoutesFileWatcher {
    _watcher: RecommendedWatcher,
    _join_handle: DroppableHandle<()>,
}

impl RoutesFileWatcher {
    // Entries from the file take precedence over `base`. Invalid reloads are ignored.
    pub(crate) fn new(
        path: PathBuf,
        base: Routes,
        table: Arc<RouteTable>,
    ) -> color_eyre::Result<Self> {
        let (watcher, mut rx) = watch_file::<RecommendedWatcher>(&path)?;
        let join_handle = DroppableHandle(tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                // Debounce bursts of events from a single save.
                tokio::time::sleep(Duration::from_millis(500)).await;
                rx.mark_unchanged();
                match load_routes_file(&path).await {
                    Ok(routes) => {
                        let mut merged = base.clone();
                        merged.extend(routes);
                        info!(count = merged.len(), "Reloaded routes.");
                        table.replace(merged);
                    }
                    Err(error) => {
                        warn!(%error, path = %path.display(), "Ignoring invalid routes file.");
                    }
                }
            }
        }));
        Ok(RoutesFileWatcher {
            _watcher: watcher,
            _join_handle: join_handle,
        })
    }
}
