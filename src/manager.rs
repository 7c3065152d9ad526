//! Forward manager: registry, persistence, lifecycle, hot reload
//!
//! The manager is the authoritative owner of forward definitions and their
//! running forwarders. Every operation runs as one exclusive critical
//! section over the definition map (operations are human/IDE-driven, so
//! correctness beats throughput there), while the forwarder map is a
//! concurrent [`DashMap`] so status reads never stall behind a slow
//! start or stop.
//!
//! Each mutating operation follows the same sequence: validate, store,
//! persist, reconcile. Reconciliation compares routing parameters: only
//! changes to the listen port, the variant, or remote routing tear a
//! running forwarder down — group moves and enabled flips via upsert leave
//! open connections untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ClusterCache;
use crate::config::{ConfigFile, ConfigStore};
use crate::forward::{ForwardDefinition, Forwarder};
use crate::{Error, Result};

/// Derived view of one group of forwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStatus {
    /// True iff at least one member is enabled.
    pub enabled: bool,
    /// Number of member definitions.
    pub forward_count: usize,
    /// Number of members with a running forwarder.
    pub active_forward_count: usize,
}

/// Counts returned by [`ForwardManager::apply_config`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Definitions created by the merge.
    pub added: usize,
    /// Definitions that already existed and were replaced.
    pub updated: usize,
    /// In-scope definitions deleted because they were missing from the
    /// payload (`remove_missing`).
    pub removed: usize,
}

/// Registry and lifecycle controller for all forwards.
pub struct ForwardManager {
    definitions: Mutex<BTreeMap<String, ForwardDefinition>>,
    forwarders: DashMap<String, Arc<Forwarder>>,
    cache: Arc<ClusterCache>,
    store: ConfigStore,
    shutdown: CancellationToken,
    /// Serialized payload of the last config the manager wrote or loaded,
    /// used to tell self-writes apart from out-of-band edits.
    last_synced: StdMutex<Option<String>>,
}

impl ForwardManager {
    /// Create a manager over the given store and Kubernetes cache. The
    /// `shutdown` token is the daemon-wide cancellation root; every
    /// forwarder the manager creates inherits it.
    pub fn new(store: ConfigStore, cache: Arc<ClusterCache>, shutdown: CancellationToken) -> Self {
        Self {
            definitions: Mutex::new(BTreeMap::new()),
            forwarders: DashMap::new(),
            cache,
            store,
            shutdown,
            last_synced: StdMutex::new(None),
        }
    }

    /// Load the config file if present and start every enabled forward.
    /// Per-forward start failures leave the definition present but
    /// disabled; a parse failure starts the daemon with an empty registry.
    pub async fn initialize(&self) {
        let mut defs = self.definitions.lock().await;
        *defs = match self.load_from_disk() {
            Ok(forwards) => forwards,
            Err(e) => {
                warn!(error = %e, "Failed to load config, starting with empty registry");
                BTreeMap::new()
            }
        };
        info!(forwards = defs.len(), "Configuration loaded");

        if self.start_enabled(&mut defs).await {
            if let Err(e) = self.persist(&defs) {
                warn!(error = %e, "Failed to persist startup state");
            }
        }
    }

    /// Snapshot of all definitions.
    pub async fn get_all(&self) -> Vec<ForwardDefinition> {
        self.definitions.lock().await.values().cloned().collect()
    }

    /// Look up one definition by name.
    pub async fn get(&self, name: &str) -> Option<ForwardDefinition> {
        self.definitions.lock().await.get(name).cloned()
    }

    /// The running forwarder for a name, if any.
    pub fn forwarder(&self, name: &str) -> Option<Arc<Forwarder>> {
        self.forwarders.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every running forwarder with its live counters.
    pub fn get_active(&self) -> Vec<Arc<Forwarder>> {
        self.forwarders
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of running forwarders.
    pub fn active_count(&self) -> usize {
        self.forwarders.len()
    }

    /// Number of definitions in the registry.
    pub async fn total_count(&self) -> usize {
        self.definitions.lock().await.len()
    }

    /// Validate and store a definition, persist, and reconcile the running
    /// forwarder against it.
    ///
    /// A bind conflict while (re)starting stores the definition with
    /// `enabled = false`, persists that, and surfaces the failure so the
    /// operator sees the state.
    pub async fn add_or_update(&self, mut def: ForwardDefinition) -> Result<()> {
        def.normalize();
        def.validate()?;

        let mut defs = self.definitions.lock().await;
        let name = def.name().to_string();
        let prev = defs.get(&name).cloned();
        defs.insert(name.clone(), def.clone());
        self.persist(&defs)?;

        let restart = prev.as_ref().is_some_and(|p| def.requires_restart(p));
        if restart {
            if let Some((_, forwarder)) = self.forwarders.remove(&name) {
                info!(forward = %name, "Routing parameters changed, restarting forwarder");
                forwarder.stop().await;
            }
        }

        if def.enabled() && !self.forwarders.contains_key(&name) {
            if let Err(e) = self.spawn_forwarder(&def).await {
                if e.disables_definition() {
                    if let Some(stored) = defs.get_mut(&name) {
                        stored.set_enabled(false);
                    }
                    self.persist(&defs)?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop (if running) and remove a forward. Returns false when the name
    /// is unknown.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let mut defs = self.definitions.lock().await;
        if defs.remove(name).is_none() {
            return Ok(false);
        }
        if let Some((_, forwarder)) = self.forwarders.remove(name) {
            forwarder.stop().await;
        }
        self.persist(&defs)?;
        info!(forward = %name, "Forward deleted");
        Ok(true)
    }

    /// Enable and start a forward. A no-op when it is already running.
    pub async fn start(&self, name: &str) -> Result<()> {
        let mut defs = self.definitions.lock().await;
        if !defs.contains_key(name) {
            return Err(Error::not_found(format!("forward '{}'", name)));
        }
        if self.forwarders.contains_key(name) {
            return Ok(());
        }

        let def = {
            let stored = defs.get_mut(name).expect("presence checked above");
            stored.set_enabled(true);
            stored.clone()
        };
        self.persist(&defs)?;

        if let Err(e) = self.spawn_forwarder(&def).await {
            if e.disables_definition() {
                if let Some(stored) = defs.get_mut(name) {
                    stored.set_enabled(false);
                }
                self.persist(&defs)?;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop and disable a running forward. Returns false when the name is
    /// unknown or the forward isn't running.
    pub async fn stop(&self, name: &str) -> Result<bool> {
        let mut defs = self.definitions.lock().await;
        if !defs.contains_key(name) {
            return Ok(false);
        }
        let Some((_, forwarder)) = self.forwarders.remove(name) else {
            return Ok(false);
        };
        forwarder.stop().await;
        if let Some(stored) = defs.get_mut(name) {
            stored.set_enabled(false);
        }
        self.persist(&defs)?;
        Ok(true)
    }

    /// Enable every member of a group and attempt to start each one.
    /// Per-member start failures are logged and swallowed; the operation
    /// fails only for an unknown (empty) group. Returns the member count.
    pub async fn enable_group(&self, group: &str) -> Result<usize> {
        let mut defs = self.definitions.lock().await;
        let members = group_members(&defs, group);
        if members.is_empty() {
            return Err(Error::not_found(format!("group '{}'", group)));
        }

        for name in &members {
            if let Some(stored) = defs.get_mut(name) {
                stored.set_enabled(true);
            }
            if self.forwarders.contains_key(name) {
                continue;
            }
            let def = defs.get(name).cloned().expect("member names come from the map");
            if let Err(e) = self.spawn_forwarder(&def).await {
                warn!(forward = %name, error = %e, "Failed to start group member");
                if e.disables_definition() {
                    if let Some(stored) = defs.get_mut(name) {
                        stored.set_enabled(false);
                    }
                }
            }
        }
        self.persist(&defs)?;
        info!(group = %group, members = members.len(), "Group enabled");
        Ok(members.len())
    }

    /// Stop every running member of a group and disable all members.
    /// Unlike an `enabled = false` upsert, group disable actively tears
    /// forwarders down. Returns the member count.
    pub async fn disable_group(&self, group: &str) -> Result<usize> {
        let mut defs = self.definitions.lock().await;
        let members = group_members(&defs, group);
        for name in &members {
            if let Some((_, forwarder)) = self.forwarders.remove(name) {
                forwarder.stop().await;
            }
            if let Some(stored) = defs.get_mut(name) {
                stored.set_enabled(false);
            }
        }
        if !members.is_empty() {
            self.persist(&defs)?;
            info!(group = %group, members = members.len(), "Group disabled");
        }
        Ok(members.len())
    }

    /// Delete every member of a group. Returns how many were deleted; an
    /// empty group deletes zero.
    pub async fn delete_group(&self, group: &str) -> Result<usize> {
        let mut defs = self.definitions.lock().await;
        let members = group_members(&defs, group);
        for name in &members {
            if let Some((_, forwarder)) = self.forwarders.remove(name) {
                forwarder.stop().await;
            }
            defs.remove(name);
        }
        if !members.is_empty() {
            self.persist(&defs)?;
            info!(group = %group, deleted = members.len(), "Group deleted");
        }
        Ok(members.len())
    }

    /// Merge a config document into the registry.
    ///
    /// Every well-formed entry is upserted (forced into `target_group` when
    /// given); malformed entries are logged and skipped. With
    /// `remove_missing`, in-scope definitions absent from the payload are
    /// deleted, where the scope is `target_group` or the whole registry.
    pub async fn apply_config(
        &self,
        config_json: &str,
        target_group: Option<&str>,
        remove_missing: bool,
    ) -> Result<ApplyOutcome> {
        let doc: serde_json::Value = serde_json::from_str(config_json)
            .map_err(|e| Error::config_io(format!("malformed config document: {}", e)))?;
        let Some(entries) = doc.get("forwards").and_then(|v| v.as_object()) else {
            return Err(Error::config_io("config document has no 'forwards' object"));
        };

        let mut defs = self.definitions.lock().await;
        let mut outcome = ApplyOutcome::default();
        let mut seen = BTreeSet::new();

        for (name, value) in entries {
            let mut def: ForwardDefinition = match serde_json::from_value(value.clone()) {
                Ok(def) => def,
                Err(e) => {
                    warn!(forward = %name, error = %e, "Skipping malformed config entry");
                    continue;
                }
            };
            def.set_name(name);
            if let Some(group) = target_group {
                def.set_group(group);
            }
            def.normalize();
            if let Err(e) = def.validate() {
                warn!(forward = %name, error = %e, "Skipping invalid config entry");
                continue;
            }

            let prev = defs.get(name.as_str()).cloned();
            if prev.is_some() {
                outcome.updated += 1;
            } else {
                outcome.added += 1;
            }
            seen.insert(name.clone());
            defs.insert(name.clone(), def.clone());

            let restart = prev.as_ref().is_some_and(|p| def.requires_restart(p));
            if restart {
                if let Some((_, forwarder)) = self.forwarders.remove(name.as_str()) {
                    forwarder.stop().await;
                }
            }
            if def.enabled() && !self.forwarders.contains_key(name.as_str()) {
                if let Err(e) = self.spawn_forwarder(&def).await {
                    warn!(forward = %name, error = %e, "Failed to start applied forward");
                    if e.disables_definition() {
                        if let Some(stored) = defs.get_mut(name.as_str()) {
                            stored.set_enabled(false);
                        }
                    }
                }
            }
        }

        if remove_missing {
            let stale: Vec<String> = defs
                .iter()
                .filter(|(name, def)| {
                    target_group.map_or(true, |g| def.group() == g) && !seen.contains(*name)
                })
                .map(|(name, _)| name.clone())
                .collect();
            for name in stale {
                if let Some((_, forwarder)) = self.forwarders.remove(&name) {
                    forwarder.stop().await;
                }
                defs.remove(&name);
                outcome.removed += 1;
            }
        }

        self.persist(&defs)?;
        info!(
            added = outcome.added,
            updated = outcome.updated,
            removed = outcome.removed,
            "Config applied"
        );
        Ok(outcome)
    }

    /// Serialize the registry in the config-file schema, filtered by
    /// enablement and group.
    pub async fn export_config(
        &self,
        include_disabled: bool,
        group_filter: Option<&str>,
    ) -> Result<String> {
        let defs = self.definitions.lock().await;
        let forwards = defs
            .iter()
            .filter(|(_, def)| {
                (include_disabled || def.enabled())
                    && group_filter.map_or(true, |g| def.group() == g)
            })
            .map(|(name, def)| (name.clone(), def.clone()))
            .collect();
        ConfigFile { forwards }.to_json()
    }

    /// Stop everything, reload definitions from disk, and start the ones
    /// that are enabled.
    pub async fn reload_config(&self) -> Result<()> {
        let mut defs = self.definitions.lock().await;
        self.stop_all().await;

        *defs = match self.load_from_disk() {
            Ok(forwards) => forwards,
            Err(e) => {
                warn!(error = %e, "Failed to reload config, registry is now empty");
                BTreeMap::new()
            }
        };
        info!(forwards = defs.len(), "Configuration reloaded");

        if self.start_enabled(&mut defs).await {
            self.persist(&defs)?;
        }
        Ok(())
    }

    /// Stop every active forwarder without touching the registry.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.forwarders.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, forwarder)) = self.forwarders.remove(&name) {
                forwarder.stop().await;
            }
        }
    }

    /// Derived group view: enablement plus member and active counts.
    pub async fn group_statuses(&self) -> BTreeMap<String, GroupStatus> {
        let defs = self.definitions.lock().await;
        let mut groups: BTreeMap<String, GroupStatus> = BTreeMap::new();
        for def in defs.values() {
            let status = groups.entry(def.group().to_string()).or_default();
            status.forward_count += 1;
            if def.enabled() {
                status.enabled = true;
            }
            if self.forwarders.contains_key(def.name()) {
                status.active_forward_count += 1;
            }
        }
        groups
    }

    /// Watch the config file for out-of-band edits and hot-reload on real
    /// changes. Self-writes are recognized by payload content and skipped.
    /// Returns `None` when persistence is disabled.
    pub fn spawn_config_watcher(self: Arc<Self>) -> Result<Option<JoinHandle<()>>> {
        let Some(path) = self.store.path().map(std::path::Path::to_path_buf) else {
            return Ok(None);
        };
        let Some(parent) = path.parent().map(std::path::Path::to_path_buf) else {
            return Ok(None);
        };
        std::fs::create_dir_all(&parent).map_err(|e| {
            Error::config_io(format!("failed to create {}: {}", parent.display(), e))
        })?;

        let (tx, mut rx) = tokio::sync::mpsc::channel::<notify::Result<notify::Event>>(16);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.blocking_send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::config_io(format!("failed to create config watcher: {}", e)))?;
        // Watch the directory, not the file: editors replace files by
        // rename, which would silently detach a file watch.
        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| Error::config_io(format!("failed to watch {}: {}", parent.display(), e)))?;

        let manager = self;
        Ok(Some(tokio::spawn(async move {
            let _watcher = watcher;
            debug!(path = %path.display(), "Config watcher started");
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            Err(e) => warn!(error = %e, "Config watcher error"),
                            Ok(event) => {
                                let relevant = event.kind.is_modify()
                                    || event.kind.is_create()
                                    || event.kind.is_remove();
                                if !relevant {
                                    continue;
                                }
                                if !event.paths.iter().any(|p| p.file_name() == path.file_name()) {
                                    continue;
                                }
                                // Editors fire bursts; settle, then drain.
                                tokio::time::sleep(Duration::from_millis(200)).await;
                                while rx.try_recv().is_ok() {}
                                if manager.is_self_write() {
                                    continue;
                                }
                                info!("Config file changed on disk, reloading");
                                if let Err(e) = manager.reload_config().await {
                                    warn!(error = %e, "Hot reload failed");
                                }
                            }
                        }
                    }
                }
            }
            debug!("Config watcher stopped");
        })))
    }

    /// Start every enabled definition, disabling the ones that fail.
    /// Returns whether any definition was flipped (and so needs persisting).
    async fn start_enabled(&self, defs: &mut BTreeMap<String, ForwardDefinition>) -> bool {
        let enabled: Vec<String> = defs
            .iter()
            .filter(|(_, def)| def.enabled())
            .map(|(name, _)| name.clone())
            .collect();

        let mut disabled_any = false;
        for name in enabled {
            let def = defs.get(&name).cloned().expect("names come from the map");
            if self.forwarders.contains_key(&name) {
                continue;
            }
            if let Err(e) = self.spawn_forwarder(&def).await {
                warn!(forward = %name, error = %e, "Failed to start forward, disabling");
                if let Some(stored) = defs.get_mut(&name) {
                    stored.set_enabled(false);
                    disabled_any = true;
                }
            }
        }
        disabled_any
    }

    async fn spawn_forwarder(&self, def: &ForwardDefinition) -> Result<()> {
        let forwarder = Arc::new(def.create_forwarder(Arc::clone(&self.cache), &self.shutdown));
        forwarder.start().await?;
        self.forwarders.insert(def.name().to_string(), forwarder);
        Ok(())
    }

    fn load_from_disk(&self) -> Result<BTreeMap<String, ForwardDefinition>> {
        match self.store.read_raw()? {
            Some(data) => {
                let config = ConfigFile::from_json(&data)?;
                *self.last_synced.lock().unwrap() = Some(data);
                Ok(config.forwards)
            }
            None => Ok(BTreeMap::new()),
        }
    }

    fn persist(&self, defs: &BTreeMap<String, ForwardDefinition>) -> Result<()> {
        let config = ConfigFile {
            forwards: defs.clone(),
        };
        let payload = self.store.save(&config)?;
        *self.last_synced.lock().unwrap() = Some(payload);
        Ok(())
    }

    fn is_self_write(&self) -> bool {
        let Ok(Some(current)) = self.store.read_raw() else {
            return false;
        };
        self.last_synced.lock().unwrap().as_deref() == Some(current.as_str())
    }
}

fn group_members(defs: &BTreeMap<String, ForwardDefinition>, group: &str) -> Vec<String> {
    defs.iter()
        .filter(|(_, def)| def.group() == group)
        .map(|(name, _)| name.clone())
        .collect()
}
