//! Account-level stream management.
//!
//! An [`Account`] owns the streams created under it: admission (name
//! uniqueness, subject overlap, account quotas), storage usage accounting
//! fed by the per-store update callbacks, and snapshot restore. Streams
//! hold only a weak reference back.

use crate::advisory::StreamAction;
use crate::broker::Broker;
use crate::config::{self, StorageType, StreamConfig};
use crate::consumer::ConsumerFactory;
use crate::replication::StreamAssignment;
use crate::snapshot::{self, SNAPSHOTS_DIR, STREAMS_DIR};
use crate::store;
use crate::stream::Stream;
use crate::subject;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Account quotas. `-1` means unbounded.
#[derive(Debug, Clone)]
pub struct AccountLimits {
    pub max_memory: i64,
    pub max_storage: i64,
    pub max_streams: i64,
    pub max_consumers: i64,
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            max_memory: -1,
            max_storage: -1,
            max_streams: -1,
            max_consumers: -1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub name: String,
    pub store_dir: PathBuf,
    pub limits: AccountLimits,
    /// Standalone accounts elect every new stream leader immediately.
    pub standalone: bool,
}

impl AccountConfig {
    pub fn new(name: impl Into<String>, store_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            store_dir: store_dir.into(),
            limits: AccountLimits::default(),
            standalone: true,
        }
    }

    pub fn with_limits(mut self, limits: AccountLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Default)]
struct Usage {
    memory: i64,
    storage: i64,
}

/// Per-account stream registry and quota manager.
pub struct Account {
    name: String,
    store_dir: PathBuf,
    limits: AccountLimits,
    standalone: bool,
    broker: Arc<dyn Broker>,
    streams: DashMap<String, Arc<Stream>>,
    templates: DashMap<String, Vec<String>>,
    usage: Mutex<Usage>,
    consumer_factory: RwLock<Option<Arc<dyn ConsumerFactory>>>,
    disabled: AtomicBool,
}

impl Account {
    pub fn new(cfg: AccountConfig, broker: Arc<dyn Broker>) -> Arc<Self> {
        Arc::new(Self {
            name: cfg.name,
            store_dir: cfg.store_dir,
            limits: cfg.limits,
            standalone: cfg.standalone,
            broker,
            streams: DashMap::new(),
            templates: DashMap::new(),
            usage: Mutex::new(Usage::default()),
            consumer_factory: RwLock::new(None),
            disabled: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store_dir(&self) -> &PathBuf {
        &self.store_dir
    }

    /// Registers the factory used to rebuild consumers on restore.
    pub fn set_consumer_factory(&self, factory: Arc<dyn ConsumerFactory>) {
        *self.consumer_factory.write() = Some(factory);
    }

    /// Disables the engine for this account after a fatal storage error.
    pub fn disable(&self) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            warn!(account = %self.name, "messaging engine disabled");
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Creates a stream under this account.
    pub fn add_stream(self: &Arc<Self>, config: StreamConfig) -> Result<Arc<Stream>> {
        self.add_stream_internal(config, None, false)
    }

    /// Creates a stream bound to a cluster assignment.
    pub fn add_stream_with_assignment(
        self: &Arc<Self>,
        config: StreamConfig,
        sa: StreamAssignment,
    ) -> Result<Arc<Stream>> {
        self.add_stream_internal(config, Some(sa), false)
    }

    fn add_stream_internal(
        self: &Arc<Self>,
        config: StreamConfig,
        sa: Option<StreamAssignment>,
        restoring: bool,
    ) -> Result<Arc<Stream>> {
        if self.is_disabled() {
            return Err(Error::Disabled);
        }
        let cfg = config::check_stream_config(&config)?;

        if let Some(existing) = self.streams.get(&cfg.name) {
            let existing = Arc::clone(existing.value());
            // Same config is an idempotent create.
            if existing.config() == cfg {
                if let Some(sa) = sa {
                    existing.set_stream_assignment(sa);
                }
                return Ok(existing);
            }
            return Err(Error::StreamAlreadyExists);
        }

        self.check_limits(&cfg)?;

        if let Some(template) = &cfg.template_owner {
            if !self.template_owns(template, &cfg.name) {
                return Err(Error::Config("stream not owned by template".to_string()));
            }
        }

        if self.subjects_overlap(&cfg.subjects, Some(&cfg.name)) {
            return Err(Error::Config(
                "subjects overlap with an existing stream".to_string(),
            ));
        }

        let stream_dir = self.store_dir.join(STREAMS_DIR).join(&cfg.name);
        let fs_cfg = Stream::auto_tune_block_size(&cfg);
        let stype = cfg.storage;
        let store = store::create_store(&cfg, &stream_dir, fs_cfg)?;

        let sa_responded = sa.as_ref().map(|sa| sa.responded);
        let stream = Stream::new(self, Arc::clone(&self.broker), Arc::clone(&store), cfg.clone());

        let weak_stream = Arc::downgrade(&stream);
        let weak_acc = Arc::downgrade(self);
        store.register_storage_updates(Box::new(move |md, bd, seq, subj| {
            // Single removals keep consumer pending counts honest; every
            // byte delta flows into the account usage.
            if md == -1 && seq > 0 {
                if let Some(s) = weak_stream.upgrade() {
                    s.consumers_dec_pending(seq, subj);
                }
            }
            if bd != 0 {
                if let Some(a) = weak_acc.upgrade() {
                    a.update_usage(stype, bd);
                }
            }
        }));

        // Seed usage with whatever the store recovered.
        let recovered = store.state();
        if recovered.bytes > 0 {
            self.update_usage(stype, recovered.bytes as i64);
        }

        self.streams.insert(cfg.name.clone(), Arc::clone(&stream));
        stream.rebuild_dedupe();

        if let Some(sa) = sa {
            stream.set_stream_assignment(sa);
        }

        // No election in standalone mode; take leadership right away.
        if !stream.is_clustered() && self.standalone {
            if let Err(err) = stream.set_leader(true) {
                let _ = stream.stop(true, false);
                return Err(err);
            }
        }

        if stream.is_leader() {
            let suppress = restoring
                || match sa_responded {
                    Some(responded) => responded,
                    None => !self.standalone,
                };
            if !suppress {
                stream.send_advisory(StreamAction::Create);
            }
        }

        info!(account = %self.name, stream = %cfg.name, "created stream");
        Ok(stream)
    }

    pub fn lookup_stream(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.get(name).map(|s| Arc::clone(s.value()))
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.streams.iter().map(|e| e.key().clone()).collect()
    }

    /// Deletes a stream and its data.
    pub fn delete_stream(&self, name: &str) -> Result<()> {
        let stream = self.lookup_stream(name).ok_or(Error::StreamNotFound)?;
        stream.delete()
    }

    /// Stops every stream, keeping data on disk.
    pub fn shutdown(&self) {
        let streams: Vec<Arc<Stream>> = self
            .streams
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for stream in streams {
            let _ = stream.stop(false, false);
        }
    }

    pub(crate) fn remove_stream_entry(&self, name: &str) {
        self.streams.remove(name);
    }

    pub(crate) fn update_usage(&self, storage: StorageType, delta: i64) {
        let mut usage = self.usage.lock();
        match storage {
            StorageType::Memory => usage.memory += delta,
            StorageType::File => usage.storage += delta,
        }
    }

    /// True once this account is over its byte quota for the given storage
    /// class.
    pub fn limits_exceeded(&self, storage: StorageType) -> bool {
        let usage = self.usage.lock();
        match storage {
            StorageType::Memory => self.limits.max_memory >= 0 && usage.memory > self.limits.max_memory,
            StorageType::File => {
                self.limits.max_storage >= 0 && usage.storage > self.limits.max_storage
            }
        }
    }

    fn check_limits(&self, cfg: &StreamConfig) -> Result<()> {
        if self.limits.max_streams >= 0 && self.streams.len() as i64 >= self.limits.max_streams {
            return Err(Error::TooManyStreams);
        }
        if self.limits.max_consumers >= 0
            && (cfg.max_consumers < 0 || cfg.max_consumers > self.limits.max_consumers)
        {
            return Err(Error::Config(
                "max consumers exceeds account limit".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks a proposed subject set against every other stream in the
    /// account.
    fn subjects_overlap(&self, subjects: &[String], exclude: Option<&str>) -> bool {
        for entry in self.streams.iter() {
            if exclude == Some(entry.key().as_str()) {
                continue;
            }
            let existing = entry.value().config().subjects;
            for have in &existing {
                for want in subjects {
                    if subject::subjects_collide(want, have) {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn template_owns(&self, template: &str, stream: &str) -> bool {
        self.templates
            .get(template)
            .map(|names| names.iter().any(|n| n == stream))
            .unwrap_or(false)
    }

    pub fn add_stream_name_to_template(&self, template: &str, stream: &str) {
        self.templates
            .entry(template.to_string())
            .or_default()
            .push(stream.to_string());
    }

    /// Restores a stream from a snapshot archive.
    ///
    /// The archive is unpacked into a staging directory, validated against
    /// the requested name, renamed into place, and recreated; archived
    /// consumers are rebuilt through the registered [`ConsumerFactory`].
    pub fn restore_stream(
        self: &Arc<Self>,
        stream_name: &str,
        reader: impl Read,
    ) -> Result<Arc<Stream>> {
        if !subject::is_valid_name(stream_name) {
            return Err(Error::Config(
                "stream name is required and can not contain '.', '*', '>'".to_string(),
            ));
        }

        let staging_root = self.store_dir.join(SNAPSHOTS_DIR);
        std::fs::create_dir_all(&staging_root)?;
        let staging = tempfile::Builder::new()
            .prefix("snap-")
            .tempdir_in(&staging_root)?;
        snapshot::unpack_archive(reader, staging.path())?;

        let meta = snapshot::read_stream_meta(staging.path())?;
        if meta.config.name != stream_name {
            return Err(Error::Restore(format!(
                "stream name {stream_name:?} does not match snapshot stream {:?}",
                meta.config.name
            )));
        }
        if self.streams.contains_key(stream_name) {
            return Err(Error::StreamAlreadyExists);
        }

        let ndir = self.store_dir.join(STREAMS_DIR).join(stream_name);
        if ndir.exists() {
            // Leftovers from a deleted stream of the same name.
            std::fs::remove_dir_all(&ndir)?;
        }
        if let Some(parent) = ndir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staged = staging.into_path();
        std::fs::rename(&staged, &ndir)?;

        if let Some(template) = meta.config.template_owner.clone() {
            self.add_stream_name_to_template(&template, stream_name);
        }

        let stream = self.add_stream_internal(meta.config.clone(), None, true)?;
        stream.set_created(meta.created);

        let consumers = match snapshot::read_consumer_snapshots(&ndir) {
            Ok(consumers) => consumers,
            Err(err) => {
                let _ = stream.stop(true, false);
                return Err(err);
            }
        };
        if !consumers.is_empty() {
            let factory = self.consumer_factory.read().clone();
            let Some(factory) = factory else {
                let _ = stream.stop(true, false);
                return Err(Error::Restore(
                    "snapshot has consumers but no consumer factory is registered".to_string(),
                ));
            };
            for snap in consumers {
                let name = snap.name.clone();
                let handle = match factory.restore(&stream, snap) {
                    Ok(handle) => handle,
                    Err(err) => {
                        let _ = stream.stop(true, false);
                        return Err(Error::Restore(format!(
                            "error restoring consumer {name:?}: {err}"
                        )));
                    }
                };
                if let Err(err) = stream.add_consumer(handle) {
                    let _ = stream.stop(true, false);
                    return Err(Error::Restore(format!(
                        "error restoring consumer {name:?}: {err}"
                    )));
                }
            }
        }

        info!(account = %self.name, stream = %stream_name, "restored stream from snapshot");
        Ok(stream)
    }
}
