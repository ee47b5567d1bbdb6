#![forbid(unsafe_code)]
//! Volume face and the engine context.
//!
//! The [`Engine`] is the explicitly constructed process-wide context:
//! it brings up devices, then the virtual device and its allocators,
//! then the cache, then the block store, and finally the volume
//! registry, tearing them down in reverse. Volumes expose
//! LBA-addressed reads and writes; requests carry an opaque correlation
//! id and complete through an attached callback running on an I/O
//! worker.
//!
//! The LBA-to-block mapping here is an in-memory table; a persistent
//! index tree sits above this crate and consumes the same block store.

use asupersync::Cx;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use strata_alloc::AllocHints;
use strata_cache::{Cache, CacheConfig};
use strata_device::{
    AllocatorKind, DeviceConfig, DeviceManager, VdevConfig, VirtualDev, DATA_START_OFFSET,
};
use strata_error::{Result, StrataError};
use strata_io::{CompletionRouter, EndpointConfig, IoEndpoint, IoEngine, OpenFlags};
use strata_store::{BlockStore, CacheMode, FlushDaemon, FlushDaemonConfig, FreeBlkEntry};
use strata_types::{BlkId, BlockSize, StoreUuid, VdevId, DEFAULT_BLK_SIZE};
use tracing::{debug, info, warn};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| StrataError::ShutdownInProgress)
}

// ── Config ──────────────────────────────────────────────────────────────────

fn default_page_size() -> u32 {
    4096
}

fn default_mem_size() -> usize {
    64 * 1024 * 1024
}

fn default_is_file() -> bool {
    true
}

fn default_nmirrors() -> u32 {
    1
}

/// Cache policy selector in the config surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    PassThru,
    #[default]
    WriteThrough,
    WriteBack,
}

impl From<CachePolicy> for CacheMode {
    fn from(policy: CachePolicy) -> Self {
        match policy {
            CachePolicy::PassThru => Self::PassThru,
            CachePolicy::WriteThrough => Self::WriteThrough,
            CachePolicy::WriteBack => Self::WriteBack,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backing device paths.
    pub devices: Vec<PathBuf>,
    #[serde(default)]
    pub open_flags: OpenFlags,
    /// Minimum virtual page size; power of two, at least 4096.
    #[serde(default = "default_page_size")]
    pub min_virtual_page_size: u32,
    /// Cache memory budget in bytes.
    #[serde(default = "default_mem_size")]
    pub app_mem_size: usize,
    /// Format devices on open.
    #[serde(default)]
    pub disk_init: bool,
    /// Files vs. raw block devices (affects size discovery).
    #[serde(default = "default_is_file")]
    pub is_file: bool,
    /// Persisted system identity.
    pub system_uuid: StoreUuid,
    /// Copies of every block.
    #[serde(default = "default_nmirrors")]
    pub nmirrors: u32,
    /// Bytes per chunk; 0 sizes chunks to the smallest device.
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default)]
    pub cache_policy: CachePolicy,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(StrataError::InvalidDevice("no devices configured".to_owned()));
        }
        if !self.min_virtual_page_size.is_power_of_two() || self.min_virtual_page_size < 4096 {
            return Err(StrataError::UnalignedAccess {
                offset: u64::from(self.min_virtual_page_size),
                align: 4096,
            });
        }
        Ok(())
    }

    fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            devices: self.devices.clone(),
            open_flags: self.open_flags,
            disk_init: self.disk_init,
            is_file: self.is_file,
            system_uuid: self.system_uuid,
        }
    }

    fn blk_size(&self) -> Result<BlockSize> {
        BlockSize::new(self.min_virtual_page_size.max(DEFAULT_BLK_SIZE)).map_err(|_| {
            StrataError::UnalignedAccess {
                offset: u64::from(self.min_virtual_page_size),
                align: 4096,
            }
        })
    }
}

// ── Volume face types ───────────────────────────────────────────────────────

/// Parameters for a new volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolParams {
    pub name: String,
    /// Logical size in bytes.
    pub size: u64,
    /// LBA page size; must equal the engine's block size.
    pub page_size: u32,
    pub uuid: StoreUuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolOp {
    Read,
    Write,
}

/// Delivered to the attached callback when a request finishes.
#[derive(Debug)]
pub struct VolCompletion {
    /// The caller's opaque correlation id, returned unchanged.
    pub request_id: u64,
    pub op: VolOp,
    pub lba: u64,
    pub nlbas: u32,
    /// Bytes transferred, or the failure.
    pub result: Result<usize>,
    /// Read payload; `None` for writes and failed reads.
    pub data: Option<Vec<u8>>,
}

/// Completion callback; runs on an I/O worker thread.
pub type VolCompletionCb = Arc<dyn Fn(VolCompletion) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct LbaSlot {
    bid: BlkId,
    blk_offset: u8,
}

#[derive(Debug, Default)]
struct VolCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

/// Per-volume operation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolMetrics {
    pub reads: u64,
    pub writes: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

// ── Volume ──────────────────────────────────────────────────────────────────

/// One logical volume over the shared block store.
pub struct Volume {
    name: String,
    size: u64,
    page_size: u32,
    uuid: StoreUuid,
    store: Arc<BlockStore>,
    map: Mutex<HashMap<u64, LbaSlot>>,
    comp_cb: RwLock<Option<VolCompletionCb>>,
    counters: VolCounters,
}

impl Volume {
    fn new(params: &VolParams, store: Arc<BlockStore>) -> Self {
        Self {
            name: params.name.clone(),
            size: params.size,
            page_size: params.page_size,
            uuid: params.uuid,
            store,
            map: Mutex::new(HashMap::new()),
            comp_cb: RwLock::new(None),
            counters: VolCounters::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub fn uuid(&self) -> StoreUuid {
        self.uuid
    }

    /// Highest addressable LBA.
    #[must_use]
    pub fn last_lba(&self) -> u64 {
        (self.size / u64::from(self.page_size)).saturating_sub(1)
    }

    #[must_use]
    pub fn metrics(&self) -> VolMetrics {
        VolMetrics {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            read_errors: self.counters.read_errors.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
        }
    }

    /// Attach (or replace) the completion callback.
    pub fn attach_completion_cb(&self, cb: VolCompletionCb) {
        *self.comp_cb.write() = Some(cb);
    }

    fn deliver(&self, completion: VolCompletion) {
        let cb = self.comp_cb.read().clone();
        match cb {
            Some(cb) => cb(completion),
            None => warn!(
                target: "strata::vol",
                event = "completion_dropped",
                volume = %self.name,
                request_id = completion.request_id
            ),
        }
    }

    fn check_range(&self, lba: u64, nlbas: u32) -> Result<()> {
        if nlbas == 0 || u32::from(u8::MAX) < nlbas {
            return Err(StrataError::RunTooLong {
                requested: nlbas,
                max: u32::from(u8::MAX),
            });
        }
        let end = lba
            .checked_add(u64::from(nlbas))
            .ok_or(StrataError::NotFound(format!("lba {lba} overflows")))?;
        if end > self.size / u64::from(self.page_size) {
            return Err(StrataError::NotFound(format!(
                "lba range [{lba}, {end}) beyond volume end"
            )));
        }
        Ok(())
    }

    /// Synchronous write of `nlbas` pages at `lba`.
    ///
    /// Allocates a fresh run, writes it through the block store, remaps
    /// the LBAs, then frees the overwritten blocks; the old mapping is
    /// only released after the covering write completed.
    pub fn write_sync(&self, cx: &Cx, lba: u64, data: &[u8], nlbas: u32) -> Result<usize> {
        cx_checkpoint(cx)?;
        self.check_range(lba, nlbas)?;
        if data.len() as u64 != u64::from(nlbas) * u64::from(self.page_size) {
            return Err(StrataError::UnalignedAccess {
                offset: data.len() as u64,
                align: self.page_size,
            });
        }

        let cached = self.store.alloc_and_write(cx, data, &AllocHints::default())?;
        let bid = cached.key();

        // Remap and collect the displaced blocks.
        let mut displaced: Vec<FreeBlkEntry> = Vec::new();
        {
            let mut map = self.map.lock();
            for i in 0..nlbas {
                let slot = LbaSlot {
                    bid,
                    blk_offset: u8::try_from(i).expect("nlbas bounded by u8"),
                };
                if let Some(old) = map.insert(lba + u64::from(i), slot) {
                    displaced.push(FreeBlkEntry {
                        bid: old.bid,
                        blk_offset: old.blk_offset,
                        nblks: 1,
                    });
                }
            }
        }
        self.free_displaced(cx, displaced)?;

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "strata::vol",
            event = "vol_write",
            volume = %self.name,
            lba,
            nlbas,
            bid = %bid
        );
        Ok(data.len())
    }

    /// Free overwritten block references, tracking the identifier splits
    /// produced by partial frees so later frees and the LBA map stay
    /// keyed to live cache entries.
    fn free_displaced(&self, cx: &Cx, mut pending: Vec<FreeBlkEntry>) -> Result<()> {
        while let Some(entry) = pending.pop() {
            let residuals =
                self.store
                    .free_blk(cx, entry.bid, Some(entry.blk_offset), Some(entry.nblks))?;
            let Some([left, right]) = residuals else {
                continue;
            };
            let freed_end = entry.blk_offset + entry.nblks;
            self.rekey_after_split(entry.bid, entry.blk_offset, freed_end, left, right);
            for other in &mut pending {
                if other.bid != entry.bid {
                    continue;
                }
                if other.blk_offset < entry.blk_offset {
                    if let Some(left) = left {
                        other.bid = left;
                    }
                } else if let Some(right) = right {
                    other.bid = right;
                    other.blk_offset -= freed_end;
                }
            }
        }
        Ok(())
    }

    /// Point surviving LBA slots of `old` at the residual runs created
    /// by a partial free of `[from, to)`.
    fn rekey_after_split(
        &self,
        old: BlkId,
        from: u8,
        to: u8,
        left: Option<BlkId>,
        right: Option<BlkId>,
    ) {
        let mut map = self.map.lock();
        for slot in map.values_mut() {
            if slot.bid != old || (from..to).contains(&slot.blk_offset) {
                continue;
            }
            if slot.blk_offset < from {
                if let Some(left) = left {
                    slot.bid = left;
                }
            } else if let Some(right) = right {
                slot.bid = right;
                slot.blk_offset -= to;
            }
        }
    }

    /// Synchronous read of `nlbas` pages at `lba`; unmapped pages read
    /// as zeros.
    pub fn read_sync(&self, cx: &Cx, lba: u64, nlbas: u32) -> Result<Vec<u8>> {
        cx_checkpoint(cx)?;
        self.check_range(lba, nlbas)?;
        let page = self.page_size as usize;
        let mut out = vec![0_u8; nlbas as usize * page];

        for i in 0..nlbas {
            let slot = { self.map.lock().get(&(lba + u64::from(i))).copied() };
            let Some(slot) = slot else {
                continue;
            };
            let piece_off = u32::from(slot.blk_offset) * self.page_size;
            let buf = self.store.read(cx, slot.bid, piece_off, self.page_size)?;
            let dst = &mut out[i as usize * page..(i as usize + 1) * page];
            if !buf.mem().read().read_into(piece_off, dst) {
                // Holes after a fill pass mean the residual was dropped
                // under the discard policy; the device read above
                // repopulated the range, so this is unreachable in
                // practice.
                warn!(
                    target: "strata::vol",
                    event = "read_hole",
                    volume = %self.name,
                    lba = lba + u64::from(i)
                );
            }
        }

        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// Process-wide storage context.
///
/// Construction order: devices → virtual device and allocators → cache
/// → block store → volumes. `shutdown` tears down in reverse and
/// flushes the device headers.
pub struct Engine {
    devmgr: Arc<DeviceManager>,
    store: Arc<BlockStore>,
    endpoint: Arc<IoEndpoint>,
    flush_daemon: Mutex<Option<FlushDaemon>>,
    volumes: RwLock<HashMap<String, Arc<Volume>>>,
    stopping: AtomicBool,
}

impl Engine {
    /// Open the engine over the configured device paths.
    pub fn open(cx: &Cx, cfg: &Config) -> Result<Arc<Self>> {
        cfg.validate()?;
        let devmgr = Arc::new(DeviceManager::open(cx, &cfg.device_config())?);
        Self::assemble(cx, cfg, devmgr)
    }

    /// Open over caller-supplied engines (tests use in-memory devices).
    pub fn open_with_engines(
        cx: &Cx,
        cfg: &Config,
        engines: Vec<(PathBuf, Arc<dyn IoEngine>)>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let devmgr = Arc::new(DeviceManager::open_with_engines(
            cx,
            engines,
            cfg.system_uuid,
            cfg.disk_init,
        )?);
        Self::assemble(cx, cfg, devmgr)
    }

    fn assemble(cx: &Cx, cfg: &Config, devmgr: Arc<DeviceManager>) -> Result<Arc<Self>> {
        let blk_size = cfg.blk_size()?;
        let chunk_size = if cfg.chunk_size > 0 {
            cfg.chunk_size
        } else {
            // Auto: split the smallest device's data region across the
            // mirror copies it has to host.
            let min_dev = devmgr
                .devices()
                .iter()
                .map(|d| d.size())
                .min()
                .unwrap_or(0)
                .saturating_sub(DATA_START_OFFSET);
            let per_dev = min_dev / u64::from(cfg.nmirrors.max(1));
            per_dev - per_dev % u64::from(blk_size.get())
        };

        let vdev = Arc::new(VirtualDev::open(
            cx,
            &devmgr,
            VdevConfig {
                vdev_id: VdevId(0),
                blk_size,
                nmirrors: cfg.nmirrors,
                chunk_size,
                allocator: AllocatorKind::VarSize,
            },
        )?);
        let cache = Arc::new(Cache::new(&CacheConfig {
            budget_bytes: cfg.app_mem_size,
            shards: 16,
        }));
        let store = Arc::new(BlockStore::new(vdev, cache, cfg.cache_policy.into()));

        let flush_daemon = if cfg.cache_policy == CachePolicy::WriteBack {
            Some(store.start_flush_daemon(FlushDaemonConfig::default())?)
        } else {
            None
        };

        let endpoint = Arc::new(IoEndpoint::start(
            &EndpointConfig::default(),
            Arc::new(CompletionRouter::new()),
        ));

        info!(
            target: "strata::vol",
            event = "engine_open",
            devices = devmgr.ndevices(),
            blk_size = blk_size.get(),
            chunk_size,
            policy = ?cfg.cache_policy
        );
        Ok(Arc::new(Self {
            devmgr,
            store,
            endpoint,
            flush_daemon: Mutex::new(flush_daemon),
            volumes: RwLock::new(HashMap::new()),
            stopping: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    #[must_use]
    pub fn device_manager(&self) -> &Arc<DeviceManager> {
        &self.devmgr
    }

    fn check_running(&self) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(StrataError::ShutdownInProgress);
        }
        Ok(())
    }

    /// Create and register a volume.
    pub fn create_volume(&self, params: &VolParams) -> Result<Arc<Volume>> {
        self.check_running()?;
        if params.size == 0 {
            return Err(StrataError::InvalidDevice("zero-size volume".to_owned()));
        }
        if params.page_size != self.store.blk_size().get() {
            return Err(StrataError::UnalignedAccess {
                offset: u64::from(params.page_size),
                align: self.store.blk_size().get(),
            });
        }

        let mut volumes = self.volumes.write();
        if volumes.contains_key(&params.name) {
            return Err(StrataError::AlreadyExists(params.name.clone()));
        }
        let volume = Arc::new(Volume::new(params, Arc::clone(&self.store)));
        volumes.insert(params.name.clone(), Arc::clone(&volume));
        info!(
            target: "strata::vol",
            event = "volume_created",
            name = %params.name,
            size = params.size
        );
        Ok(volume)
    }

    pub fn volume(&self, name: &str) -> Result<Arc<Volume>> {
        self.volumes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(name.to_owned()))
    }

    /// Submit an asynchronous volume write; the volume's completion
    /// callback receives `request_id` with the outcome on an I/O worker.
    pub fn write(
        &self,
        volume: &Arc<Volume>,
        lba: u64,
        data: Vec<u8>,
        nlbas: u32,
        request_id: u64,
    ) -> Result<()> {
        self.check_running()?;
        let vol = Arc::clone(volume);
        let job = Box::new(move || {
            let cx = Cx::for_testing();
            let result = vol.write_sync(&cx, lba, &data, nlbas);
            if result.is_err() {
                vol.counters.write_errors.fetch_add(1, Ordering::Relaxed);
            }
            let ret = match &result {
                Ok(len) => Ok(*len),
                Err(err) => Err(StrataError::IoFailure {
                    dev: 0,
                    detail: err.to_string(),
                }),
            };
            vol.deliver(VolCompletion {
                request_id,
                op: VolOp::Write,
                lba,
                nlbas,
                result,
                data: None,
            });
            ret
        });
        let cookie = self.endpoint.router().register(Box::new(|_| {}));
        self.endpoint.submit_job(job, cookie)
    }

    /// Submit an asynchronous volume read; completes like `write`, with
    /// the payload attached.
    pub fn read(
        &self,
        volume: &Arc<Volume>,
        lba: u64,
        nlbas: u32,
        request_id: u64,
    ) -> Result<()> {
        self.check_running()?;
        let vol = Arc::clone(volume);
        let job = Box::new(move || {
            let cx = Cx::for_testing();
            match vol.read_sync(&cx, lba, nlbas) {
                Ok(bytes) => {
                    let len = bytes.len();
                    vol.deliver(VolCompletion {
                        request_id,
                        op: VolOp::Read,
                        lba,
                        nlbas,
                        result: Ok(len),
                        data: Some(bytes),
                    });
                    Ok(len)
                }
                Err(err) => {
                    vol.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                    let detail = err.to_string();
                    vol.deliver(VolCompletion {
                        request_id,
                        op: VolOp::Read,
                        lba,
                        nlbas,
                        result: Err(err),
                        data: None,
                    });
                    Err(StrataError::IoFailure { dev: 0, detail })
                }
            }
        });
        let cookie = self.endpoint.router().register(Box::new(|_| {}));
        self.endpoint.submit_job(job, cookie)
    }

    /// Tear everything down in reverse construction order: volumes,
    /// flusher, endpoint, then the device manager (headers flushed).
    pub fn shutdown(&self, cx: &Cx) -> Result<()> {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.volumes.write().clear();
        if let Some(daemon) = self.flush_daemon.lock().take() {
            daemon.shutdown();
        }
        let _ = self.store.flush(cx);
        self.endpoint.shutdown();
        self.devmgr.shutdown(cx)?;
        info!(target: "strata::vol", event = "engine_shutdown");
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("devices", &self.devmgr.ndevices())
            .field("volumes", &self.volumes.read().len())
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use strata_io::MemIoEngine;

    const PAGE: u32 = 8192;
    const UUID: StoreUuid = StoreUuid(0x51A1);

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn mem_config() -> Config {
        Config {
            devices: vec![PathBuf::from("/mem/dev0"), PathBuf::from("/mem/dev1")],
            open_flags: OpenFlags::Buffered,
            min_virtual_page_size: 4096,
            app_mem_size: 32 * 1024 * 1024,
            disk_init: true,
            is_file: true,
            system_uuid: UUID,
            nmirrors: 1,
            chunk_size: 4 << 20,
            cache_policy: CachePolicy::WriteThrough,
        }
    }

    fn mem_engine_pairs(n: usize) -> Vec<(PathBuf, Arc<dyn IoEngine>)> {
        (0..n)
            .map(|i| {
                (
                    PathBuf::from(format!("/mem/dev{i}")),
                    Arc::new(MemIoEngine::new(8 << 20)) as Arc<dyn IoEngine>,
                )
            })
            .collect()
    }

    fn open_engine() -> Arc<Engine> {
        Engine::open_with_engines(&test_cx(), &mem_config(), mem_engine_pairs(2)).unwrap()
    }

    fn params(name: &str) -> VolParams {
        VolParams {
            name: name.to_owned(),
            size: 64 << 20,
            page_size: PAGE,
            uuid: StoreUuid(1),
        }
    }

    #[test]
    fn config_validation() {
        let mut cfg = mem_config();
        cfg.min_virtual_page_size = 6000;
        assert!(cfg.validate().is_err());
        cfg.min_virtual_page_size = 2048;
        assert!(cfg.validate().is_err());
        cfg.min_virtual_page_size = 8192;
        assert!(cfg.validate().is_ok());
        cfg.devices.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn volume_lifecycle() {
        let cx = test_cx();
        let engine = open_engine();

        let vol = engine.create_volume(&params("alpha")).unwrap();
        assert_eq!(vol.last_lba(), (64 << 20) / u64::from(PAGE) - 1);
        assert!(matches!(
            engine.create_volume(&params("alpha")),
            Err(StrataError::AlreadyExists(_))
        ));
        assert!(engine.volume("alpha").is_ok());
        assert!(matches!(
            engine.volume("beta"),
            Err(StrataError::NotFound(_))
        ));

        let mut bad = params("gamma");
        bad.page_size = 4096;
        assert!(matches!(
            engine.create_volume(&bad),
            Err(StrataError::UnalignedAccess { .. })
        ));

        engine.shutdown(&cx).unwrap();
        assert!(matches!(
            engine.create_volume(&params("delta")),
            Err(StrataError::ShutdownInProgress)
        ));
    }

    #[test]
    fn write_read_roundtrip_sync() {
        let cx = test_cx();
        let engine = open_engine();
        let vol = engine.create_volume(&params("vol")).unwrap();

        let data = vec![0xAB_u8; 16 * PAGE as usize];
        vol.write_sync(&cx, 0, &data, 16).unwrap();
        let out = vol.read_sync(&cx, 0, 16).unwrap();
        assert_eq!(out.len(), 131_072);
        assert!(out.iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn unmapped_lbas_read_zero() {
        let cx = test_cx();
        let engine = open_engine();
        let vol = engine.create_volume(&params("vol")).unwrap();

        vol.write_sync(&cx, 4, &vec![0x11_u8; PAGE as usize], 1).unwrap();
        let out = vol.read_sync(&cx, 3, 3).unwrap();
        assert!(out[..PAGE as usize].iter().all(|b| *b == 0));
        assert!(out[PAGE as usize..2 * PAGE as usize]
            .iter()
            .all(|b| *b == 0x11));
        assert!(out[2 * PAGE as usize..].iter().all(|b| *b == 0));
    }

    #[test]
    fn overwrite_releases_old_blocks() {
        let cx = test_cx();
        let engine = open_engine();
        let vol = engine.create_volume(&params("vol")).unwrap();
        let free_before = engine.store().vdev().available_blks();

        let data1 = vec![0x01_u8; 8 * PAGE as usize];
        let data2 = vec![0x02_u8; 8 * PAGE as usize];
        vol.write_sync(&cx, 64, &data1, 8).unwrap();
        vol.write_sync(&cx, 64, &data2, 8).unwrap();

        // The first run was fully displaced and returned to the pool.
        assert_eq!(engine.store().vdev().available_blks(), free_before - 8);

        let out = vol.read_sync(&cx, 64, 8).unwrap();
        assert!(out.iter().all(|b| *b == 0x02));
    }

    #[test]
    fn partial_overwrite_keeps_surviving_lbas_readable() {
        let cx = test_cx();
        let engine = open_engine();
        let vol = engine.create_volume(&params("vol")).unwrap();

        // One 8-page run, then overwrite the middle 2 pages.
        vol.write_sync(&cx, 0, &vec![0xA0_u8; 8 * PAGE as usize], 8)
            .unwrap();
        vol.write_sync(&cx, 3, &vec![0xB0_u8; 2 * PAGE as usize], 2)
            .unwrap();

        let out = vol.read_sync(&cx, 0, 8).unwrap();
        for (i, chunk) in out.chunks(PAGE as usize).enumerate() {
            let expect = if (3..5).contains(&i) { 0xB0 } else { 0xA0 };
            assert!(
                chunk.iter().all(|b| *b == expect),
                "page {i} expected {expect:#x}"
            );
        }
    }

    #[test]
    fn out_of_range_requests_rejected() {
        let cx = test_cx();
        let engine = open_engine();
        let vol = engine.create_volume(&params("vol")).unwrap();
        let pages = (64 << 20) / u64::from(PAGE);

        assert!(vol.write_sync(&cx, pages, &vec![0; PAGE as usize], 1).is_err());
        assert!(vol.read_sync(&cx, pages - 1, 2).is_err());
        assert!(matches!(
            vol.write_sync(&cx, 0, &vec![0; PAGE as usize], 0),
            Err(StrataError::RunTooLong { .. })
        ));
        // Length mismatch.
        assert!(matches!(
            vol.write_sync(&cx, 0, &vec![0; 100], 1),
            Err(StrataError::UnalignedAccess { .. })
        ));
    }

    #[test]
    fn async_write_and_read_complete_through_callback() {
        let cx = test_cx();
        let engine = open_engine();
        let vol = engine.create_volume(&params("vol")).unwrap();

        let (tx, rx) = std::sync::mpsc::channel::<VolCompletion>();
        let tx = Mutex::new(tx);
        vol.attach_completion_cb(Arc::new(move |comp| {
            let _ = tx.lock().send(comp);
        }));

        engine
            .write(&vol, 0, vec![0xCE; 4 * PAGE as usize], 4, 71)
            .unwrap();
        let comp = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("write completion");
        assert_eq!(comp.request_id, 71);
        assert_eq!(comp.op, VolOp::Write);
        assert_eq!(*comp.result.as_ref().unwrap(), 4 * PAGE as usize);

        engine.read(&vol, 0, 4, 72).unwrap();
        let comp = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("read completion");
        assert_eq!(comp.request_id, 72);
        assert_eq!(comp.op, VolOp::Read);
        let data = comp.data.expect("read payload");
        assert!(data.iter().all(|b| *b == 0xCE));

        engine.shutdown(&cx).unwrap();
        assert!(matches!(
            engine.write(&vol, 0, vec![0; PAGE as usize], 1, 73),
            Err(StrataError::ShutdownInProgress)
        ));
    }

    #[test]
    fn shutdown_is_idempotent_and_reopenable() {
        let cx = test_cx();
        let pairs = mem_engine_pairs(2);
        let reuse: Vec<_> = pairs.clone();
        let engine = Engine::open_with_engines(&cx, &mem_config(), pairs).unwrap();
        engine.shutdown(&cx).unwrap();
        engine.shutdown(&cx).unwrap();

        // The devices carry valid headers: a non-formatting reopen works.
        let mut cfg = mem_config();
        cfg.disk_init = false;
        let engine2 = Engine::open_with_engines(&cx, &cfg, reuse).unwrap();
        engine2.shutdown(&cx).unwrap();
    }
}
