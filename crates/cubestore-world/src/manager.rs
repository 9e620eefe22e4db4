//! Chunk generation scheduler.
//!
//! [`ChunkManager`] is the single entry point for "the chunk at `pos`,
//! generated to at least `barrier`". Generation runs on a bounded pool of
//! blocking threads owned by the manager's runtime. At most one generation
//! per coordinate is in flight: the first requester inserts a completion
//! channel into the in-flight map, later requesters subscribe to it.
//!
//! The manager also drains the explicit load and unload queues once per
//! [`ChunkManager::tick`] and decays chunk residency.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::barrier::GenerationBarrier;
use crate::chunk::{ServerChunk, SharedChunk};
use crate::config::StorageConfig;
use crate::coords::{
    block_in_chunk, block_to_chunk, ChunkVec, SEA_LEVEL, WORLD_CEILING, WORLD_FLOOR,
};
use crate::error::{Result, StorageError};
use crate::generator::{ChunkGenerator, GenerationContext, LightingSystem};
use crate::heightmap::HeightmapType;
use crate::region_map::RegionMap;
use crate::storage::WorldStorage;
use crate::ticket::ChunkLoadTicket;

/// Called with the coordinates and error of every failed generation.
pub type ChunkErrorHook = Arc<dyn Fn(ChunkVec, &StorageError) + Send + Sync>;

/// Barrier used by surface probes: the lowest one that places blocks.
const PROBE_BARRIER: GenerationBarrier = GenerationBarrier::Terrain;

// ─── In-flight bookkeeping ──────────────────────────────────────────────

#[derive(Clone)]
enum Settled {
    Ready(SharedChunk),
    Failed(String),
    Cancelled,
}

struct InFlight {
    id: u64,
    done: watch::Receiver<Option<Settled>>,
    /// Set once the worker task is spawned; taken on shutdown.
    abort: Mutex<Option<AbortHandle>>,
}

/// Removes its in-flight entry when the worker finishes or is dropped
/// before running.
struct InFlightGuard {
    shared: Arc<Shared>,
    pos: ChunkVec,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared
            .in_flight
            .remove_if(&self.pos, |_, entry| entry.id == self.id);
    }
}

enum Dispatch {
    Ready(SharedChunk),
    Wait(watch::Receiver<Option<Settled>>),
}

/// State shared with worker tasks.
struct Shared {
    regions: RegionMap,
    generator: Arc<dyn ChunkGenerator>,
    lighting: Arc<dyn LightingSystem>,
    config: StorageConfig,
    in_flight: DashMap<ChunkVec, InFlight>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    error_hook: RwLock<Option<ChunkErrorHook>>,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Resolve a request without blocking: either the chunk is already good
    /// enough, or the receiver of the (possibly new) in-flight generation.
    fn dispatch(
        self: &Arc<Self>,
        handle: &Handle,
        pos: ChunkVec,
        barrier: GenerationBarrier,
    ) -> Result<Dispatch> {
        if self.is_shutting_down() {
            return Err(StorageError::ShutDown);
        }
        if let Some(chunk) = self.regions.get_loaded_chunk(pos) {
            let ready = {
                let guard = chunk.read();
                !guard.is_generating() && guard.barrier() >= barrier
            };
            if ready {
                return Ok(Dispatch::Ready(chunk));
            }
        }

        let (id, tx, rx) = match self.in_flight.entry(pos) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight generation of {pos}");
                return Ok(Dispatch::Wait(entry.get().done.clone()));
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                entry.insert(InFlight {
                    id,
                    done: rx.clone(),
                    abort: Mutex::new(None),
                });
                (id, tx, rx)
            }
        };

        let worker = Arc::clone(self);
        let guard = InFlightGuard {
            shared: Arc::clone(self),
            pos,
            id,
        };
        let task = handle.spawn_blocking(move || {
            let tx = tx;
            let guard = guard;
            let settled = worker.run_generation(pos, barrier);
            drop(guard);
            tx.send_replace(Some(settled));
        });
        if let Some(entry) = self.in_flight.get(&pos) {
            if entry.id == id {
                *entry.abort.lock() = Some(task.abort_handle());
            }
        }
        Ok(Dispatch::Wait(rx))
    }

    fn run_generation(&self, pos: ChunkVec, barrier: GenerationBarrier) -> Settled {
        match self.generate_sync(pos, barrier) {
            Ok(chunk) => Settled::Ready(chunk),
            Err(StorageError::ShutDown) => Settled::Cancelled,
            Err(e) => {
                error!("Failed to generate chunk {pos} to {barrier}: {e}");
                self.report(pos, &e);
                match e {
                    StorageError::Generation { message, .. } => Settled::Failed(message),
                    other => Settled::Failed(other.to_string()),
                }
            }
        }
    }

    /// Worker body. Runs with exclusive generation rights on `pos`.
    fn generate_sync(&self, pos: ChunkVec, barrier: GenerationBarrier) -> Result<SharedChunk> {
        let chunk = match self.regions.get_chunk(pos)? {
            Some(chunk) => chunk,
            None => {
                let chunk = ServerChunk::builder(pos, self.config.unload_ticks).into_shared();
                self.regions.set_chunk(pos, chunk.clone())?;
                chunk
            }
        };

        let mut builder = {
            let mut guard = chunk.write();
            if guard.barrier() >= barrier {
                drop(guard);
                return Ok(chunk);
            }
            guard.begin_generation().ok_or_else(|| StorageError::Generation {
                pos,
                message: "chunk is already being generated".into(),
            })?
        };

        let ctx = GenerationContext::new(&self.regions, self.lighting.as_ref());
        if let Err(e) = self.generator.generate(&ctx, &mut builder, barrier) {
            chunk.write().finish_generation(builder, false);
            return Err(StorageError::Generation {
                pos,
                message: e.to_string(),
            });
        }
        builder.advance_to(barrier);

        if self.is_shutting_down() {
            debug!("Discarding generated chunk {pos}: shutting down");
            return Err(StorageError::ShutDown);
        }

        if builder.barrier().is_terminal() {
            if let Err(e) = self.regions.record_surface(pos, &builder.data) {
                warn!("Failed to record surface of chunk {pos}: {e}");
            }
        }
        {
            let mut guard = chunk.write();
            guard.finish_generation(builder, self.config.persist_generated);
            guard
                .residency_mut()
                .consume(ChunkLoadTicket::Timed(self.config.unload_ticks));
        }
        debug!("Generated chunk {pos} to {barrier}");
        Ok(chunk)
    }

    fn report(&self, pos: ChunkVec, e: &StorageError) {
        let hook = self.error_hook.read().clone();
        if let Some(hook) = hook {
            hook(pos, e);
        }
    }
}

// ─── Futures ────────────────────────────────────────────────────────────

/// Pending chunk request. Await it from async code or [`join`](Self::join)
/// it from a blocking thread.
pub struct ChunkFuture {
    handle: Handle,
    inner: Pin<Box<dyn Future<Output = Result<SharedChunk>> + Send>>,
}

impl ChunkFuture {
    /// Block the current thread until the chunk is ready.
    ///
    /// Must not be called from inside an async task.
    pub fn join(self) -> Result<SharedChunk> {
        self.handle.block_on(self.inner)
    }
}

impl Future for ChunkFuture {
    type Output = Result<SharedChunk>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

// ─── Manager ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnloadCheck {
    Absent,
    Blocked,
    /// Leased again since it was deferred.
    Renewed,
    Ready,
}

pub struct ChunkManager {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    load_queue: Mutex<VecDeque<ChunkVec>>,
    unload_queue: Mutex<VecDeque<ChunkVec>>,
    /// Unloads held back by an indefinite ticket or a running generation.
    deferred: Mutex<Vec<ChunkVec>>,
    loading_chunk: Arc<AtomicBool>,
}

impl ChunkManager {
    /// Create a manager over the world at `storage` and start its worker
    /// runtime.
    pub fn new(
        storage: WorldStorage,
        generator: Arc<dyn ChunkGenerator>,
        lighting: Arc<dyn LightingSystem>,
        config: StorageConfig,
    ) -> Result<Self> {
        let threads = config.generation_threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("chunk-gen")
            .build()?;
        let handle = runtime.handle().clone();

        info!(
            "Chunk manager started for {} ({threads} generation threads)",
            storage.root().display()
        );
        let shared = Arc::new(Shared {
            regions: RegionMap::new(storage, config.unload_ticks),
            generator,
            lighting,
            config,
            in_flight: DashMap::new(),
            next_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            error_hook: RwLock::new(None),
        });

        Ok(Self {
            shared,
            runtime: Mutex::new(Some(runtime)),
            handle,
            load_queue: Mutex::new(VecDeque::new()),
            unload_queue: Mutex::new(VecDeque::new()),
            deferred: Mutex::new(Vec::new()),
            loading_chunk: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn set_error_hook(&self, hook: ChunkErrorHook) {
        *self.shared.error_hook.write() = Some(hook);
    }

    pub fn regions(&self) -> &RegionMap {
        &self.shared.regions
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Whether a generation for `pos` is in flight.
    pub fn is_generating(&self, pos: ChunkVec) -> bool {
        self.shared.in_flight.contains_key(&pos)
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.len()
    }

    pub fn is_loading(&self) -> bool {
        self.loading_chunk.load(Ordering::Acquire)
    }

    // ─── Chunk access ───────────────────────────────────────────────────

    /// Blocking request. Stalls the calling thread until generation
    /// completes, so keep it off the tick thread.
    pub fn get_chunk(&self, pos: ChunkVec, barrier: GenerationBarrier) -> Result<SharedChunk> {
        if self.is_shutting_down() {
            return Err(StorageError::ShutDown);
        }
        self.get_chunk_async(pos, barrier).join()
    }

    /// Request `pos` at `barrier` or above. Generation, if needed, starts
    /// before this returns.
    pub fn get_chunk_async(&self, pos: ChunkVec, barrier: GenerationBarrier) -> ChunkFuture {
        let first = self.shared.dispatch(&self.handle, pos, barrier);
        let shared = Arc::clone(&self.shared);
        let handle = self.handle.clone();
        let inner = async move {
            let mut next = first;
            loop {
                let mut done = match next? {
                    Dispatch::Ready(chunk) => return Ok(chunk),
                    Dispatch::Wait(done) => done,
                };
                let settled = match done.wait_for(Option::is_some).await {
                    Ok(value) => value.clone(),
                    Err(_) => None,
                };
                match settled {
                    Some(Settled::Ready(chunk)) => {
                        let reached = chunk.read().barrier();
                        if reached >= barrier {
                            return Ok(chunk);
                        }
                    }
                    Some(Settled::Failed(message)) => {
                        return Err(StorageError::Generation { pos, message })
                    }
                    Some(Settled::Cancelled) | None => {
                        return Err(if shared.is_shutting_down() {
                            StorageError::ShutDown
                        } else {
                            StorageError::Cancelled(pos)
                        })
                    }
                }
                // Joined a generation aiming lower than this request.
                next = shared.dispatch(&handle, pos, barrier);
            }
        };
        ChunkFuture {
            handle: self.handle.clone(),
            inner: Box::pin(inner),
        }
    }

    /// Request a fully generated chunk.
    pub fn load_chunk_async(&self, pos: ChunkVec) -> ChunkFuture {
        self.get_chunk_async(pos, GenerationBarrier::All)
    }

    /// Resident chunk only.
    pub fn get_loaded_chunk(&self, pos: ChunkVec) -> Option<SharedChunk> {
        self.shared.regions.get_loaded_chunk(pos)
    }

    /// Resident or stored chunk. Never generates.
    pub fn get_chunk_or_load(&self, pos: ChunkVec) -> Result<Option<SharedChunk>> {
        self.shared.regions.get_chunk(pos)
    }

    // ─── Queues ─────────────────────────────────────────────────────────

    pub fn queue_load(&self, pos: ChunkVec) {
        let mut queue = self.load_queue.lock();
        if !queue.contains(&pos) {
            queue.push_back(pos);
        }
    }

    pub fn queue_unload(&self, pos: ChunkVec) {
        let mut queue = self.unload_queue.lock();
        if !queue.contains(&pos) {
            queue.push_back(pos);
        }
    }

    /// One scheduler step: process unloads, start at most one queued load,
    /// then decay residency and defer expired chunks for unload.
    pub fn tick(&self) {
        if self.is_shutting_down() {
            return;
        }

        let explicit: Vec<ChunkVec> = self.unload_queue.lock().drain(..).collect();
        let previously_deferred = std::mem::take(&mut *self.deferred.lock());
        let mut deferred = Vec::new();
        for pos in explicit {
            match self.check_unload(pos, false) {
                UnloadCheck::Ready => self.unload_now(pos),
                UnloadCheck::Blocked if !deferred.contains(&pos) => deferred.push(pos),
                UnloadCheck::Blocked | UnloadCheck::Renewed | UnloadCheck::Absent => {}
            }
        }
        for pos in previously_deferred {
            if deferred.contains(&pos) {
                continue;
            }
            match self.check_unload(pos, true) {
                UnloadCheck::Ready => self.unload_now(pos),
                UnloadCheck::Blocked => deferred.push(pos),
                UnloadCheck::Renewed | UnloadCheck::Absent => {}
            }
        }
        self.deferred.lock().extend(deferred);

        if !self.loading_chunk.swap(true, Ordering::AcqRel) {
            let next = self.load_queue.lock().pop_front();
            match next {
                Some(pos) => {
                    let request = self.load_chunk_async(pos);
                    let loading = Arc::clone(&self.loading_chunk);
                    self.handle.spawn(async move {
                        if let Err(e) = request.await {
                            warn!("Queued load of chunk {pos} failed: {e}");
                        }
                        loading.store(false, Ordering::Release);
                    });
                }
                None => self.loading_chunk.store(false, Ordering::Release),
            }
        }

        // Expired chunks are re-checked next tick so a lease granted in
        // between keeps them resident.
        let expired = self.shared.regions.tick();
        if !expired.is_empty() {
            let mut deferred = self.deferred.lock();
            for pos in expired {
                if !deferred.contains(&pos) {
                    deferred.push(pos);
                }
            }
        }
    }

    fn check_unload(&self, pos: ChunkVec, require_expiry: bool) -> UnloadCheck {
        if self.shared.in_flight.contains_key(&pos) {
            return UnloadCheck::Blocked;
        }
        let Some(chunk) = self.shared.regions.get_loaded_chunk(pos) else {
            return UnloadCheck::Absent;
        };
        let guard = chunk.read();
        let residency = guard.residency();
        if residency.is_pinned() {
            if !require_expiry {
                warn!("Unload of chunk {pos} deferred: it holds an indefinite ticket");
            }
            return UnloadCheck::Blocked;
        }
        if require_expiry && !residency.is_expired() {
            return UnloadCheck::Renewed;
        }
        UnloadCheck::Ready
    }

    fn unload_now(&self, pos: ChunkVec) {
        if let Err(e) = self.shared.regions.unload_chunk(pos) {
            error!("Failed to unload chunk {pos}: {e}");
        }
    }

    /// Apply residency leases. Resident chunks take the ticket, the rest are
    /// queued for load.
    pub fn refresh(&self, leases: impl IntoIterator<Item = (ChunkVec, ChunkLoadTicket)>) {
        for (pos, ticket) in leases {
            match self.shared.regions.get_loaded_chunk(pos) {
                Some(chunk) => {
                    let complete = {
                        let mut guard = chunk.write();
                        guard.residency_mut().consume(ticket);
                        guard.is_finalized()
                    };
                    if !complete {
                        self.queue_load(pos);
                    }
                }
                None => self.queue_load(pos),
            }
        }
    }

    /// Save every resident chunk that needs it plus heightmaps. Returns the
    /// number of chunks written.
    pub fn save(&self) -> Result<usize> {
        let written = self.shared.regions.save()?;
        info!("Saved {written} chunks");
        Ok(written)
    }

    // ─── Heights ────────────────────────────────────────────────────────

    pub fn height(&self, x: i32, z: i32, kind: HeightmapType) -> Option<i32> {
        self.shared.regions.height(x, z, kind)
    }

    /// Chunk holding the highest block of column `(x, z)`, found by probing
    /// at the terrain barrier. `None` if the column is empty down to the
    /// world floor. Blocks the calling thread.
    pub fn lowest_chunk_at(&self, x: i32, z: i32) -> Result<Option<ChunkVec>> {
        Ok(self.probe_surface(x, z)?.map(|(pos, _)| pos))
    }

    /// Surface height of column `(x, z)`, probing and recording it if the
    /// heightmap does not know it yet. Blocks the calling thread.
    pub fn read_height(&self, x: i32, z: i32) -> Result<Option<i32>> {
        if let Some(height) = self.height(x, z, HeightmapType::WorldSurface) {
            return Ok(Some(height));
        }
        let Some((_, height)) = self.probe_surface(x, z)? else {
            return Ok(None);
        };
        self.shared
            .regions
            .raise_height(x, z, HeightmapType::WorldSurface, height)?;
        Ok(Some(height))
    }

    fn probe_surface(&self, x: i32, z: i32) -> Result<Option<(ChunkVec, i32)>> {
        let (lx, lz) = (block_in_chunk(x), block_in_chunk(z));
        let top_in = |pos: ChunkVec| -> Result<Option<usize>> {
            let chunk = self.get_chunk(pos, PROBE_BARRIER)?;
            let top = chunk.read().data().highest_block(lx, lz);
            Ok(top)
        };

        let start = self
            .shared
            .generator
            .surface_hint(x, z)
            .map(|hint| hint.ceil() as i32)
            .unwrap_or(SEA_LEVEL)
            .max(SEA_LEVEL);
        let floor = block_to_chunk(WORLD_FLOOR);
        let ceiling = block_to_chunk(WORLD_CEILING - 1);

        let mut pos = ChunkVec::containing_block(x, start, z);
        let mut top = loop {
            if let Some(top) = top_in(pos)? {
                break top;
            }
            if pos.y <= floor {
                debug!("Column ({x}, {z}) is empty down to the world floor");
                return Ok(None);
            }
            pos = pos.below();
        };

        while pos.y < ceiling {
            let above = pos.above();
            match top_in(above)? {
                Some(higher) => {
                    pos = above;
                    top = higher;
                }
                None => break,
            }
        }
        Ok(Some((pos, pos.min_block_y() + top as i32)))
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    /// Cancel pending work, wait for running generations up to the grace
    /// period, then save and close every region.
    ///
    /// Blocks; call it from a blocking context.
    pub fn close(&self) -> Result<()> {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down chunk manager");
        self.load_queue.lock().clear();
        self.unload_queue.lock().clear();
        self.deferred.lock().clear();

        let pending: Vec<AbortHandle> = self
            .shared
            .in_flight
            .iter()
            .filter_map(|entry| entry.abort.lock().take())
            .collect();
        self.shared.in_flight.clear();
        for task in pending {
            task.abort();
        }

        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_timeout(self.shared.config.shutdown_grace());
        }
        self.shared.in_flight.clear();

        let result = self.shared.regions.close();
        info!("Chunk manager closed");
        result
    }
}

impl Drop for ChunkManager {
    fn drop(&mut self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("Chunk manager dropped without close; saving what is resident");
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
        if let Err(e) = self.shared.regions.close() {
            error!("Failed to close regions: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::BuilderChunk;
    use crate::flat_generator::{FlatGenerator, GRASS};
    use crate::generator::{GeneratorError, NoLighting};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// Flat terrain that counts calls and can be slowed down or made to fail.
    struct TestGenerator {
        inner: FlatGenerator,
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
        hint: Option<f64>,
    }

    impl TestGenerator {
        fn new(surface: i32) -> Self {
            Self {
                inner: FlatGenerator::new(surface),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
                hint: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ChunkGenerator for TestGenerator {
        fn generate(
            &self,
            ctx: &GenerationContext<'_>,
            chunk: &mut BuilderChunk,
            barrier: GenerationBarrier,
        ) -> std::result::Result<(), GeneratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err("terrain exploded".into());
            }
            self.inner.generate(ctx, chunk, barrier)
        }

        fn surface_hint(&self, _x: i32, _z: i32) -> Option<f64> {
            self.hint
        }
    }

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("cubestore_test_{}", rand::random::<u64>()))
    }

    fn manager_with(root: &PathBuf, generator: Arc<TestGenerator>, config: StorageConfig) -> ChunkManager {
        ChunkManager::new(
            WorldStorage::new(root),
            generator,
            Arc::new(NoLighting),
            config,
        )
        .unwrap()
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn concurrent_requests_generate_once() {
        let root = temp_root();
        let mut generator = TestGenerator::new(64);
        generator.delay = Duration::from_millis(100);
        let generator = Arc::new(generator);
        let manager = manager_with(&root, generator.clone(), StorageConfig::default());

        let pos = ChunkVec::new(3, 2, 5);
        let results: Vec<SharedChunk> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| s.spawn(|| manager.get_chunk(pos, GenerationBarrier::All)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect()
        });

        assert_eq!(generator.calls(), 1);
        for chunk in &results {
            assert_eq!(chunk.read().barrier(), GenerationBarrier::All);
        }
        assert!(Arc::ptr_eq(&results[0], &results[1]));
        assert_eq!(manager.in_flight_count(), 0);
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn many_futures_share_one_generation() {
        let root = temp_root();
        let mut generator = TestGenerator::new(64);
        generator.delay = Duration::from_millis(50);
        let generator = Arc::new(generator);
        let manager = manager_with(&root, generator.clone(), StorageConfig::default());

        let pos = ChunkVec::new(-1, 0, 7);
        let futures: Vec<ChunkFuture> = (0..8)
            .map(|_| manager.get_chunk_async(pos, GenerationBarrier::Terrain))
            .collect();
        assert!(manager.is_generating(pos));
        for future in futures {
            let chunk = future.join().unwrap();
            assert!(chunk.read().barrier() >= GenerationBarrier::Terrain);
        }
        assert_eq!(generator.calls(), 1);
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn barriers_only_move_forward() {
        let root = temp_root();
        let generator = Arc::new(TestGenerator::new(64));
        let manager = manager_with(&root, generator.clone(), StorageConfig::default());
        let pos = ChunkVec::new(0, 2, 0);

        let chunk = manager.get_chunk(pos, GenerationBarrier::Terrain).unwrap();
        assert_eq!(chunk.read().barrier(), GenerationBarrier::Terrain);
        assert_eq!(chunk.read().get_block(0, 0, 0), GRASS);
        assert_eq!(generator.calls(), 1);

        let again = manager.get_chunk(pos, GenerationBarrier::Skeleton).unwrap();
        assert_eq!(again.read().barrier(), GenerationBarrier::Terrain);
        assert_eq!(generator.calls(), 1);

        let full = manager.get_chunk(pos, GenerationBarrier::All).unwrap();
        assert!(full.read().is_finalized());
        assert_eq!(full.read().get_block(0, 0, 0), GRASS);
        assert_eq!(generator.calls(), 2);

        manager.get_chunk(pos, GenerationBarrier::All).unwrap();
        assert_eq!(generator.calls(), 2);
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn lower_target_joiner_is_upgraded() {
        let root = temp_root();
        let mut generator = TestGenerator::new(64);
        generator.delay = Duration::from_millis(50);
        let generator = Arc::new(generator);
        let manager = manager_with(&root, generator.clone(), StorageConfig::default());
        let pos = ChunkVec::new(9, 1, 9);

        let low = manager.get_chunk_async(pos, GenerationBarrier::Skeleton);
        let high = manager.get_chunk_async(pos, GenerationBarrier::All);
        assert_eq!(high.join().unwrap().read().barrier(), GenerationBarrier::All);
        assert!(low.join().unwrap().read().barrier() >= GenerationBarrier::Skeleton);
        assert_eq!(generator.calls(), 2);
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn indefinite_ticket_defers_unload() {
        let root = temp_root();
        let generator = Arc::new(TestGenerator::new(64));
        let manager = manager_with(&root, generator, StorageConfig::default());
        let pos = ChunkVec::new(1, 2, 1);

        let chunk = manager.get_chunk(pos, GenerationBarrier::All).unwrap();
        chunk
            .write()
            .residency_mut()
            .consume(ChunkLoadTicket::Indefinite);
        manager.queue_unload(pos);
        for _ in 0..3 {
            manager.tick();
            assert!(manager.get_loaded_chunk(pos).is_some());
        }

        chunk
            .write()
            .residency_mut()
            .replace(ChunkLoadTicket::Timed(2));
        manager.tick();
        manager.tick();
        assert!(manager.get_loaded_chunk(pos).is_some());
        manager.tick();
        assert!(manager.get_loaded_chunk(pos).is_none());

        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn revoked_ticket_unloads_on_next_tick() {
        let root = temp_root();
        let generator = Arc::new(TestGenerator::new(64));
        let manager = manager_with(&root, generator, StorageConfig::default());
        let pos = ChunkVec::new(1, 2, 2);

        let chunk = manager.get_chunk(pos, GenerationBarrier::All).unwrap();
        chunk
            .write()
            .residency_mut()
            .consume(ChunkLoadTicket::Indefinite);
        manager.queue_unload(pos);
        manager.tick();
        assert!(manager.get_loaded_chunk(pos).is_some());

        chunk.write().residency_mut().revoke();
        manager.tick();
        assert!(manager.get_loaded_chunk(pos).is_none());
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn renewed_lease_cancels_pending_expiry() {
        let root = temp_root();
        let generator = Arc::new(TestGenerator::new(64));
        let manager = manager_with(&root, generator, StorageConfig::default());
        let pos = ChunkVec::new(1, 2, 3);

        let chunk = manager.get_chunk(pos, GenerationBarrier::All).unwrap();
        chunk
            .write()
            .residency_mut()
            .replace(ChunkLoadTicket::Timed(1));
        manager.tick();
        assert!(chunk.read().residency().is_expired());
        assert!(manager.get_loaded_chunk(pos).is_some());

        manager.refresh([(pos, ChunkLoadTicket::Timed(500))]);
        manager.tick();
        assert!(manager.get_loaded_chunk(pos).is_some());
        assert_eq!(chunk.read().residency().remaining(), 499);

        chunk.write().residency_mut().revoke();
        manager.tick();
        manager.tick();
        assert!(manager.get_loaded_chunk(pos).is_none());
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn unload_persists_generated_chunks() {
        let root = temp_root();
        let generator = Arc::new(TestGenerator::new(64));
        let manager = manager_with(&root, generator.clone(), StorageConfig::default());
        let pos = ChunkVec::new(4, 2, 4);

        manager.get_chunk(pos, GenerationBarrier::All).unwrap();
        manager.queue_unload(pos);
        manager.tick();
        assert!(manager.get_loaded_chunk(pos).is_none());

        let reloaded = manager.get_chunk_or_load(pos).unwrap().unwrap();
        assert!(reloaded.read().is_finalized());
        assert!(!reloaded.read().is_modified());
        assert_eq!(reloaded.read().get_block(5, 0, 5), GRASS);
        manager.get_chunk(pos, GenerationBarrier::All).unwrap();
        assert_eq!(generator.calls(), 1);
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn unmodified_chunks_are_not_written_when_not_persisting() {
        let root = temp_root();
        let generator = Arc::new(TestGenerator::new(64));
        let config = StorageConfig {
            persist_generated: false,
            ..StorageConfig::default()
        };
        let manager = manager_with(&root, generator, config);
        let pos = ChunkVec::new(4, 2, 5);
        let neighbour = ChunkVec::new(4, 2, 6);

        manager.get_chunk(pos, GenerationBarrier::All).unwrap();
        let kept = manager.get_chunk(neighbour, GenerationBarrier::All).unwrap();
        kept.write().set_block(0, 0, 0, 9);
        manager.queue_unload(pos);
        manager.queue_unload(neighbour);
        manager.tick();

        assert!(manager.get_chunk_or_load(pos).unwrap().is_none());
        let reloaded = manager.get_chunk_or_load(neighbour).unwrap().unwrap();
        assert_eq!(reloaded.read().get_block(0, 0, 0), 9);
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn queued_loads_run_one_per_tick() {
        let root = temp_root();
        let mut generator = TestGenerator::new(64);
        generator.delay = Duration::from_millis(30);
        let generator = Arc::new(generator);
        let manager = manager_with(&root, generator.clone(), StorageConfig::default());
        let a = ChunkVec::new(0, 0, 0);
        let b = ChunkVec::new(0, 0, 1);

        manager.queue_load(a);
        manager.queue_load(b);
        manager.queue_load(a);
        manager.tick();
        assert!(manager.is_loading());
        assert!(wait_until(|| !manager.is_loading()));
        assert!(manager.get_loaded_chunk(a).unwrap().read().is_finalized());
        assert!(manager.get_loaded_chunk(b).is_none());

        manager.tick();
        assert!(wait_until(|| !manager.is_loading()));
        assert!(manager.get_loaded_chunk(b).unwrap().read().is_finalized());
        assert_eq!(generator.calls(), 2);

        manager.tick();
        assert!(!manager.is_loading());
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn refresh_renews_and_queues() {
        let root = temp_root();
        let generator = Arc::new(TestGenerator::new(64));
        let manager = manager_with(&root, generator, StorageConfig::default());
        let resident = ChunkVec::new(2, 2, 2);
        let missing = ChunkVec::new(2, 2, 3);

        let chunk = manager.get_chunk(resident, GenerationBarrier::All).unwrap();
        manager.refresh([
            (resident, ChunkLoadTicket::Timed(500)),
            (missing, ChunkLoadTicket::PLAYER),
        ]);
        assert_eq!(chunk.read().residency().remaining(), 500);
        manager.tick();
        assert!(wait_until(|| manager.get_loaded_chunk(missing).is_some() && !manager.is_loading()));
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn failures_reach_caller_and_hook() {
        let root = temp_root();
        let mut generator = TestGenerator::new(64);
        generator.fail = true;
        let generator = Arc::new(generator);
        let manager = manager_with(&root, generator.clone(), StorageConfig::default());

        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        manager.set_error_hook(Arc::new(move |pos: ChunkVec, _e: &StorageError| {
            sink.lock().push(pos)
        }));

        let pos = ChunkVec::new(0, 0, 0);
        assert!(matches!(
            manager.get_chunk(pos, GenerationBarrier::All),
            Err(StorageError::Generation { pos: p, .. }) if p == pos
        ));
        assert_eq!(*reported.lock(), vec![pos]);
        assert_eq!(manager.in_flight_count(), 0);

        let chunk = manager.get_loaded_chunk(pos).unwrap();
        assert!(!chunk.read().is_generating());
        assert_eq!(chunk.read().barrier(), GenerationBarrier::None);

        assert!(manager.get_chunk(pos, GenerationBarrier::All).is_err());
        assert_eq!(generator.calls(), 2);
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn close_with_generations_in_flight() {
        let root = temp_root();
        let mut generator = TestGenerator::new(64);
        generator.delay = Duration::from_millis(200);
        let generator = Arc::new(generator);
        let config = StorageConfig {
            generation_threads: 2,
            ..StorageConfig::default()
        };
        let manager = manager_with(&root, generator, config);

        let futures: Vec<ChunkFuture> = (0..6)
            .map(|i| manager.load_chunk_async(ChunkVec::new(i, 0, 0)))
            .collect();
        std::thread::sleep(Duration::from_millis(50));
        manager.close().unwrap();

        assert_eq!(manager.in_flight_count(), 0);
        assert!(manager.get_loaded_chunk(ChunkVec::new(0, 0, 0)).is_none());
        for future in futures {
            assert!(future.join().is_err());
        }
        assert!(matches!(
            manager.get_chunk(ChunkVec::new(0, 0, 0), GenerationBarrier::All),
            Err(StorageError::ShutDown)
        ));
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn surface_probe_walks_down_and_tops_out() {
        let root = temp_root();
        let generator = Arc::new(TestGenerator::new(10));
        let manager = manager_with(&root, generator, StorageConfig::default());

        assert_eq!(manager.height(5, 5, HeightmapType::WorldSurface), None);
        assert_eq!(manager.lowest_chunk_at(5, 5).unwrap(), Some(ChunkVec::new(0, 0, 0)));
        assert_eq!(manager.read_height(5, 5).unwrap(), Some(10));
        assert_eq!(manager.height(5, 5, HeightmapType::WorldSurface), Some(10));
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn surface_probe_tops_out_across_chunks() {
        let root = temp_root();
        let mut generator = TestGenerator::new(96);
        generator.hint = Some(89.5);
        let manager = manager_with(&root, Arc::new(generator), StorageConfig::default());

        assert_eq!(manager.read_height(-7, 40).unwrap(), Some(96));
        assert_eq!(
            manager.lowest_chunk_at(-7, 40).unwrap(),
            Some(ChunkVec::new(-1, 3, 1))
        );
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn finalized_chunks_raise_world_surface() {
        let root = temp_root();
        let generator = Arc::new(TestGenerator::new(64));
        let manager = manager_with(&root, generator, StorageConfig::default());

        manager
            .get_chunk(ChunkVec::new(0, 2, 0), GenerationBarrier::All)
            .unwrap();
        assert_eq!(manager.height(31, 31, HeightmapType::WorldSurface), Some(64));
        assert_eq!(manager.height(32, 0, HeightmapType::WorldSurface), None);
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn read_height_ignores_columns_capped_by_their_chunk() {
        let root = temp_root();
        let generator = Arc::new(TestGenerator::new(96));
        let manager = manager_with(&root, generator, StorageConfig::default());

        manager
            .get_chunk(ChunkVec::new(0, 2, 0), GenerationBarrier::All)
            .unwrap();
        assert_eq!(manager.height(0, 0, HeightmapType::WorldSurface), None);
        assert_eq!(manager.read_height(0, 0).unwrap(), Some(96));
        manager.close().unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn awaited_from_async_code() {
        let root = temp_root();
        let generator = Arc::new(TestGenerator::new(64));
        let manager = Arc::new(manager_with(&root, generator, StorageConfig::default()));

        let pos = ChunkVec::new(0, 2, 0);
        let chunk = manager.load_chunk_async(pos).await.unwrap();
        assert!(chunk.read().is_finalized());

        let closing = manager.clone();
        tokio::task::spawn_blocking(move || closing.close())
            .await
            .unwrap()
            .unwrap();
        tokio::task::spawn_blocking(move || drop(manager)).await.unwrap();
        std::fs::remove_dir_all(&root).ok();
    }
}
