//! The two-stage frame pipeline.
//!
//! Stage-A is a compress-only worker; Stage-B compresses (if Stage-A
//! didn't already) and is responsible for commit ordering. A reorder
//! buffer keyed by ascending `seq_id` absorbs the fact that Stage-A and
//! Stage-B each run on their own thread and can finish out of push
//! order; a 1 Hz timer thread drains whatever prefix of the buffer is
//! contiguous from the last committed `seq_id` and hands it to the
//! store's background task queue as one commit task, so the actual
//! `CollectionData` write goes through the same `AsyncTaskQueue` every
//! other out-of-band writer uses rather than a parallel commit path.

use crate::balancer::{self, BackPressure, CompressionLevels};
use crate::compress::compress;
use crate::stats::{RunningMean, Stage, StageStats};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracecap_error::Result;
use tracecap_store::{StoreFacade, Task, TxContext, Value};
use tracecap_util::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracecap_util::StopHandle;

const STAGE_A_POLL: Duration = Duration::from_millis(10);
const COMMIT_TICK: Duration = Duration::from_secs(1);

/// One captured frame in flight through the pipeline.
#[derive(Debug, Clone)]
pub struct Payload {
    pub bytes: Vec<u8>,
    /// Always the `Double` wire type `CollectionData.timestamp` expects;
    /// kept as a bare [`Value`] rather than `tracecap_collect::Timestamp`
    /// so this crate doesn't need to depend on the collection layer.
    pub timestamp: Value,
    pub seq_id: u64,
    pub is_compressed: bool,
}

/// Callback the caller supplies to drain newly-interned strings at
/// commit time, so the drain runs as part of the same transaction as the
/// frames it names. A plain `(u32, String)` shape keeps this crate
/// decoupled from `tracecap-collect`'s `StringInterner`.
pub type StringDrain = dyn Fn() -> Vec<(u32, String)> + Send + Sync;

enum StageMsg {
    Item(Payload),
    Shutdown,
}

/// Min-heap entry ordering payloads by ascending `seq_id` regardless of
/// arrival order.
struct HeapEntry(Payload);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq_id == other.0.seq_id
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.seq_id.cmp(&other.0.seq_id)
    }
}

/// One batch of committed frames plus the strings interned while they
/// were in flight, executed as a single unit by the store's task queue.
struct CommitBatchTask {
    batch: Vec<Payload>,
    new_strings: Vec<(u32, String)>,
}

impl Task for CommitBatchTask {
    fn execute(&self, tx: &TxContext<'_>) -> Result<()> {
        for payload in &self.batch {
            tx.insert(
                "CollectionData",
                &["id", "timestamp", "data_vals", "is_compressed"],
                &[
                    Value::U32(payload.seq_id as u32),
                    payload.timestamp.clone(),
                    Value::Blob(payload.bytes.clone()),
                    Value::I32(payload.is_compressed as i32),
                ],
            )?;
        }
        for (id, text) in &self.new_strings {
            tx.insert("StringMap", &["id", "text"], &[Value::U32(*id), Value::Text(text.clone())])?;
        }
        Ok(())
    }
}

/// The two-stage capture-to-disk pipeline.
pub struct Pipeline {
    facade: Arc<StoreFacade>,
    seq_counter: AtomicU64,
    is_running: Arc<AtomicBool>,

    stage_a_tx: Sender<StageMsg>,
    stage_a_depth: Arc<AtomicUsize>,
    stage_a_mean: Arc<Mutex<RunningMean>>,
    stage_a_level: Arc<AtomicUsize>,
    stage_a_thread: Mutex<Option<StopHandle<()>>>,

    stage_b_tx: Sender<StageMsg>,
    stage_b_depth: Arc<AtomicUsize>,
    stage_b_mean: Arc<Mutex<RunningMean>>,
    stage_b_level: Arc<AtomicUsize>,
    stage_b_thread: Mutex<Option<JoinHandle<()>>>,

    levels: Mutex<CompressionLevels>,
    back_pressure: Mutex<BackPressure>,
    commit_timer_thread: Mutex<Option<StopHandle<()>>>,
}

impl Pipeline {
    /// `high_water_mark` seeds the back-pressure watchdog; `stage_a_level`
    /// and `stage_b_level` seed the load balancer's initial per-stage
    /// compression levels, overridden on the very next push by whatever
    /// bracket the balancer computes; `string_drain` is called once per
    /// commit tick to collect newly interned strings for `StringMap`.
    pub fn new(
        facade: Arc<StoreFacade>,
        high_water_mark: usize,
        stage_a_level: u32,
        stage_b_level: u32,
        string_drain: Arc<StringDrain>,
    ) -> Self {
        let is_running = Arc::new(AtomicBool::new(true));

        let (stage_b_tx, stage_b_rx) = unbounded::<StageMsg>();
        let (stage_a_tx, stage_a_rx) = unbounded::<StageMsg>();

        let stage_a_depth = Arc::new(AtomicUsize::new(0));
        let stage_a_mean = Arc::new(Mutex::new(RunningMean::new()));
        let stage_a_level_atomic = Arc::new(AtomicUsize::new(stage_a_level as usize));

        let stage_b_depth = Arc::new(AtomicUsize::new(0));
        let stage_b_mean = Arc::new(Mutex::new(RunningMean::new()));
        let stage_b_level_atomic = Arc::new(AtomicUsize::new(stage_b_level as usize));

        let heap: Arc<Mutex<BinaryHeap<Reverse<HeapEntry>>>> = Arc::new(Mutex::new(BinaryHeap::new()));

        let stage_a_join = spawn_stage_a(
            stage_a_rx,
            stage_b_tx.clone(),
            Arc::clone(&stage_a_depth),
            Arc::clone(&stage_a_mean),
            Arc::clone(&stage_a_level_atomic),
        );
        let stage_a_stop_tx = stage_a_tx.clone();
        let stage_a_thread = StopHandle::new(
            Box::new(move || {
                let _ = stage_a_stop_tx.send(StageMsg::Shutdown);
            }),
            stage_a_join,
        );

        let stage_b_thread = spawn_stage_b(
            stage_b_rx,
            Arc::clone(&stage_b_depth),
            Arc::clone(&stage_b_mean),
            Arc::clone(&stage_b_level_atomic),
            Arc::clone(&heap),
        );

        let (commit_stop_tx, commit_stop_rx) = unbounded::<()>();
        let commit_timer_join = spawn_commit_timer(
            Arc::clone(&facade),
            Arc::clone(&heap),
            commit_stop_rx,
            string_drain,
        );
        let commit_timer_thread = StopHandle::new(
            Box::new(move || {
                let _ = commit_stop_tx.send(());
            }),
            commit_timer_join,
        );

        Self {
            facade,
            seq_counter: AtomicU64::new(0),
            is_running,
            stage_a_tx,
            stage_a_depth,
            stage_a_mean,
            stage_a_level: stage_a_level_atomic,
            stage_a_thread: Mutex::new(Some(stage_a_thread)),
            stage_b_tx,
            stage_b_depth,
            stage_b_mean,
            stage_b_level: stage_b_level_atomic,
            stage_b_thread: Mutex::new(Some(stage_b_thread)),
            levels: Mutex::new(CompressionLevels {
                stage_a: stage_a_level,
                stage_b: stage_b_level,
            }),
            back_pressure: Mutex::new(BackPressure::new(high_water_mark)),
            commit_timer_thread: Mutex::new(Some(commit_timer_thread)),
        }
    }

    /// Enqueue one frame. Assigns a monotonic `seq_id`, recomputes the
    /// load-balancer bracket, applies back-pressure, and routes to
    /// whichever stage's input channel the balancer names.
    pub fn push(&self, bytes: Vec<u8>, timestamp: Value) {
        let seq_id = self.seq_counter.fetch_add(1, Ordering::SeqCst);

        let a_time = self.stage_a_depth.load(Ordering::SeqCst) as f64 * self.stage_a_mean.lock().mean();
        let b_time = self.stage_b_depth.load(Ordering::SeqCst) as f64 * self.stage_b_mean.lock().mean();
        let p = balancer::fraction_p(a_time, b_time);

        let mut levels = self.levels.lock();
        *levels = balancer::bracket_levels(p);
        let total_queued =
            self.stage_a_depth.load(Ordering::SeqCst) + self.stage_b_depth.load(Ordering::SeqCst);
        if self.back_pressure.lock().observe(total_queued) {
            *levels = balancer::decrement_floor_zero(*levels);
        }
        let levels = *levels;
        self.stage_a_level.store(levels.stage_a as usize, Ordering::SeqCst);
        self.stage_b_level.store(levels.stage_b as usize, Ordering::SeqCst);

        let payload = Payload {
            bytes,
            timestamp,
            seq_id,
            is_compressed: false,
        };

        match balancer::route_for(p) {
            Stage::A => {
                self.stage_a_depth.fetch_add(1, Ordering::SeqCst);
                let _ = self.stage_a_tx.send(StageMsg::Item(payload));
            }
            Stage::B => {
                self.stage_b_depth.fetch_add(1, Ordering::SeqCst);
                let mut payload = payload;
                if levels.stage_b != 0 {
                    payload.bytes = compress(&payload.bytes, levels.stage_b);
                    payload.is_compressed = true;
                }
                let _ = self.stage_b_tx.send(StageMsg::Item(payload));
            }
        }
    }

    pub fn stage_stats(&self, stage: Stage) -> StageStats {
        let (depth, mean) = match stage {
            Stage::A => (&self.stage_a_depth, &self.stage_a_mean),
            Stage::B => (&self.stage_b_depth, &self.stage_b_mean),
        };
        let mean = mean.lock().mean();
        let a_time = self.stage_a_depth.load(Ordering::SeqCst) as f64 * self.stage_a_mean.lock().mean();
        let b_time = self.stage_b_depth.load(Ordering::SeqCst) as f64 * self.stage_b_mean.lock().mean();
        StageStats {
            queue_depth: depth.load(Ordering::SeqCst),
            mean_processing_time_us: mean,
            fraction_p: balancer::fraction_p(a_time, b_time),
        }
    }

    /// Stops accepting new work conceptually (callers should stop
    /// calling `push` before this returns), drains both stages, flushes
    /// the commit timer one final time, then stops the store's
    /// out-of-band task queue so the flush's enqueued commits actually
    /// land before this returns.
    pub fn teardown(&self) -> Result<()> {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(mut t) = self.stage_a_thread.lock().take() {
            t.stop();
        }
        if let Some(t) = self.stage_b_thread.lock().take() {
            let _ = t.join();
        }
        if let Some(mut t) = self.commit_timer_thread.lock().take() {
            t.stop();
        }
        self.facade.stop_task_queue()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

fn spawn_stage_a(
    rx: Receiver<StageMsg>,
    forward: Sender<StageMsg>,
    depth: Arc<AtomicUsize>,
    mean: Arc<Mutex<RunningMean>>,
    level: Arc<AtomicUsize>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("tracecap-stage-a".into())
        .spawn(move || loop {
            match rx.recv_timeout(STAGE_A_POLL) {
                Ok(StageMsg::Item(payload)) => {
                    depth.fetch_sub(1, Ordering::SeqCst);
                    let payload = process_stage_a(payload, &level, &mean);
                    let _ = forward.send(StageMsg::Item(payload));
                }
                Ok(StageMsg::Shutdown) => {
                    drain_stage_a(&rx, &forward, &depth, &level, &mean);
                    let _ = forward.send(StageMsg::Shutdown);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .expect("failed to spawn tracecap-stage-a worker")
}

fn drain_stage_a(
    rx: &Receiver<StageMsg>,
    forward: &Sender<StageMsg>,
    depth: &Arc<AtomicUsize>,
    level: &Arc<AtomicUsize>,
    mean: &Arc<Mutex<RunningMean>>,
) {
    while let Ok(msg) = rx.try_recv() {
        match msg {
            StageMsg::Item(payload) => {
                depth.fetch_sub(1, Ordering::SeqCst);
                let payload = process_stage_a(payload, level, mean);
                let _ = forward.send(StageMsg::Item(payload));
            }
            StageMsg::Shutdown => break,
        }
    }
}

fn process_stage_a(
    mut payload: Payload,
    level: &Arc<AtomicUsize>,
    mean: &Arc<Mutex<RunningMean>>,
) -> Payload {
    let start = Instant::now();
    let lvl = level.load(Ordering::SeqCst) as u32;
    if lvl != 0 && !payload.is_compressed {
        payload.bytes = compress(&payload.bytes, lvl);
        payload.is_compressed = true;
    }
    mean.lock().observe(start.elapsed().as_micros() as f64);
    payload
}

fn spawn_stage_b(
    rx: Receiver<StageMsg>,
    depth: Arc<AtomicUsize>,
    mean: Arc<Mutex<RunningMean>>,
    level: Arc<AtomicUsize>,
    heap: Arc<Mutex<BinaryHeap<Reverse<HeapEntry>>>>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("tracecap-stage-b".into())
        .spawn(move || loop {
            match rx.recv_timeout(STAGE_A_POLL) {
                Ok(StageMsg::Item(payload)) => {
                    depth.fetch_sub(1, Ordering::SeqCst);
                    let payload = process_stage_b(payload, &level, &mean);
                    heap.lock().push(Reverse(HeapEntry(payload)));
                }
                Ok(StageMsg::Shutdown) => {
                    while let Ok(msg) = rx.try_recv() {
                        match msg {
                            StageMsg::Item(payload) => {
                                depth.fetch_sub(1, Ordering::SeqCst);
                                let payload = process_stage_b(payload, &level, &mean);
                                heap.lock().push(Reverse(HeapEntry(payload)));
                            }
                            StageMsg::Shutdown => break,
                        }
                    }
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .expect("failed to spawn tracecap-stage-b worker")
}

fn process_stage_b(
    mut payload: Payload,
    level: &Arc<AtomicUsize>,
    mean: &Arc<Mutex<RunningMean>>,
) -> Payload {
    let start = Instant::now();
    let lvl = level.load(Ordering::SeqCst) as u32;
    if lvl != 0 && !payload.is_compressed {
        payload.bytes = compress(&payload.bytes, lvl);
        payload.is_compressed = true;
    }
    mean.lock().observe(start.elapsed().as_micros() as f64);
    payload
}

fn spawn_commit_timer(
    facade: Arc<StoreFacade>,
    heap: Arc<Mutex<BinaryHeap<Reverse<HeapEntry>>>>,
    stop_rx: Receiver<()>,
    string_drain: Arc<StringDrain>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("tracecap-commit-timer".into())
        .spawn(move || {
            let mut next_seq: u64 = 0;
            loop {
                match stop_rx.recv_timeout(COMMIT_TICK) {
                    Ok(()) => {
                        flush_ready(&facade, &heap, &mut next_seq, &string_drain);
                        flush_remainder(&facade, &heap, &mut next_seq, &string_drain);
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        flush_ready(&facade, &heap, &mut next_seq, &string_drain);
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .expect("failed to spawn tracecap-commit-timer")
}

/// Pops the contiguous-from-`next_seq` prefix of the reorder buffer and
/// enqueues it as one commit task.
fn flush_ready(
    facade: &StoreFacade,
    heap: &Arc<Mutex<BinaryHeap<Reverse<HeapEntry>>>>,
    next_seq: &mut u64,
    string_drain: &Arc<StringDrain>,
) {
    let mut batch = Vec::new();
    {
        let mut heap = heap.lock();
        while let Some(Reverse(entry)) = heap.peek() {
            if entry.0.seq_id != *next_seq {
                break;
            }
            let Reverse(entry) = heap.pop().unwrap();
            batch.push(entry.0);
            *next_seq += 1;
        }
    }
    commit_batch(facade, batch, string_drain);
}

/// Called only at teardown: commits whatever is left even if it isn't a
/// perfectly contiguous prefix, so a frame never silently disappears.
fn flush_remainder(
    facade: &StoreFacade,
    heap: &Arc<Mutex<BinaryHeap<Reverse<HeapEntry>>>>,
    next_seq: &mut u64,
    string_drain: &Arc<StringDrain>,
) {
    let mut batch = Vec::new();
    {
        let mut heap = heap.lock();
        while let Some(Reverse(entry)) = heap.pop() {
            *next_seq = entry.0.seq_id.max(*next_seq) + 1;
            batch.push(entry.0);
        }
    }
    batch.sort_by_key(|p| p.seq_id);
    if !batch.is_empty() {
        log::warn!(
            "flushing {} frame(s) at teardown outside the normal contiguous commit order",
            batch.len()
        );
    }
    commit_batch(facade, batch, string_drain);
}

fn commit_batch(facade: &StoreFacade, batch: Vec<Payload>, string_drain: &Arc<StringDrain>) {
    if batch.is_empty() {
        return;
    }
    let new_strings = string_drain();
    facade.enqueue_task(Box::new(CommitBatchTask { batch, new_strings }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracecap_schema::{core_schema, TimeType};
    use std::sync::Mutex as StdMutex;

    fn open_store() -> Arc<StoreFacade> {
        let facade = StoreFacade::open_in_memory().unwrap();
        facade.apply_schema(&core_schema(5, TimeType::Int).unwrap()).unwrap();
        facade
    }

    #[test]
    fn pushed_frames_are_eventually_committed_in_seq_order() {
        let facade = open_store();
        let drain: Arc<StringDrain> = Arc::new(|| Vec::new());
        let pipeline = Pipeline::new(Arc::clone(&facade), 1_000_000, 6, 1, drain);

        for i in 0..20u32 {
            pipeline.push(vec![i as u8; 4], Value::F64(i as f64));
        }

        pipeline.teardown().unwrap();

        let rows: Vec<_> = facade
            .query("CollectionData")
            .select(&["id"])
            .order_by("rowid", false)
            .run()
            .unwrap()
            .collect();
        let ids: Vec<i64> = rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted, "commit order must match ascending seq_id");
        assert_eq!(ids.len(), 20);
    }

    #[test]
    fn string_drain_callback_runs_at_commit_time() {
        let facade = open_store();
        let calls = Arc::new(StdMutex::new(0u32));
        let calls_clone = Arc::clone(&calls);
        let drain: Arc<StringDrain> = Arc::new(move || {
            let mut n = calls_clone.lock().unwrap();
            *n += 1;
            if *n == 1 {
                vec![(0, "ADD".to_string())]
            } else {
                Vec::new()
            }
        });
        let pipeline = Pipeline::new(Arc::clone(&facade), 1_000_000, 6, 1, drain);
        pipeline.push(vec![1, 2, 3], Value::F64(1.0));
        pipeline.teardown().unwrap();

        let rows: Vec<_> = facade
            .query("StringMap")
            .select(&["id", "text"])
            .run()
            .unwrap()
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1].as_text(), Some("ADD"));
    }

    #[test]
    fn teardown_is_idempotent_via_drop() {
        let facade = open_store();
        let drain: Arc<StringDrain> = Arc::new(|| Vec::new());
        let pipeline = Pipeline::new(Arc::clone(&facade), 1_000_000, 6, 1, drain);
        pipeline.push(vec![9], Value::F64(0.0));
        pipeline.teardown().unwrap();
        drop(pipeline);
    }

    #[test]
    fn new_seeds_the_balancer_with_the_configured_initial_levels() {
        let facade = open_store();
        let drain: Arc<StringDrain> = Arc::new(|| Vec::new());
        let pipeline = Pipeline::new(Arc::clone(&facade), 1_000_000, 9, 2, drain);
        assert_eq!(pipeline.levels.lock().stage_a, 9);
        assert_eq!(pipeline.levels.lock().stage_b, 2);
        pipeline.teardown().unwrap();
    }
}
