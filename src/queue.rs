use crate::process::CancelHandle;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

pub const DEFAULT_MAX_CONCURRENT: usize = 2;

type ExecutorFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Executor = Arc<dyn Fn(String, CancelHandle) -> ExecutorFuture + Send + Sync>;

/// Where a stop request found the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDisposition {
    /// Removed from the pending set; the caller settles the run directly.
    Pending,
    /// The cancellation handle was signalled; the executor's finalizer
    /// settles the run.
    Running,
    /// Not owned by the queue.
    Unknown,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    running: HashSet<String>,
    controllers: HashMap<String, CancelHandle>,
}

/// FIFO admission with a concurrency cap. The queue owns only scheduling
/// state; status transitions and events belong to the executor.
#[derive(Clone)]
pub struct RunQueue {
    state: Arc<Mutex<QueueState>>,
    executor: Arc<RwLock<Option<Executor>>>,
    max_concurrent: usize,
}

impl RunQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            executor: Arc::new(RwLock::new(None)),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        let mut writer = self.executor.write().expect("queue executor write lock");
        *writer = Some(executor);
    }

    pub fn enqueue(&self, run_id: &str) {
        {
            let mut state = self.state.lock().expect("queue state lock");
            let already_known = state.pending.iter().any(|queued| queued == run_id)
                || state.running.contains(run_id);
            if already_known {
                return;
            }
            state.pending.push_back(run_id.to_string());
        }
        self.tick();
    }

    /// Remove a still-pending run. Running runs cannot pause.
    pub fn pause(&self, run_id: &str) -> bool {
        let mut state = self.state.lock().expect("queue state lock");
        let before = state.pending.len();
        state.pending.retain(|queued| queued != run_id);
        state.pending.len() != before
    }

    pub fn stop(&self, run_id: &str) -> StopDisposition {
        let mut state = self.state.lock().expect("queue state lock");
        let before = state.pending.len();
        state.pending.retain(|queued| queued != run_id);
        if state.pending.len() != before {
            return StopDisposition::Pending;
        }
        if let Some(controller) = state.controllers.get(run_id) {
            controller.cancel();
            return StopDisposition::Running;
        }
        StopDisposition::Unknown
    }

    /// Pop as many pending runs as the cap allows and hand each to the
    /// executor on its own task. Each completion re-ticks.
    pub fn tick(&self) {
        loop {
            let executor = {
                let reader = self.executor.read().expect("queue executor read lock");
                match reader.as_ref() {
                    Some(executor) => executor.clone(),
                    None => return,
                }
            };

            let next = {
                let mut state = self.state.lock().expect("queue state lock");
                if state.running.len() >= self.max_concurrent {
                    return;
                }
                let Some(run_id) = state.pending.pop_front() else {
                    return;
                };
                let controller = CancelHandle::new();
                state.running.insert(run_id.clone());
                state.controllers.insert(run_id.clone(), controller.clone());
                (run_id, controller)
            };

            let queue = self.clone();
            let (run_id, controller) = next;
            tokio::spawn(async move {
                // A nested task keeps the slot release and re-tick running
                // even when the executor panics.
                let completion = tokio::spawn(executor(run_id.clone(), controller)).await;
                if let Err(error) = completion {
                    tracing::error!(run_id = %run_id, error = %error, "run executor aborted");
                }
                {
                    let mut state = queue.state.lock().expect("queue state lock");
                    state.running.remove(&run_id);
                    state.controllers.remove(&run_id);
                }
                queue.tick();
            });
        }
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().expect("queue state lock").running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().expect("queue state lock").pending.len()
    }

    pub fn cancel_all_running(&self) {
        let state = self.state.lock().expect("queue state lock");
        for controller in state.controllers.values() {
            controller.cancel();
        }
    }
}
