//! Bounded archival worker pool. Each category gets its own fixed set of worker
//! threads fed through a queue as deep as the worker count. A full queue refuses
//! new work instead of blocking the caller; refused units are offered again later.

use crate::archivist::archive::{Archiver, Category, Completion, WorkUnit};
use anyhow::{Context, Result, anyhow};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Lane {
    category: Category,
    sender: Option<SyncSender<WorkUnit>>,
    handles: Vec<JoinHandle<()>>,
}

impl Lane {
    fn start(
        category: Category,
        workers: usize,
        archiver: &Arc<Archiver>,
        done: &Sender<Completion>,
    ) -> Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::sync_channel::<WorkUnit>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx = Arc::clone(&rx);
            let archiver = Arc::clone(archiver);
            let done = done.clone();
            let handle = thread::Builder::new()
                .name(format!("archivist-{}-{idx}", category.as_str()))
                .spawn(move || worker_loop(&rx, &archiver, &done))
                .with_context(|| format!("failed to spawn {} worker", category.as_str()))?;
            handles.push(handle);
        }
        Ok(Self {
            category,
            sender: Some(tx),
            handles,
        })
    }
}

fn worker_loop(
    rx: &Mutex<Receiver<WorkUnit>>,
    archiver: &Archiver,
    done: &Sender<Completion>,
) {
    loop {
        let next = match rx.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => return,
        };
        let Ok(unit) = next else {
            return;
        };
        let completion = archiver.execute(&unit);
        if done.send(completion).is_err() {
            return;
        }
    }
}

pub struct WorkerPool {
    lanes: Vec<Lane>,
    completions: Receiver<Completion>,
    outstanding: usize,
}

impl WorkerPool {
    pub fn start(archiver: Arc<Archiver>, batch_workers: usize, artifact_workers: usize) -> Result<Self> {
        let (done_tx, done_rx) = mpsc::channel();
        let lanes = vec![
            Lane::start(Category::Batch, batch_workers, &archiver, &done_tx)?,
            Lane::start(Category::Artifact, artifact_workers, &archiver, &done_tx)?,
        ];
        Ok(Self {
            lanes,
            completions: done_rx,
            outstanding: 0,
        })
    }

    /// Queues `unit` for its category. Returns `Ok(false)` without blocking when the
    /// lane is saturated; the caller keeps the unit and offers it again later.
    pub fn try_submit(&mut self, unit: WorkUnit) -> Result<bool> {
        let category = unit.category();
        let sender = self
            .lanes
            .iter()
            .find(|lane| lane.category == category)
            .and_then(|lane| lane.sender.as_ref())
            .ok_or_else(|| anyhow!("{} lane is shut down", category.as_str()))?;
        match sender.try_send(unit) {
            Ok(()) => {
                self.outstanding += 1;
                Ok(true)
            }
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => {
                Err(anyhow!("{} workers exited", category.as_str()))
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Completions already reported, without waiting.
    pub fn try_drain(&mut self) -> Vec<Completion> {
        let mut out = Vec::new();
        while let Ok(completion) = self.completions.try_recv() {
            out.push(completion);
        }
        self.outstanding = self.outstanding.saturating_sub(out.len());
        out
    }

    /// Waits up to `grace` for every outstanding unit to report back.
    pub fn drain_for(&mut self, grace: Duration) -> Vec<Completion> {
        let deadline = Instant::now() + grace;
        let mut out = Vec::new();
        while self.outstanding > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(remaining) {
                Ok(completion) => {
                    self.outstanding -= 1;
                    out.push(completion);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        out
    }

    /// Closes the queues. Workers are joined only when nothing is outstanding;
    /// otherwise they are left to finish on their own. Returns the abandoned count.
    pub fn shutdown(mut self) -> usize {
        for lane in &mut self.lanes {
            lane.sender = None;
        }
        if self.outstanding == 0 {
            for lane in &mut self.lanes {
                for handle in lane.handles.drain(..) {
                    let _ = handle.join();
                }
            }
        }
        self.outstanding
    }
}
