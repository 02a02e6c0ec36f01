//! The encode worker.
//!
//! Frames are handed over one at a time through a single staging buffer. The producer
//! blocks while a job is still waiting to be picked up, so at most one frame is ever
//! in flight and frames reach the encoder in the order they were submitted.

use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use mupen_integrations::Log;

use crate::{CaptureError, FrameCounter, VideoSink, encode_frame, flip};

#[derive(Debug, Default)]
struct Handoff {
    staging: Vec<u8>,
    width: u32,
    height: u32,
    has_work: bool,
    busy: bool,
    shutdown: bool,
    exited: bool,
    failure: Option<CaptureError>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<Handoff>,
    signal: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Handoff> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_while<'a, F>(&'a self, guard: MutexGuard<'a, Handoff>, condition: F) -> MutexGuard<'a, Handoff>
    where
        F: FnMut(&mut Handoff) -> bool,
    {
        self.signal
            .wait_while(guard, condition)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub(crate) struct EncodeWorker {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<Box<dyn VideoSink>>>,
}

impl EncodeWorker {
    pub(crate) fn spawn(sink: Box<dyn VideoSink>, counter: FrameCounter) -> Result<Self, CaptureError> {
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();

        let thread = thread::Builder::new()
            .name("KrecEncodeWorker".into())
            .spawn(move || run(worker_shared, sink, counter))
            .map_err(CaptureError::ThreadSpawn)?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Hands a frame to the worker. `fill` writes the raw bottom-up pixels into the
    /// staging buffer, which is sized for `width`x`height` before the call.
    ///
    /// Blocks while the previous job hasn't been picked up yet. A failure from an
    /// earlier frame is returned here instead of submitting.
    pub(crate) fn submit<F>(&self, width: u32, height: u32, fill: F) -> Result<(), CaptureError>
    where
        F: FnOnce(&mut [u8]) -> Result<(), CaptureError>,
    {
        let mut staging = {
            let state = self.shared.lock();
            let mut state = self
                .shared
                .wait_while(state, |state| state.has_work && state.failure.is_none() && !state.exited);

            if let Some(error) = state.failure.take() {
                return Err(error);
            }

            if state.exited {
                return Err(CaptureError::WorkerPanicked);
            }

            mem::take(&mut state.staging)
        };

        // Filling happens unlocked; the worker never touches the staging buffer
        // while `has_work` is false.
        staging.resize(flip::frame_len(width, height), 0);
        let filled = fill(&mut staging);

        let mut state = self.shared.lock();
        state.staging = staging;
        filled?;

        state.width = width;
        state.height = height;
        state.has_work = true;
        drop(state);

        self.shared.signal.notify_all();
        Ok(())
    }

    /// Blocks until the last submitted frame has been written.
    pub(crate) fn wait_idle(&self) {
        let state = self.shared.lock();
        let _state = self
            .shared
            .wait_while(state, |state| (state.has_work || state.busy) && !state.exited);
    }

    /// Waits for outstanding work, stops the thread and hands back the sink.
    pub(crate) fn finish(mut self) -> Result<Box<dyn VideoSink>, CaptureError> {
        self.wait_idle();

        let sink = self.join()?;

        match self.shared.lock().failure.take() {
            Some(error) => Err(error),
            None => Ok(sink),
        }
    }

    fn join(&mut self) -> Result<Box<dyn VideoSink>, CaptureError> {
        self.shared.lock().shutdown = true;
        self.shared.signal.notify_all();

        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| CaptureError::WorkerPanicked),
            None => Err(CaptureError::WorkerPanicked),
        }
    }
}

impl Drop for EncodeWorker {
    /// Joins the worker if `finish` was never called, logging any error.
    fn drop(&mut self) {
        if self.thread.is_none() {
            return;
        }

        if let Err(error) = self.join() {
            tracing::error!(target: Log::Capture, ?error, "Encode worker did not shut down cleanly");
        }
    }
}

/// Marks the worker as gone if its thread unwinds, so nobody waits on it forever.
struct UnwindGuard<'a>(&'a Shared);

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }

        let mut state = self.0.lock();
        state.exited = true;
        state.has_work = false;
        state.busy = false;
        state.failure.get_or_insert(CaptureError::WorkerPanicked);
        drop(state);

        self.0.signal.notify_all();
    }
}

fn run(shared: Arc<Shared>, mut sink: Box<dyn VideoSink>, counter: FrameCounter) -> Box<dyn VideoSink> {
    let _guard = UnwindGuard(&shared);
    let mut raw = Vec::new();
    let mut flipped = Vec::new();
    let mut failed = false;

    loop {
        let (width, height) = {
            let state = shared.lock();
            let mut state = shared.wait_while(state, |state| !state.has_work && !state.shutdown);

            // Pending work is always drained before shutting down.
            if !state.has_work {
                break;
            }

            mem::swap(&mut raw, &mut state.staging);
            state.has_work = false;
            state.busy = true;
            (state.width, state.height)
        };

        shared.signal.notify_all();

        // After a failure frames are dropped, but still acknowledged so the producer
        // never blocks on a dead encoder.
        let result = if failed {
            Ok(())
        } else {
            encode_frame(sink.as_mut(), &raw, &mut flipped, width, height)
        };

        match result {
            Ok(()) if !failed => counter.increment(),
            Ok(()) => {},

            Err(error) => {
                tracing::error!(target: Log::Capture, ?error, "Failed to encode frame");
                failed = true;
                shared.lock().failure = Some(error);
            },
        }

        shared.lock().busy = false;
        shared.signal.notify_all();
    }

    tracing::info!(target: Log::Capture, frames = counter.get(), "Encode worker exiting");
    sink
}
