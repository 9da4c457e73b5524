//! Stream multiplexer: wraps worker invocation streams into metric-carrying
//! run event streams and merges concurrent runs into one ordered feed.
//!
//! Each run gets a bounded buffer; a consumer-slow merge blocks that
//! producer at its next send instead of dropping events, and never stalls
//! the other producers. Cancellation is cooperative via per-run tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_core::config::StreamConfig;
use weft_core::traits::{WorkerClient, WorkerDelta, WorkerRequest};
use weft_core::types::{AgentRun, RunId, RunStatus, WorkerType};

/// Words-generated count at which the streaming progress estimate saturates.
const PROGRESS_SATURATION_WORDS: u64 = 500;

/// Event emitted on a run's output stream.
///
/// Within one run, events are strictly ordered; across runs merged by
/// [`StreamMux::spawn_parallel`] no global order is imposed, so consumers
/// attribute by `run_id`.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Initialized {
        run_id: RunId,
        worker_type: WorkerType,
    },
    TextChunk {
        run_id: RunId,
        content: String,
        word_count: u64,
        progress: f64,
    },
    ToolUse {
        run_id: RunId,
        name: String,
        input: serde_json::Value,
    },
    Completed {
        run_id: RunId,
        total_words: u64,
        total_tokens: u64,
        elapsed_ms: u64,
    },
    Interrupted {
        run_id: RunId,
        reason: String,
    },
    Error {
        run_id: RunId,
        message: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Initialized { run_id, .. }
            | Self::TextChunk { run_id, .. }
            | Self::ToolUse { run_id, .. }
            | Self::Completed { run_id, .. }
            | Self::Interrupted { run_id, .. }
            | Self::Error { run_id, .. } => run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Interrupted { .. } | Self::Error { .. }
        )
    }
}

/// A run event tagged with the batch it belongs to.
#[derive(Debug, Clone)]
pub struct BatchEvent {
    pub batch_id: String,
    pub event: RunEvent,
}

/// What to execute in one run.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub worker_type: WorkerType,
    /// Short task label recorded on the run.
    pub task: String,
    /// Full prompt handed to the worker (task plus any prepared context).
    pub prompt: String,
}

/// Per-run execution options.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Wall-clock limit; exceeding it terminates the run as interrupted.
    pub timeout: Option<Duration>,
    /// Parent token; cancelling it cancels this run.
    pub cancel: Option<CancellationToken>,
}

/// Handle to one spawned run.
pub struct RunHandle {
    pub run_id: RunId,
    pub events: ReceiverStream<RunEvent>,
}

/// Handle to a parallel batch of runs merged into one stream.
pub struct BatchHandle {
    pub batch_id: String,
    pub run_ids: Vec<RunId>,
    pub events: BoxStream<'static, BatchEvent>,
}

struct RunEntry {
    record: Arc<Mutex<AgentRun>>,
    cancel: CancellationToken,
}

/// Multiplexes worker invocations into run event streams.
pub struct StreamMux {
    worker: Arc<dyn WorkerClient>,
    config: StreamConfig,
    runs: Mutex<HashMap<RunId, RunEntry>>,
}

impl StreamMux {
    pub fn new(worker: Arc<dyn WorkerClient>, config: StreamConfig) -> Self {
        Self {
            worker,
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn one worker run and return its event stream.
    ///
    /// The producer runs as a background task; the returned stream yields
    /// `Initialized`, zero or more `TextChunk`/`ToolUse`, and exactly one
    /// terminal event.
    pub fn spawn(&self, spec: SpawnSpec, options: SpawnOptions) -> RunHandle {
        let run_id = RunId::new(spec.worker_type);
        let cancel = options
            .cancel
            .map(|parent| parent.child_token())
            .unwrap_or_default();

        let record = Arc::new(Mutex::new(AgentRun::new(
            run_id.clone(),
            spec.worker_type,
            spec.task.clone(),
        )));

        self.runs.lock().unwrap().insert(
            run_id.clone(),
            RunEntry {
                record: record.clone(),
                cancel: cancel.clone(),
            },
        );

        let (tx, rx) = mpsc::channel(self.config.buffer);
        let timeout = options
            .timeout
            .unwrap_or(Duration::from_secs(self.config.run_timeout_secs));

        let producer = RunProducer {
            run_id: run_id.clone(),
            spec,
            worker: self.worker.clone(),
            record,
            cancel,
            timeout,
            tx,
        };
        tokio::spawn(producer.run());

        RunHandle {
            run_id,
            events: ReceiverStream::new(rx),
        }
    }

    /// Fan out N independent runs and merge their streams first-ready-wins.
    ///
    /// Within-run order is preserved; cancelling one run leaves the others
    /// untouched.
    pub fn spawn_parallel(
        &self,
        specs: Vec<SpawnSpec>,
        batch_id: impl Into<String>,
        options: SpawnOptions,
    ) -> BatchHandle {
        let batch_id = batch_id.into();
        let mut run_ids = Vec::with_capacity(specs.len());
        let mut streams = Vec::with_capacity(specs.len());

        for spec in specs {
            let handle = self.spawn(spec, options.clone());
            run_ids.push(handle.run_id);
            streams.push(handle.events);
        }

        info!(batch_id = %batch_id, runs = run_ids.len(), "Parallel batch spawned");

        let tag = batch_id.clone();
        let events = futures::stream::select_all(streams)
            .map(move |event| BatchEvent {
                batch_id: tag.clone(),
                event,
            })
            .boxed();

        BatchHandle {
            batch_id,
            run_ids,
            events,
        }
    }

    /// Cancel one run. Returns false if the run is unknown or already done.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        let runs = self.runs.lock().unwrap();
        match runs.get(run_id) {
            Some(entry) => {
                let terminal = entry.record.lock().unwrap().status.is_terminal();
                if terminal {
                    false
                } else {
                    entry.cancel.cancel();
                    true
                }
            }
            None => false,
        }
    }

    /// Cancel all outstanding runs.
    pub fn cleanup(&self) {
        let runs = self.runs.lock().unwrap();
        for entry in runs.values() {
            entry.cancel.cancel();
        }
        debug!(runs = runs.len(), "Stream mux cleanup requested");
    }

    /// Snapshot of one run's record.
    pub fn run(&self, run_id: &RunId) -> Option<AgentRun> {
        self.runs
            .lock()
            .unwrap()
            .get(run_id)
            .map(|e| e.record.lock().unwrap().clone())
    }

    /// Snapshot of all known runs.
    pub fn runs(&self) -> Vec<AgentRun> {
        self.runs
            .lock()
            .unwrap()
            .values()
            .map(|e| e.record.lock().unwrap().clone())
            .collect()
    }

    /// Drop records of terminal runs (called when a session is archived).
    pub fn prune_terminal(&self) {
        self.runs
            .lock()
            .unwrap()
            .retain(|_, e| !e.record.lock().unwrap().status.is_terminal());
    }
}

/// Background task driving one worker invocation.
struct RunProducer {
    run_id: RunId,
    spec: SpawnSpec,
    worker: Arc<dyn WorkerClient>,
    record: Arc<Mutex<AgentRun>>,
    cancel: CancellationToken,
    timeout: Duration,
    tx: mpsc::Sender<RunEvent>,
}

enum Terminal {
    Completed,
    Interrupted(String),
    Error(String),
}

impl RunProducer {
    async fn run(self) {
        let started = tokio::time::Instant::now();
        let deadline = started + self.timeout;

        self.emit(RunEvent::Initialized {
            run_id: self.run_id.clone(),
            worker_type: self.spec.worker_type,
        })
        .await;

        let terminal = self.drive(deadline).await;

        let (total_words, total_tokens) = {
            let mut record = self.record.lock().unwrap();
            record.last_activity = Utc::now();
            match &terminal {
                Terminal::Completed => {
                    record.status = RunStatus::Completed;
                    record.progress = 1.0;
                    record.current_step_label = "Completed".to_string();
                }
                Terminal::Interrupted(reason) => {
                    record.status = RunStatus::Interrupted;
                    record.current_step_label = format!("Interrupted: {reason}");
                }
                Terminal::Error(message) => {
                    record.status = RunStatus::Failed;
                    record.current_step_label = format!("Failed: {message}");
                }
            }
            (record.words_generated, record.tokens_used)
        };

        let event = match terminal {
            Terminal::Completed => RunEvent::Completed {
                run_id: self.run_id.clone(),
                total_words,
                total_tokens,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
            Terminal::Interrupted(reason) => {
                info!(run_id = %self.run_id, reason = %reason, "Run interrupted");
                RunEvent::Interrupted {
                    run_id: self.run_id.clone(),
                    reason,
                }
            }
            Terminal::Error(message) => {
                warn!(run_id = %self.run_id, error = %message, "Run failed");
                RunEvent::Error {
                    run_id: self.run_id.clone(),
                    message,
                }
            }
        };
        self.emit(event).await;
    }

    /// Consume the worker stream until a terminal condition.
    async fn drive(&self, deadline: tokio::time::Instant) -> Terminal {
        let request = self.build_request();

        let invocation = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Terminal::Interrupted("cancelled".into()),
            result = self.worker.invoke(request) => result,
        };

        let mut stream = match invocation {
            Ok(s) => s,
            Err(e) => return Terminal::Error(e.to_string()),
        };

        {
            let mut record = self.record.lock().unwrap();
            record.status = RunStatus::Running;
            record.current_step_label = format!("Executing: {}", self.spec.task);
        }

        loop {
            let delta = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Terminal::Interrupted("cancelled".into());
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Terminal::Interrupted(format!(
                        "timeout after {}s",
                        self.timeout.as_secs()
                    ));
                }
                delta = stream.next() => delta,
            };

            match delta {
                Some(Ok(WorkerDelta::Text(content))) => {
                    let word_count = content.split_whitespace().count() as u64;
                    let progress = {
                        let mut record = self.record.lock().unwrap();
                        record.words_generated += word_count;
                        record.last_activity = Utc::now();
                        record.progress = (record.words_generated as f64
                            / PROGRESS_SATURATION_WORDS as f64)
                            .min(0.9);
                        record.progress
                    };
                    if !self
                        .send(RunEvent::TextChunk {
                            run_id: self.run_id.clone(),
                            content,
                            word_count,
                            progress,
                        })
                        .await
                    {
                        return Terminal::Interrupted("cancelled".into());
                    }
                }
                Some(Ok(WorkerDelta::ToolUse { name, input })) => {
                    {
                        let mut record = self.record.lock().unwrap();
                        record.tool_calls += 1;
                        record.last_activity = Utc::now();
                        record.current_step_label = format!("Using tool: {name}");
                    }
                    if !self
                        .send(RunEvent::ToolUse {
                            run_id: self.run_id.clone(),
                            name,
                            input,
                        })
                        .await
                    {
                        return Terminal::Interrupted("cancelled".into());
                    }
                }
                Some(Ok(WorkerDelta::Usage { tokens })) => {
                    let mut record = self.record.lock().unwrap();
                    record.tokens_used += tokens;
                    record.last_activity = Utc::now();
                }
                Some(Err(e)) => return Terminal::Error(e.to_string()),
                None => return Terminal::Completed,
            }
        }
    }

    fn build_request(&self) -> WorkerRequest {
        let profile = self.spec.worker_type.profile();
        WorkerRequest {
            system_prompt: profile.system_prompt.to_string(),
            prompt: self.spec.prompt.clone(),
            allowed_capabilities: profile.capabilities.iter().map(|c| c.to_string()).collect(),
            max_turns: profile.max_turns,
        }
    }

    /// Send on the bounded channel, backing off to cancellation. Returns
    /// false when the run was cancelled mid-send or the consumer went away.
    async fn send(&self, event: RunEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    /// Send ignoring cancellation (used for terminal events, which must be
    /// delivered even to a cancelled run's stream).
    async fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event).await;
    }
}
