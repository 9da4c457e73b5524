//! Shared test utilities: a scripted worker client and stream helpers.

use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{WorkerClient, WorkerDelta, WorkerRequest};

/// What a scripted worker does when invoked.
#[derive(Debug, Clone)]
pub enum WorkerScript {
    /// Emit the given text chunks (each followed by a usage delta), then end.
    Chunks {
        chunks: Vec<String>,
        tokens_per_chunk: u64,
        delay: Duration,
    },
    /// Fail the invocation immediately.
    FailsToStart { message: String },
    /// Emit one chunk, then error mid-stream.
    FailsMidStream { message: String },
    /// Never yield anything; only cancellation or timeout ends the run.
    Hangs,
}

impl WorkerScript {
    pub fn chunks(chunks: &[&str]) -> Self {
        Self::Chunks {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            tokens_per_chunk: 10,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        match self {
            Self::Chunks {
                chunks,
                tokens_per_chunk,
                ..
            } => Self::Chunks {
                chunks,
                tokens_per_chunk,
                delay,
            },
            other => other,
        }
    }
}

/// Scripted [`WorkerClient`] for tests.
///
/// Routes requests by substring match on the prompt; unmatched requests use
/// the default script. All received requests are recorded for assertions.
pub struct MockWorker {
    default: WorkerScript,
    routes: Vec<(String, WorkerScript)>,
    invocations: Mutex<Vec<WorkerRequest>>,
}

impl MockWorker {
    pub fn new(default: WorkerScript) -> Self {
        Self {
            default,
            routes: vec![],
            invocations: Mutex::new(vec![]),
        }
    }

    /// Use `script` for any request whose prompt contains `needle`.
    pub fn route(mut self, needle: impl Into<String>, script: WorkerScript) -> Self {
        self.routes.push((needle.into(), script));
        self
    }

    /// Requests received so far, in invocation order.
    pub fn invocations(&self) -> Vec<WorkerRequest> {
        self.invocations.lock().unwrap().clone()
    }

    fn script_for(&self, prompt: &str) -> WorkerScript {
        self.routes
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

impl WorkerClient for MockWorker {
    fn invoke(
        &self,
        request: WorkerRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<WorkerDelta>>>> {
        let script = self.script_for(&request.prompt);
        self.invocations.lock().unwrap().push(request);

        Box::pin(async move {
            match script {
                WorkerScript::FailsToStart { message } => Err(WeftError::Worker(message)),
                WorkerScript::Hangs => Ok(futures::stream::pending().boxed()),
                WorkerScript::FailsMidStream { message } => {
                    let deltas = vec![
                        Ok(WorkerDelta::Text("partial output".to_string())),
                        Err(WeftError::Stream(message)),
                    ];
                    Ok(futures::stream::iter(deltas).boxed())
                }
                WorkerScript::Chunks {
                    chunks,
                    tokens_per_chunk,
                    delay,
                } => {
                    let deltas: Vec<Result<WorkerDelta>> = chunks
                        .into_iter()
                        .flat_map(|c| {
                            [
                                Ok(WorkerDelta::Text(c)),
                                Ok(WorkerDelta::Usage {
                                    tokens: tokens_per_chunk,
                                }),
                            ]
                        })
                        .collect();
                    let stream = futures::stream::iter(deltas)
                        .then(move |d| async move {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            d
                        })
                        .boxed();
                    Ok(stream)
                }
            }
        })
    }
}
