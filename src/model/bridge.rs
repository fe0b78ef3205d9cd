//! Runs one generation on a blocking worker and drains its streamed
//! fragments on the request task.

use std::{sync::Arc, time::Instant};

use tokio::{sync::mpsc, task, time};
use tracing::{debug, warn};

use crate::{
    error::ServiceError,
    model::{
        GenerationOutcome, GenerationParams, InferenceRequest, StreamEvent, StreamSink,
        VisionLanguageModel,
    },
};

/// Worker side of the fragment channel.
struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl StreamSink for ChannelSink {
    fn started(&mut self) -> bool {
        self.tx.blocking_send(StreamEvent::Started).is_ok()
    }

    fn fragment(&mut self, text: String) -> bool {
        self.tx.blocking_send(StreamEvent::Fragment(text)).is_ok()
    }
}

/// Waits until the worker signals completion, fails, or stays silent for
/// longer than `params.token_timeout` once it has started. Time spent waiting
/// for the model to become free does not count against the timeout. The
/// worker is always awaited before returning.
pub async fn generate(
    model: Arc<dyn VisionLanguageModel>,
    request: InferenceRequest,
    params: &GenerationParams,
) -> Result<GenerationOutcome, ServiceError> {
    let start = Instant::now();
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(params.stream_capacity);
    let worker_params = params.clone();

    let worker = task::spawn_blocking(move || {
        let mut sink = ChannelSink { tx };
        let event = match model.generate_stream(&request, &worker_params, &mut sink) {
            Ok(()) => StreamEvent::Finished,
            Err(err) => StreamEvent::Failed(err),
        };
        // the receiver is gone after a timeout
        let _ = sink.tx.blocking_send(event);
    });

    let mut text = String::new();
    let mut fragments = 0usize;
    let mut started = false;
    let mut timed_out = false;
    let mut failure = None;

    loop {
        let next = if started {
            match time::timeout(params.token_timeout, rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        timeout_secs = params.token_timeout.as_secs_f64(),
                        fragments, "generation stream stalled, returning partial output"
                    );
                    timed_out = true;
                    break;
                }
            }
        } else {
            rx.recv().await
        };

        match next {
            Some(StreamEvent::Started) => started = true,
            Some(StreamEvent::Fragment(fragment)) => {
                started = true;
                fragments += 1;
                text.push_str(&fragment);
            }
            Some(StreamEvent::Finished) => break,
            Some(StreamEvent::Failed(err)) => {
                failure = Some(err);
                break;
            }
            None => break,
        }
    }

    // Closing the receiver makes the worker's next send fail, which stops it.
    drop(rx);
    let joined = worker.await;

    if let Some(err) = failure {
        return Err(err);
    }
    if let Err(err) = joined {
        if err.is_panic() {
            return Err(ServiceError::WorkerPanicked);
        }
        return Err(ServiceError::Inference(format!("generation worker failed: {err}")));
    }

    let elapsed = start.elapsed();
    debug!(fragments, elapsed_ms = elapsed.as_millis() as u64, "generation finished");

    Ok(GenerationOutcome {
        text,
        fragments,
        timed_out,
        elapsed,
    })
}
