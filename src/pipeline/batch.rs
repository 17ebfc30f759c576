//! Batch coordination: fan a list of independent requests through the
//! pipeline under a shared concurrency cap.
//!
//! Each slot in the output is an independent success-or-failure record, in
//! the same position as its input; internal completion order never reorders
//! results and no element is dropped. The optional whole-batch deadline is
//! an absolute instant shared by every element, so an element's effective
//! deadline is the smaller of its own backend budget and what remains of
//! the batch's.

use std::{sync::Arc, time::Duration};

use tokio::sync::Semaphore;

use crate::{
    api_types::{GenerateResponse, GenerationRequest},
    config::BatchConfig,
    error::GatewayError,
    pipeline::RequestPipeline,
};

pub struct BatchCoordinator {
    pipeline: Arc<RequestPipeline>,
    semaphore: Arc<Semaphore>,
    max_size: usize,
    deadline: Option<Duration>,
}

impl BatchCoordinator {
    pub fn new(pipeline: Arc<RequestPipeline>, config: &BatchConfig) -> Self {
        Self {
            pipeline,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            max_size: config.max_size,
            deadline: config.deadline_secs.map(Duration::from_secs),
        }
    }

    /// Dispatch every request, bounded by the shared semaphore. The returned
    /// vector is positionally aligned with the input.
    pub async fn execute(
        &self,
        requests: Vec<GenerationRequest>,
    ) -> Result<Vec<Result<GenerateResponse, GatewayError>>, GatewayError> {
        if requests.is_empty() {
            return Err(GatewayError::Validation(
                "batch contains no requests".to_string(),
            ));
        }
        if requests.len() > self.max_size {
            return Err(GatewayError::Validation(format!(
                "batch size {} exceeds the maximum of {}",
                requests.len(),
                self.max_size
            )));
        }

        tracing::debug!(batch_size = requests.len(), "Dispatching batch");

        // All element futures start now, so one timeout per element measures
        // from the same instant: an absolute whole-batch deadline.
        let tasks = requests.into_iter().map(|request| {
            let pipeline = Arc::clone(&self.pipeline);
            let semaphore = Arc::clone(&self.semaphore);
            let deadline = self.deadline;

            async move {
                let run = async {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|_| GatewayError::Internal("batch semaphore closed".into()))?;
                    pipeline.execute(request).await
                };

                match deadline {
                    Some(deadline) => match tokio::time::timeout(deadline, run).await {
                        Ok(result) => result,
                        Err(_) => Err(GatewayError::Timeout { stage: "batch" }),
                    },
                    None => run.await,
                }
            }
        });

        Ok(futures::future::join_all(tasks).await)
    }
}
