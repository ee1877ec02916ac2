use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{IngestError, PrimitiveError, Result};
use crate::metadata::SCHEMA_FILE_NAME;
use crate::primitives::PipelineDescription;
use crate::runner::{SearchRequest, SolutionRunner};
use crate::split;

pub const DEFAULT_RUNNER_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_TIME_BOUND_MINUTES: f64 = 10.0;

/// Progress events published by a solution task.
#[derive(Debug)]
pub enum SolutionStatus {
    Fitted {
        solution_id: String,
        fitted_solution_id: String,
    },
    Scored {
        solution_id: String,
        scores: Vec<(String, f64)>,
    },
    Produced {
        solution_id: String,
        csv_uri: String,
    },
    Failed {
        solution_id: String,
        error: IngestError,
    },
}

#[derive(Debug, Clone)]
struct SolutionPlan {
    fit_uri: String,
    produce_uri: String,
    score_uri: Option<String>,
    metrics: Vec<String>,
}

/// Runs primitive pipelines on the external runner and hands back the
/// produced CSV as a local path.
#[derive(Clone)]
pub struct PrimitiveDispatcher {
    runner: Arc<dyn SolutionRunner>,
    timeout: Duration,
    time_bound_minutes: f64,
    cancel: CancellationToken,
}

impl PrimitiveDispatcher {
    pub fn new(runner: Arc<dyn SolutionRunner>) -> Self {
        Self {
            runner,
            timeout: DEFAULT_RUNNER_TIMEOUT,
            time_bound_minutes: DEFAULT_TIME_BOUND_MINUTES,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn endpoint(&self) -> &str {
        self.runner.endpoint()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fits and produces `pipeline` on the full dataset in `dataset_folder`.
    /// Used by steps that rewrite the dataset rather than predict on it.
    pub async fn submit(&self, pipeline: &PipelineDescription, dataset_folder: &Path) -> Result<PathBuf> {
        let uri = dataset_uri(dataset_folder)?;
        let plan = SolutionPlan {
            fit_uri: uri.clone(),
            produce_uri: uri,
            score_uri: None,
            metrics: Vec::new(),
        };
        self.execute(pipeline, plan).await
    }

    /// Fits on a train split, scores and produces on the test split. The
    /// split is created under `split_root` unless it already exists there.
    pub async fn submit_predictive(
        &self,
        pipeline: &PipelineDescription,
        dataset_folder: &Path,
        split_root: &Path,
        metrics: &[String],
    ) -> Result<PathBuf> {
        let (train, test) = split::persist_original_data(dataset_folder, split_root)?;
        let test_uri = dataset_uri(&test)?;
        let plan = SolutionPlan {
            fit_uri: dataset_uri(&train)?,
            produce_uri: test_uri.clone(),
            score_uri: (!metrics.is_empty()).then_some(test_uri),
            metrics: metrics.to_vec(),
        };
        self.execute(pipeline, plan).await
    }

    async fn execute(&self, pipeline: &PipelineDescription, plan: SolutionPlan) -> Result<PathBuf> {
        info!(
            "Submitting pipeline {} ({}) to {}",
            pipeline.name,
            pipeline.primitive().unwrap_or_default(),
            self.runner.endpoint()
        );

        let request = SearchRequest {
            pipeline: pipeline.clone(),
            dataset_uri: plan.fit_uri.clone(),
            time_bound_minutes: self.time_bound_minutes,
        };
        let search_id = self
            .guard("SearchSolutions", self.runner.search_solutions(request))
            .await?;
        debug!("Search {} started", search_id);

        let outcome = self
            .guard("GetSearchSolutionsResults", self.collect(&search_id, plan))
            .await;

        if let Err(e) = self
            .guard("EndSearchSolutions", self.runner.end_search(&search_id))
            .await
        {
            warn!("Failed to end search {}: {}", search_id, e);
        }

        let csv_uri = outcome?;
        let path = result_path(&csv_uri)?;
        info!("Pipeline {} produced {}", pipeline.name, path.display());
        Ok(path)
    }

    /// Spawns one task per solution id as the runner reports it and returns
    /// the first produced output. Remaining tasks are stopped and joined
    /// before returning.
    async fn collect(&self, search_id: &str, plan: SolutionPlan) -> Result<String> {
        let stop = self.cancel.child_token();
        let _stop_guard = stop.clone().drop_guard();

        let mut solution_ids = self.runner.solution_ids(search_id).await?;
        let mut handles = Vec::new();
        let mut statuses = stream::SelectAll::new();
        let mut searching = true;
        let mut produced = None;
        let mut first_failure = None;

        loop {
            tokio::select! {
                next = solution_ids.next(), if searching => match next {
                    Some(solution_id) => {
                        let solution_id = solution_id?;
                        debug!("Search {} found solution {}", search_id, solution_id);

                        let (tx, rx) = mpsc::channel(1);
                        let runner = Arc::clone(&self.runner);
                        let plan = plan.clone();
                        let token = stop.clone();
                        handles.push(tokio::spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {}
                                _ = run_solution(runner, solution_id, plan, tx) => {}
                            }
                        }));
                        statuses.push(ReceiverStream::new(rx));
                    }
                    None => searching = false,
                },
                status = statuses.next(), if !statuses.is_empty() => match status {
                    Some(SolutionStatus::Fitted {
                        solution_id,
                        fitted_solution_id,
                    }) => debug!("Solution {} fitted as {}", solution_id, fitted_solution_id),
                    Some(SolutionStatus::Scored {
                        solution_id,
                        scores,
                    }) => info!("Solution {} scored {:?}", solution_id, scores),
                    Some(SolutionStatus::Produced {
                        solution_id,
                        csv_uri,
                    }) => {
                        debug!("Solution {} produced {}", solution_id, csv_uri);
                        produced = Some(csv_uri);
                        stop.cancel();
                        break;
                    }
                    Some(SolutionStatus::Failed { solution_id, error }) => {
                        warn!("Solution {} failed: {}", solution_id, error);
                        first_failure.get_or_insert(error);
                    }
                    None => {}
                },
                else => break,
            }
        }
        drop(statuses);

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Solution task for search {} panicked: {}", search_id, e);
            }
        }

        if self.cancel.is_cancelled() {
            return Err(IngestError::Canceled {
                operation: format!("search {}", search_id),
            });
        }

        match (produced, first_failure) {
            (Some(uri), _) => Ok(uri),
            (None, Some(error)) => Err(error),
            (None, None) => Err(PrimitiveError::NoOutputExposed {
                solution_id: search_id.to_string(),
            }
            .into()),
        }
    }

    /// Races `operation` against caller cancellation and the runner deadline.
    async fn guard<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(IngestError::Canceled {
                operation: operation.to_string(),
            }),
            result = tokio::time::timeout(self.timeout, future) => match result {
                Ok(result) => result,
                Err(_) => Err(PrimitiveError::Timeout {
                    operation: operation.to_string(),
                    seconds: self.timeout.as_secs(),
                }
                .into()),
            },
        }
    }
}

async fn run_solution(
    runner: Arc<dyn SolutionRunner>,
    solution_id: String,
    plan: SolutionPlan,
    tx: mpsc::Sender<SolutionStatus>,
) {
    let status = match solve(runner.as_ref(), &solution_id, &plan, &tx).await {
        Ok(csv_uri) => SolutionStatus::Produced {
            solution_id,
            csv_uri,
        },
        Err(error) => SolutionStatus::Failed { solution_id, error },
    };
    // Receiver is gone once another solution won.
    let _ = tx.send(status).await;
}

async fn solve(
    runner: &dyn SolutionRunner,
    solution_id: &str,
    plan: &SolutionPlan,
    tx: &mpsc::Sender<SolutionStatus>,
) -> Result<String> {
    let fitted_solution_id = runner.fit(solution_id, &plan.fit_uri).await?;
    let _ = tx
        .send(SolutionStatus::Fitted {
            solution_id: solution_id.to_string(),
            fitted_solution_id: fitted_solution_id.clone(),
        })
        .await;

    if let Some(score_uri) = &plan.score_uri {
        let scores = runner.score(solution_id, score_uri, &plan.metrics).await?;
        let _ = tx
            .send(SolutionStatus::Scored {
                solution_id: solution_id.to_string(),
                scores,
            })
            .await;
    }

    runner.produce(&fitted_solution_id, &plan.produce_uri).await
}

/// `file://` uri of the schema document in `dataset_folder`.
pub fn dataset_uri(dataset_folder: &Path) -> Result<String> {
    let schema_path = dataset_folder.join(SCHEMA_FILE_NAME);
    let schema_path = schema_path
        .canonicalize()
        .map_err(|e| IngestError::io(&schema_path, e))?;
    Url::from_file_path(&schema_path)
        .map(|url| url.to_string())
        .map_err(|_| IngestError::IoError {
            message: format!("cannot build uri for {}", schema_path.display()),
        })
}

/// Local path of a produced CSV. Accepts `file://` uris and absolute paths.
pub fn result_path(uri: &str) -> Result<PathBuf> {
    let malformed = || -> IngestError {
        PrimitiveError::MalformedResultUri {
            uri: uri.to_string(),
        }
        .into()
    };

    if uri.starts_with("file://") {
        let url = Url::parse(uri).map_err(|_| malformed())?;
        return url.to_file_path().map_err(|_| malformed());
    }

    let path = PathBuf::from(uri);
    if path.is_absolute() {
        Ok(path)
    } else {
        Err(malformed())
    }
}
