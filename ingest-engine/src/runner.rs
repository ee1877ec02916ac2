use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::{debug, info};

use crate::error::{IngestError, PrimitiveError, Result};
use crate::primitives::PipelineDescription;
use crate::proto::runner::{
    core_client::CoreClient, value, EndSearchSolutionsRequest, FitSolutionRequest,
    GetFitSolutionResultsRequest, GetProduceSolutionResultsRequest,
    GetScoreSolutionResultsRequest, GetSearchSolutionsResultsRequest, PipelineOutput, Primitive,
    PrimitiveStep, ProblemDescription, ProduceSolutionRequest, ProgressState,
    ScoreSolutionRequest, SearchSolutionsRequest, StepInput, StepOutput, Value, ValueType,
};

const USER_AGENT: &str = "d3m-ingest";
const API_VERSION: &str = "2019.6.11";
pub const OUTPUT_NAME: &str = "outputs.0";

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub pipeline: PipelineDescription,
    pub dataset_uri: String,
    pub time_bound_minutes: f64,
}

/// Operations of the external pipeline runner used by the dispatcher.
#[async_trait]
pub trait SolutionRunner: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Starts a search and returns its id.
    async fn search_solutions(&self, request: SearchRequest) -> Result<String>;

    /// Solution ids found by a search, in discovery order.
    async fn solution_ids(&self, search_id: &str) -> Result<BoxStream<'static, Result<String>>>;

    /// Fits a solution and returns the fitted solution id.
    async fn fit(&self, solution_id: &str, dataset_uri: &str) -> Result<String>;

    async fn score(
        &self,
        solution_id: &str,
        dataset_uri: &str,
        metrics: &[String],
    ) -> Result<Vec<(String, f64)>>;

    /// Produces on `dataset_uri` and returns the exposed CSV uri.
    async fn produce(&self, fitted_solution_id: &str, dataset_uri: &str) -> Result<String>;

    async fn end_search(&self, search_id: &str) -> Result<()>;
}

/// gRPC client for a TA2 style pipeline runner.
#[derive(Debug, Clone)]
pub struct GrpcRunner {
    client: CoreClient<Channel>,
    endpoint: String,
}

impl GrpcRunner {
    pub async fn connect(endpoint: String) -> Result<Self> {
        info!("Connecting to pipeline runner at {}", endpoint);

        let client = CoreClient::connect(endpoint.clone()).await.map_err(|e| {
            PrimitiveError::RunnerUnreachable {
                endpoint: endpoint.clone(),
                message: e.to_string(),
            }
        })?;

        info!("Successfully connected to pipeline runner");
        Ok(Self { client, endpoint })
    }

    /// Defers connecting until the first call.
    pub fn connect_lazy(endpoint: String) -> Result<Self> {
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| IngestError::ConfigError {
                message: format!("Invalid runner endpoint {}: {}", endpoint, e),
            })?
            .connect_lazy();
        Ok(Self {
            client: CoreClient::new(channel),
            endpoint,
        })
    }

    fn status_error(&self, operation: &str, status: tonic::Status) -> IngestError {
        map_status(&self.endpoint, operation, status)
    }
}

fn map_status(endpoint: &str, operation: &str, status: tonic::Status) -> IngestError {
    let message = format!("{}: {}", operation, status.message());
    match status.code() {
        Code::Unavailable => PrimitiveError::RunnerUnreachable {
            endpoint: endpoint.to_string(),
            message,
        }
        .into(),
        Code::InvalidArgument | Code::FailedPrecondition | Code::NotFound => {
            PrimitiveError::BadRequest { message }.into()
        }
        Code::DeadlineExceeded => PrimitiveError::Timeout {
            operation: operation.to_string(),
            seconds: 0,
        }
        .into(),
        Code::Cancelled => IngestError::Canceled {
            operation: operation.to_string(),
        },
        _ => PrimitiveError::ExecutionFailed { message }.into(),
    }
}

fn dataset_value(uri: &str) -> Value {
    Value {
        value: Some(value::Value::DatasetUri(uri.to_string())),
    }
}

fn template(pipeline: &PipelineDescription) -> crate::proto::runner::PipelineDescription {
    let steps = pipeline
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| PrimitiveStep {
            primitive: Some(Primitive {
                id: step.primitive.python_path.clone(),
                version: step.primitive.version.clone(),
                python_path: step.primitive.python_path.clone(),
                name: step.primitive.name.clone(),
            }),
            arguments: vec![StepInput {
                name: "inputs".to_string(),
                data: PipelineDescription::step_input(i),
            }],
            outputs: vec![StepOutput {
                id: "produce".to_string(),
            }],
            hyperparams: step.hyperparams.clone().into_iter().collect(),
        })
        .collect();

    crate::proto::runner::PipelineDescription {
        id: pipeline.id.clone(),
        name: pipeline.name.clone(),
        description: pipeline.description.clone(),
        inputs: vec!["inputs.0".to_string()],
        outputs: vec![PipelineOutput {
            name: OUTPUT_NAME.to_string(),
            data: pipeline.output_reference(),
        }],
        steps,
    }
}

fn errored(progress: Option<&crate::proto::runner::Progress>) -> Option<String> {
    progress
        .filter(|p| p.state() == ProgressState::Errored)
        .map(|p| p.status.clone())
}

fn completed(progress: Option<&crate::proto::runner::Progress>) -> bool {
    progress
        .map(|p| p.state() == ProgressState::Completed)
        .unwrap_or(false)
}

#[async_trait]
impl SolutionRunner for GrpcRunner {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn search_solutions(&self, request: SearchRequest) -> Result<String> {
        debug!(
            "Searching solutions for {} on {}",
            request.pipeline.name, request.dataset_uri
        );
        let message = SearchSolutionsRequest {
            user_agent: USER_AGENT.to_string(),
            version: API_VERSION.to_string(),
            time_bound_search: request.time_bound_minutes,
            allowed_value_types: vec![ValueType::DatasetUri as i32, ValueType::CsvUri as i32],
            problem: Some(ProblemDescription {
                id: request.pipeline.id.clone(),
                task_type: request.pipeline.name.clone(),
                target_columns: Vec::new(),
            }),
            template: Some(template(&request.pipeline)),
            inputs: vec![dataset_value(&request.dataset_uri)],
        };

        let mut client = self.client.clone();
        let response = client
            .search_solutions(tonic::Request::new(message))
            .await
            .map_err(|e| self.status_error("SearchSolutions", e))?;
        Ok(response.into_inner().search_id)
    }

    async fn solution_ids(&self, search_id: &str) -> Result<BoxStream<'static, Result<String>>> {
        let mut client = self.client.clone();
        let stream = client
            .get_search_solutions_results(tonic::Request::new(GetSearchSolutionsResultsRequest {
                search_id: search_id.to_string(),
            }))
            .await
            .map_err(|e| self.status_error("GetSearchSolutionsResults", e))?
            .into_inner();

        let endpoint = self.endpoint.clone();
        let ids = stream.filter_map(move |item| {
            let endpoint = endpoint.clone();
            async move {
                match item {
                    Ok(response) => {
                        if let Some(status) = errored(response.progress.as_ref()) {
                            return Some(Err(PrimitiveError::ExecutionFailed {
                                message: format!("search failed: {}", status),
                            }
                            .into()));
                        }
                        if response.solution_id.is_empty() {
                            None
                        } else {
                            Some(Ok(response.solution_id))
                        }
                    }
                    Err(status) => Some(Err(map_status(
                        &endpoint,
                        "GetSearchSolutionsResults",
                        status,
                    ))),
                }
            }
        });
        Ok(ids.boxed())
    }

    async fn fit(&self, solution_id: &str, dataset_uri: &str) -> Result<String> {
        let mut client = self.client.clone();
        let request_id = client
            .fit_solution(tonic::Request::new(FitSolutionRequest {
                solution_id: solution_id.to_string(),
                inputs: vec![dataset_value(dataset_uri)],
                expose_outputs: Vec::new(),
                expose_value_types: vec![ValueType::CsvUri as i32],
            }))
            .await
            .map_err(|e| self.status_error("FitSolution", e))?
            .into_inner()
            .request_id;

        let mut stream = client
            .get_fit_solution_results(tonic::Request::new(GetFitSolutionResultsRequest {
                request_id,
            }))
            .await
            .map_err(|e| self.status_error("GetFitSolutionResults", e))?
            .into_inner();

        while let Some(response) = stream
            .message()
            .await
            .map_err(|e| self.status_error("GetFitSolutionResults", e))?
        {
            if let Some(status) = errored(response.progress.as_ref()) {
                return Err(PrimitiveError::ExecutionFailed {
                    message: format!("fit of {} failed: {}", solution_id, status),
                }
                .into());
            }
            if completed(response.progress.as_ref()) {
                return Ok(response.fitted_solution_id);
            }
        }

        Err(PrimitiveError::ExecutionFailed {
            message: format!("fit of {} ended without completing", solution_id),
        }
        .into())
    }

    async fn score(
        &self,
        solution_id: &str,
        dataset_uri: &str,
        metrics: &[String],
    ) -> Result<Vec<(String, f64)>> {
        let mut client = self.client.clone();
        let request_id = client
            .score_solution(tonic::Request::new(ScoreSolutionRequest {
                solution_id: solution_id.to_string(),
                inputs: vec![dataset_value(dataset_uri)],
                metrics: metrics.to_vec(),
            }))
            .await
            .map_err(|e| self.status_error("ScoreSolution", e))?
            .into_inner()
            .request_id;

        let mut stream = client
            .get_score_solution_results(tonic::Request::new(GetScoreSolutionResultsRequest {
                request_id,
            }))
            .await
            .map_err(|e| self.status_error("GetScoreSolutionResults", e))?
            .into_inner();

        let mut scores = Vec::new();
        while let Some(response) = stream
            .message()
            .await
            .map_err(|e| self.status_error("GetScoreSolutionResults", e))?
        {
            if let Some(status) = errored(response.progress.as_ref()) {
                return Err(PrimitiveError::ExecutionFailed {
                    message: format!("scoring of {} failed: {}", solution_id, status),
                }
                .into());
            }
            scores.extend(response.scores.into_iter().map(|s| (s.metric, s.value)));
        }
        Ok(scores)
    }

    async fn produce(&self, fitted_solution_id: &str, dataset_uri: &str) -> Result<String> {
        let mut client = self.client.clone();
        let request_id = client
            .produce_solution(tonic::Request::new(ProduceSolutionRequest {
                fitted_solution_id: fitted_solution_id.to_string(),
                inputs: vec![dataset_value(dataset_uri)],
                expose_outputs: vec![OUTPUT_NAME.to_string()],
                expose_value_types: vec![ValueType::CsvUri as i32],
            }))
            .await
            .map_err(|e| self.status_error("ProduceSolution", e))?
            .into_inner()
            .request_id;

        let mut stream = client
            .get_produce_solution_results(tonic::Request::new(GetProduceSolutionResultsRequest {
                request_id,
            }))
            .await
            .map_err(|e| self.status_error("GetProduceSolutionResults", e))?
            .into_inner();

        while let Some(response) = stream
            .message()
            .await
            .map_err(|e| self.status_error("GetProduceSolutionResults", e))?
        {
            if let Some(status) = errored(response.progress.as_ref()) {
                return Err(PrimitiveError::ExecutionFailed {
                    message: format!("produce of {} failed: {}", fitted_solution_id, status),
                }
                .into());
            }
            if !completed(response.progress.as_ref()) {
                continue;
            }
            return match response
                .exposed_outputs
                .get(OUTPUT_NAME)
                .and_then(|v| v.value.clone())
            {
                Some(value::Value::CsvUri(uri)) => Ok(uri),
                Some(value::Value::Error(error)) => Err(PrimitiveError::ExecutionFailed {
                    message: error.message,
                }
                .into()),
                _ => Err(PrimitiveError::NoOutputExposed {
                    solution_id: fitted_solution_id.to_string(),
                }
                .into()),
            };
        }

        Err(PrimitiveError::NoOutputExposed {
            solution_id: fitted_solution_id.to_string(),
        }
        .into())
    }

    async fn end_search(&self, search_id: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .end_search_solutions(tonic::Request::new(EndSearchSolutionsRequest {
                search_id: search_id.to_string(),
            }))
            .await
            .map_err(|e| self.status_error("EndSearchSolutions", e))?;
        Ok(())
    }
}
