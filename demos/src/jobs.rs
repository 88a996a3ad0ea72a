//! A simulated unit of work used by every demo.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use relay_jobs::{Data, Job, JobContext, JobError, Parameters};

/// Sleeps for `work_ms`, then fails transiently with probability
/// `failure_rate` or succeeds.
#[derive(Debug, Clone)]
pub struct SimulatedStep {
    name: String,
    work_ms: u64,
    failure_rate: f64,
    fatal: bool,
    parameters: Parameters,
}

impl SimulatedStep {
    pub const FACTORY_KEY: &'static str = "SimulatedStep";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            work_ms: 50,
            failure_rate: 0.0,
            fatal: false,
            parameters: Parameters::new(),
        }
    }

    pub fn with_work(mut self, work_ms: u64) -> Self {
        self.work_ms = work_ms;
        self
    }

    /// Probability of a transient failure per attempt, clamped to `[0, 1]`.
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    /// Fail every attempt with a non-retryable error.
    pub fn always_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shared(self) -> Arc<dyn Job> {
        Arc::new(self)
    }

    /// Rebuild a step from its payload.
    pub fn factory(parameters: Parameters, data: &Data) -> Result<Arc<dyn Job>, JobError> {
        let step = SimulatedStep {
            name: data.get_string("name")?,
            work_ms: u64::try_from(data.get_long_or("work_ms", 50)?).unwrap_or_default(),
            failure_rate: data.get_double_or("failure_rate", 0.0)?,
            fatal: data.get_bool_or("fatal", false)?,
            parameters,
        };
        Ok(Arc::new(step))
    }
}

#[async_trait]
impl Job for SimulatedStep {
    fn factory_key(&self) -> &str {
        Self::FACTORY_KEY
    }

    fn parameters(&self) -> Parameters {
        self.parameters.clone()
    }

    fn serialize(&self) -> Data {
        Data::builder()
            .put_string("name", self.name.as_str())
            .put_long("work_ms", i64::try_from(self.work_ms).unwrap_or(i64::MAX))
            .put_double("failure_rate", self.failure_rate)
            .put_bool("fatal", self.fatal)
            .build()
    }

    async fn on_run(&self, ctx: &JobContext) -> Result<(), JobError> {
        tracing::info!(step = %self.name, attempt = ctx.attempt(), "Working");

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.work_ms)) => {}
            _ = ctx.canceled() => return Err(JobError::Canceled),
        }

        if self.fatal {
            return Err(JobError::fatal(format!("{} rejected by server", self.name)));
        }
        let failed = rand::thread_rng().gen_bool(self.failure_rate.clamp(0.0, 1.0));
        if failed {
            return Err(JobError::retry(format!("{}: simulated network error", self.name)));
        }
        Ok(())
    }

    async fn on_failure(&self) {
        tracing::warn!(step = %self.name, "Step failed permanently");
    }
}
