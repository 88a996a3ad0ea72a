//! Registry mapping factory keys to job constructors.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::data::Data;
use crate::error::{JobError, SchedError, SchedResult};
use crate::job::{Job, JobRecord, Parameters};

/// Rebuilds a job from its persisted parameters and payload.
pub trait JobFactory: Send + Sync {
    fn create(&self, parameters: Parameters, data: &Data) -> Result<Arc<dyn Job>, JobError>;
}

impl<F> JobFactory for F
where
    F: Fn(Parameters, &Data) -> Result<Arc<dyn Job>, JobError> + Send + Sync,
{
    fn create(&self, parameters: Parameters, data: &Data) -> Result<Arc<dyn Job>, JobError> {
        self(parameters, data)
    }
}

/// Reason a record could not be turned back into a job.
#[derive(Debug)]
pub enum ReconstructError {
    /// No factory is registered for the key.
    UnknownFactory(String),

    /// The factory refused the payload.
    Rejected(JobError),
}

impl From<ReconstructError> for SchedError {
    fn from(e: ReconstructError) -> Self {
        match e {
            ReconstructError::UnknownFactory(key) => SchedError::UnknownFactory(key),
            ReconstructError::Rejected(err) => SchedError::PersistenceError(err.to_string()),
        }
    }
}

/// Factories keyed by the stable string every job reports from `factory_key`.
#[derive(Default, Clone)]
pub struct FactoryRegistry {
    factories: FxHashMap<String, Arc<dyn JobFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A later registration for the same key replaces the
    /// earlier one.
    pub fn register(&mut self, factory_key: impl Into<String>, factory: impl JobFactory + 'static) {
        let factory_key = factory_key.into();
        if self
            .factories
            .insert(factory_key.clone(), Arc::new(factory))
            .is_some()
        {
            tracing::warn!(factory_key = %factory_key, "Replacing previously registered factory");
        }
    }

    /// Whether a factory is registered for the key.
    pub fn contains(&self, factory_key: &str) -> bool {
        self.factories.contains_key(factory_key)
    }

    /// Rebuild a job from raw parts.
    pub fn create(
        &self,
        factory_key: &str,
        parameters: Parameters,
        data: &Data,
    ) -> Result<Arc<dyn Job>, ReconstructError> {
        let factory = self
            .factories
            .get(factory_key)
            .ok_or_else(|| ReconstructError::UnknownFactory(factory_key.to_string()))?;
        factory
            .create(parameters, data)
            .map_err(ReconstructError::Rejected)
    }

    /// Rebuild the job a persisted record describes.
    pub fn reconstruct(&self, record: &JobRecord) -> Result<Arc<dyn Job>, ReconstructError> {
        self.create(&record.factory_key, record.parameters(), &record.payload)
    }

    /// Check that a key is known, as a `SchedResult`.
    pub fn require(&self, factory_key: &str) -> SchedResult<()> {
        if self.contains(factory_key) {
            Ok(())
        } else {
            Err(SchedError::UnknownFactory(factory_key.to_string()))
        }
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("FactoryRegistry").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobContext, JobId};
    use async_trait::async_trait;

    struct ProfileFetchJob {
        address: String,
    }

    #[async_trait]
    impl Job for ProfileFetchJob {
        fn factory_key(&self) -> &str {
            "ProfileFetchJob"
        }

        fn serialize(&self) -> Data {
            Data::builder().put_string("address", &self.address).build()
        }

        async fn on_run(&self, _ctx: &JobContext) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn registry() -> FactoryRegistry {
        let mut registry = FactoryRegistry::new();
        registry.register(
            "ProfileFetchJob",
            |_params: Parameters, data: &Data| -> Result<Arc<dyn Job>, JobError> {
                Ok(Arc::new(ProfileFetchJob {
                    address: data.get_string("address")?,
                }))
            },
        );
        registry
    }

    #[test]
    fn test_reconstruct() {
        let registry = registry();
        let job = ProfileFetchJob {
            address: "alice".to_string(),
        };
        let record = JobRecord::new(
            JobId::new(),
            0,
            job.factory_key(),
            &Parameters::new(),
            job.serialize(),
        );

        let rebuilt = registry.reconstruct(&record).unwrap();
        assert_eq!(rebuilt.factory_key(), "ProfileFetchJob");
        assert_eq!(rebuilt.serialize(), record.payload);
    }

    #[test]
    fn test_unknown_factory() {
        let registry = registry();
        let record = JobRecord::new(JobId::new(), 0, "Gone", &Parameters::new(), Data::empty());
        let err = registry.reconstruct(&record).err().unwrap();
        assert!(matches!(err, ReconstructError::UnknownFactory(ref k) if k == "Gone"));
        assert!(matches!(
            SchedError::from(err),
            SchedError::UnknownFactory(_)
        ));
        assert!(registry.require("Gone").is_err());
        assert!(registry.require("ProfileFetchJob").is_ok());
    }

    #[test]
    fn test_malformed_payload() {
        let registry = registry();
        let record = JobRecord::new(
            JobId::new(),
            0,
            "ProfileFetchJob",
            &Parameters::new(),
            Data::empty(),
        );
        let err = registry.reconstruct(&record).err().unwrap();
        assert!(matches!(err, ReconstructError::Rejected(JobError::Data(_))));
    }
}
