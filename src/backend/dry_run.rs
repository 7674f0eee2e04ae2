use async_trait::async_trait;
use std::time::Duration;

use super::{BackendClient, Failure, RawResponse};
use crate::model::{Strategy, Target};

/// Stands in for the configured backend during a dry run. No external effects.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunClient;

#[async_trait]
impl BackendClient for DryRunClient {
    fn name(&self) -> &'static str {
        "dry_run"
    }

    async fn measure(
        &self,
        _target: &Target,
        _strategy: Strategy,
        _timeout: Duration,
    ) -> Result<RawResponse, Failure> {
        Ok(RawResponse::DryRun)
    }
}
