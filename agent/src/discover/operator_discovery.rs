use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use url::Url;

use common::error::{Error, Result};

use crate::discover::discover::{Arguments, Discoverer, RawTarget, TargetGroup};
use crate::http::{HttpClient, HttpRequest};

const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Asks the coordinator for the current members of a job:
/// `GET /jobs/<job>/targets?collector_id=<id>`.
pub struct OperatorDiscovery {
    args: Arguments,
    client: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl OperatorDiscovery {
    pub fn new(args: Arguments, client: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        Self {
            args,
            client,
            timeout: timeout.max(MIN_TIMEOUT),
        }
    }

    pub fn request(&self, job_name: &str) -> Result<HttpRequest> {
        if !self.args.is_configured() {
            return Err(Error::InvalidConfig(
                "coordinator address is not configured".to_string(),
            ));
        }
        // only used to escape the job name and the query
        let mut url = Url::parse("http://coordinator/")
            .map_err(|e| Error::InvalidData(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidData("cannot build discovery path".to_string()))?
            .clear()
            .push("jobs")
            .push(job_name)
            .push("targets");
        url.query_pairs_mut()
            .append_pair("collector_id", &self.args.collector_id);

        Ok(HttpRequest::get(
            self.args.operator_host.clone(),
            self.args.operator_port,
            url.path(),
        )
        .with_query(url.query().unwrap_or_default())
        .with_header("Accept", "application/json")
        .with_timeout(self.timeout))
    }
}

pub fn decode_target_groups(body: &[u8]) -> Result<Vec<RawTarget>> {
    let groups: Vec<TargetGroup> = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidData(format!("malformed discovery response: {}", e)))?;
    Ok(groups
        .into_iter()
        .flat_map(TargetGroup::into_raw_targets)
        .collect())
}

#[async_trait]
impl Discoverer for OperatorDiscovery {
    async fn refresh(&self, job_name: &str) -> Result<Vec<RawTarget>> {
        let request = self.request(job_name)?;
        let url = request.url();
        let resp = self.client.send(request).await?;
        if resp.status != 200 {
            return Err(Error::UnexpectedStatus {
                status: resp.status,
                url,
            });
        }
        let targets = decode_target_groups(&resp.body)?;
        debug!("discovered {} targets for job {}", targets.len(), job_name);
        Ok(targets)
    }
}
