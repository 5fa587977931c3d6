//! Outbound postback delivery with fixed-delay retry.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};
use trialgate_core::{ConversionStatus, RetryPolicy};

/// Destination for conversion postbacks.
pub trait PostbackSink {
    /// Delivers one postback, retrying internally per the sink's policy.
    /// An `Err` means the call was abandoned for this cycle.
    fn notify(&self, subscriber_id: &str, status: ConversionStatus) -> Result<()>;
}

/// HTTP GET postback client.
///
/// One call per conversion: `GET <base_url>?cnv_id=..&cnv_status=..&event<N>=1`.
/// The response body is ignored beyond the HTTP status. Every failure kind
/// (connect error, timeout, error status) is retried identically up to the
/// policy's attempt ceiling, sleeping the fixed delay between attempts.
pub struct HttpPostbackClient {
    base_url: String,
    policy: RetryPolicy,
    http: reqwest::blocking::Client,
}

impl HttpPostbackClient {
    /// # Errors
    /// Fails when the retry policy is invalid or the HTTP client cannot be
    /// constructed.
    pub fn new(base_url: String, policy: RetryPolicy) -> Result<Self> {
        policy.validate()?;
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build postback http client")?;
        Ok(Self {
            base_url,
            policy,
            http,
        })
    }

    fn try_once(&self, subscriber_id: &str, status: ConversionStatus) -> Result<()> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[("cnv_id", subscriber_id), ("cnv_status", status.as_str())])
            .query(&[(status.event_param(), "1".to_string())])
            .send()
            .context("postback request failed")?;

        response
            .error_for_status()
            .context("postback returned error status")?;
        Ok(())
    }
}

impl PostbackSink for HttpPostbackClient {
    fn notify(&self, subscriber_id: &str, status: ConversionStatus) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=self.policy.attempts {
            match self.try_once(subscriber_id, status) {
                Ok(()) => {
                    debug!(
                        cnv_status = status.as_str(),
                        attempt, "postback delivered"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        cnv_status = status.as_str(),
                        attempt,
                        attempts = self.policy.attempts,
                        "postback attempt failed: {err:#}"
                    );
                    last_error = Some(err);
                    if attempt < self.policy.attempts {
                        thread::sleep(self.policy.delay);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("postback retries exhausted")))
    }
}
