use {
    std::time::Duration,
    tracing::warn,
    thiserror::Error,
    visits_common::{CountResponse, COUNT_PLACEHOLDER},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("counter endpoint responded with status {status}")]
    Status { status: u16 },

    #[error("failed to decode counter response: {reason}")]
    Decode { reason: String },
}

/// Reads the visit counter from its public endpoint. Every fetch counts as a visit.
#[derive(Clone)]
pub struct CounterClient {
    client: reqwest::Client,
    endpoint: String,
}

impl CounterClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_timeout(endpoint, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self::from_client(client, endpoint))
    }

    pub fn from_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub async fn fetch_count(&self) -> Result<u64, ClientError> {
        let response = self.client.get(&self.endpoint).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Status { status: response.status().as_u16() });
        }

        let body = response.bytes().await?;
        parse_count(&body)
    }

    /// Text to show in place of the counter. Failures never reach the caller.
    pub async fn display_text(&self) -> String {
        display_text(self.fetch_count().await)
    }
}

pub fn parse_count(body: &[u8]) -> Result<u64, ClientError> {
    serde_json::from_slice::<CountResponse>(body)
        .map(|v| v.count)
        .map_err(|err| ClientError::Decode { reason: err.to_string() })
}

pub fn display_text(result: Result<u64, ClientError>) -> String {
    match result {
        Ok(count) => count.to_string(),
        Err(err) => {
            warn!("failed to fetch visit count: {err}");
            COUNT_PLACEHOLDER.to_owned()
        }
    }
}
