use crate::protocol::{Command, ConnectionCreateResponse, ServerMessage};
use crate::sse::SseDecoder;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use std::error::Error;
use std::future::Future;
use tracing::{debug, warn};

pub struct ClientConfig {
    pub base_url: String,
}

/// The panel's end of a coordinator connection.
#[derive(Clone)]
pub struct BridgeClient {
    base_url: String,
    connection_id: String,
    http: HttpClient,
}

pub type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

impl BridgeClient {
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        let base_url = normalize_base_url(&config.base_url);
        let http = http_client(&base_url)?;

        let response = http
            .post(format!("{}/connections", base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Failed to open connection: {} - {}", status, body).into());
        }

        let body: ConnectionCreateResponse = response.json().await?;
        debug!(connection_id = %body.connection_id, %base_url, "Connected to coordinator");

        Ok(Self {
            base_url,
            connection_id: body.connection_id,
            http,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn send_command(&self, command: &Command) -> ClientResult<()> {
        let response = self
            .http
            .post(format!(
                "{}/connections/{}/commands",
                self.base_url, self.connection_id
            ))
            .json(command)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Failed to send command: {} - {}", status, body).into());
        }

        Ok(())
    }

    /// Feeds every message of the event stream to `on_message` until the server closes it.
    pub async fn stream_events<F, Fut>(&self, mut on_message: F) -> ClientResult<()>
    where
        F: FnMut(ServerMessage) -> Fut,
        Fut: Future<Output = ()>,
    {
        let response = self
            .http
            .get(format!(
                "{}/connections/{}/events",
                self.base_url, self.connection_id
            ))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Failed to open event stream: {} - {}", status, body).into());
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for data in decoder.push(&chunk) {
                match serde_json::from_str::<ServerMessage>(&data) {
                    Ok(message) => on_message(message).await,
                    Err(err) => warn!(error = %err, "Ignoring malformed server message"),
                }
            }
        }

        Ok(())
    }

    pub async fn disconnect(&self) -> ClientResult<()> {
        self.http
            .delete(format!(
                "{}/connections/{}",
                self.base_url, self.connection_id
            ))
            .send()
            .await?;
        Ok(())
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

// A coordinator on this machine is never reached through a proxy.
fn http_client(base_url: &str) -> ClientResult<HttpClient> {
    let url = reqwest::Url::parse(base_url)?;
    let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
    let mut builder = HttpClient::builder();
    if loopback {
        builder = builder.no_proxy();
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_loses_trailing_slashes() {
        assert_eq!(normalize_base_url("http://127.0.0.1:7878//"), "http://127.0.0.1:7878");
    }

    #[test]
    fn http_client_rejects_unparseable_url() {
        assert!(http_client("not a url").is_err());
        assert!(http_client("http://127.0.0.1:7878").is_ok());
    }
}
