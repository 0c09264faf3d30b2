// 🌐 HTTP Transport
// One seam for every outbound call so tests can swap in a scripted transport.

use crate::error::TransportError;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;

pub trait Transport: Send + Sync {
    fn post(&self, url: &str, content_type: &str, body: String) -> Result<String, TransportError>;

    fn get(&self, url: &str) -> Result<String, TransportError>;
}

/// Blocking reqwest client with a single timeout
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request {
                url: String::new(),
                message: e.to_string(),
            })?;

        Ok(HttpTransport { client })
    }

    fn finish(url: &str, response: reqwest::Result<reqwest::blocking::Response>) -> Result<String, TransportError> {
        let request_error = |e: reqwest::Error| TransportError::Request {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = response.map_err(request_error)?;
        let status = response.status();
        let body = response.text().map_err(request_error)?;
        debug!(url, status = status.as_u16(), bytes = body.len(), "response received");

        if status.is_success() {
            Ok(body)
        } else {
            Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            })
        }
    }
}

impl Transport for HttpTransport {
    fn post(&self, url: &str, content_type: &str, body: String) -> Result<String, TransportError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send();
        Self::finish(url, response)
    }

    fn get(&self, url: &str) -> Result<String, TransportError> {
        let response = self.client.get(url).send();
        Self::finish(url, response)
    }
}

// ============================================================================
// SCRIPTED TRANSPORT (tests)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays queued responses in order and records every request.
    #[derive(Default)]
    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<String, TransportError>>>,
        pub requests: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(self, body: &str) -> Self {
            self.responses
                .lock()
                .unwrap()
                .push_back(Ok(body.to_string()));
            self
        }

        pub fn fail(self, status: u16) -> Self {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(TransportError::Status {
                    url: "mock".to_string(),
                    status,
                    body: "unavailable".to_string(),
                }));
            self
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn next(&self, url: &str, body: String) -> Result<String, TransportError> {
            self.requests.lock().unwrap().push((url.to_string(), body));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(TransportError::Request {
                        url: url.to_string(),
                        message: "no scripted response left".to_string(),
                    })
                })
        }
    }

    impl Transport for ScriptedTransport {
        fn post(&self, url: &str, _content_type: &str, body: String) -> Result<String, TransportError> {
            self.next(url, body)
        }

        fn get(&self, url: &str) -> Result<String, TransportError> {
            self.next(url, String::new())
        }
    }
}
