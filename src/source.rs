// 📡 Sources - where Tally data comes from
//
//   TallyServerSource  POST <ENVELOPE> to Tally's HTTP port   → XML
//   ProxySource        GET {base}/api/{slug}?company=...      → JSON
//   DirectorySource    {dir}/{slug}.xml | {dir}/{slug}.json   → either

use crate::entities::Collection;
use crate::error::TransportError;
use crate::parser::{detect_format, Payload, PayloadFormat};
use crate::request::ExportRequest;
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use std::fs;
use std::path::PathBuf;
use tracing::{info, instrument};

pub trait TallySource {
    fn fetch(&self, collection: Collection) -> Result<Payload>;

    /// Human-readable origin for logs and reports
    fn describe(&self) -> String;
}

fn exhausted(collection: Collection, attempts: u32, error: TransportError) -> anyhow::Error {
    anyhow!(
        "fetching {} failed after {} attempt(s): {}",
        collection,
        attempts,
        error
    )
}

// ============================================================================
// TALLY SERVER
// ============================================================================

pub struct TallyServerSource<T: Transport> {
    transport: T,
    url: String,
    company: Option<String>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    retry: RetryPolicy,
}

impl<T: Transport> TallyServerSource<T> {
    pub fn new(transport: T, url: impl Into<String>, retry: RetryPolicy) -> Self {
        TallyServerSource {
            transport,
            url: url.into(),
            company: None,
            from: None,
            to: None,
            retry,
        }
    }

    pub fn with_company(mut self, company: Option<String>) -> Self {
        self.company = company.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn with_period(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn request(&self, collection: Collection) -> ExportRequest {
        let request = ExportRequest::new(collection).period(self.from, self.to);
        match &self.company {
            Some(company) => request.company(company.clone()),
            None => request,
        }
    }
}

impl<T: Transport> TallySource for TallyServerSource<T> {
    #[instrument(skip(self), fields(url = %self.url))]
    fn fetch(&self, collection: Collection) -> Result<Payload> {
        let envelope = self.request(collection).to_xml();

        let body = self
            .retry
            .run(collection.slug(), |_| {
                self.transport.post(&self.url, "application/xml", envelope.clone())
            })
            .map_err(|e| exhausted(collection, e.attempts, e.error))?;

        info!(bytes = body.len(), "fetched from Tally");
        Ok(Payload::xml(body))
    }

    fn describe(&self) -> String {
        format!("tally server {}", self.url)
    }
}

// ============================================================================
// PROXY
// ============================================================================

pub struct ProxySource<T: Transport> {
    transport: T,
    base_url: String,
    company: String,
    retry: RetryPolicy,
}

impl<T: Transport> ProxySource<T> {
    pub fn new(transport: T, base_url: impl Into<String>, company: impl Into<String>, retry: RetryPolicy) -> Self {
        ProxySource {
            transport,
            base_url: base_url.into(),
            company: company.into(),
            retry,
        }
    }

    pub fn url_for(&self, collection: Collection) -> String {
        format!(
            "{}/api/{}?company={}",
            self.base_url.trim_end_matches('/'),
            collection.slug(),
            urlencoding::encode(&self.company)
        )
    }
}

impl<T: Transport> TallySource for ProxySource<T> {
    #[instrument(skip(self), fields(base = %self.base_url))]
    fn fetch(&self, collection: Collection) -> Result<Payload> {
        let url = self.url_for(collection);

        let body = self
            .retry
            .run(collection.slug(), |_| self.transport.get(&url))
            .map_err(|e| exhausted(collection, e.attempts, e.error))?;

        info!(bytes = body.len(), "fetched from proxy");
        Ok(Payload::json(body))
    }

    fn describe(&self) -> String {
        format!("proxy {}", self.base_url)
    }
}

// ============================================================================
// DIRECTORY (offline runs, fixtures)
// ============================================================================

pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirectorySource { dir: dir.into() }
    }
}

impl TallySource for DirectorySource {
    fn fetch(&self, collection: Collection) -> Result<Payload> {
        for (extension, format) in [("xml", PayloadFormat::Xml), ("json", PayloadFormat::Json)] {
            let path = self.dir.join(format!("{}.{}", collection.slug(), extension));
            if !path.exists() {
                continue;
            }

            let body = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let format = detect_format(&body).unwrap_or(format);
            info!(path = %path.display(), bytes = body.len(), "loaded fixture");
            return Ok(Payload { format, body });
        }

        Err(anyhow!(
            "no {}.xml or {}.json in {}",
            collection.slug(),
            collection.slug(),
            self.dir.display()
        ))
    }

    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedTransport;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::linear(5, Duration::ZERO)
    }

    #[test]
    fn test_tally_server_retries_then_succeeds() {
        let transport = ScriptedTransport::new()
            .fail(503)
            .fail(502)
            .respond("<ENVELOPE></ENVELOPE>");
        let source = TallyServerSource::new(transport, "http://localhost:9000", fast_retry())
            .with_company(Some("Acme".to_string()));

        let payload = source.fetch(Collection::Ledgers).unwrap();
        assert_eq!(payload.format, PayloadFormat::Xml);
        assert_eq!(source.transport.request_count(), 3);

        let requests = source.transport.requests.lock().unwrap();
        assert!(requests[0].1.contains("<SVCURRENTCOMPANY>Acme</SVCURRENTCOMPANY>"));
    }

    #[test]
    fn test_tally_server_gives_up() {
        let transport = ScriptedTransport::new()
            .fail(500)
            .fail(500)
            .fail(500)
            .fail(500)
            .fail(500);
        let source = TallyServerSource::new(transport, "http://localhost:9000", fast_retry());

        let err = source.fetch(Collection::Vouchers).unwrap_err();
        assert!(err.to_string().contains("vouchers"));
        assert!(err.to_string().contains("5 attempt"));
    }

    #[test]
    fn test_proxy_url_encodes_company() {
        let source = ProxySource::new(
            ScriptedTransport::new().respond("[]"),
            "https://proxy.example.com/",
            "Smith & Sons",
            fast_retry(),
        );
        assert_eq!(
            source.url_for(Collection::StockItems),
            "https://proxy.example.com/api/stock_items?company=Smith%20%26%20Sons"
        );

        let payload = source.fetch(Collection::StockItems).unwrap();
        assert_eq!(payload, Payload::json("[]"));
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        let source = ProxySource::new(
            ScriptedTransport::new().fail(404).respond("[]"),
            "https://proxy.example.com",
            "Acme",
            fast_retry(),
        );
        assert!(source.fetch(Collection::Groups).is_err());
        assert_eq!(source.transport.request_count(), 1);
    }

    #[test]
    fn test_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ledgers.xml"), "<ENVELOPE/>").unwrap();
        fs::write(dir.path().join("groups.json"), "[]").unwrap();

        let source = DirectorySource::new(dir.path());
        assert_eq!(source.fetch(Collection::Ledgers).unwrap().format, PayloadFormat::Xml);
        assert_eq!(source.fetch(Collection::Groups).unwrap().format, PayloadFormat::Json);
        assert!(source.fetch(Collection::Vouchers).is_err());
    }
}
