//! Blocking HTTP client for the hosted table API.
//!
//! ```text
//! GET {base_url}/{base_id}/{table}?pageSize=100[&offset=…][&filterByFormula=…]
//! Authorization: Bearer <key>
//! ```
//!
//! Pagination follows the `offset` token until the API stops returning one.
//! Requests are spaced by at least `min_request_interval` because the API is
//! rate-limited per base.

use std::sync::Mutex;
use std::thread::sleep;
use std::time::{Duration, Instant};

use kurator_core::config::SourceConfig;
use kurator_core::{EntityKind, SourceId};

use crate::record::ListPage;
use crate::{RawRecord, RecordFilter, SourceClient, SourceError};

pub struct HttpSourceClient {
    agent: ureq::Agent,
    config: SourceConfig,
    api_key: String,
    last_request: Mutex<Option<Instant>>,
}

impl HttpSourceClient {
    /// Build a client, reading the API key from `config.api_key_env`.
    pub fn from_config(config: SourceConfig) -> Result<Self, SourceError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| SourceError::MissingApiKey {
                env: config.api_key_env.clone(),
            })?;
        Ok(Self::new(config, api_key))
    }

    pub fn new(config: SourceConfig, api_key: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self {
            agent,
            config,
            api_key: api_key.into(),
            last_request: Mutex::new(None),
        }
    }

    fn table_url(&self, kind: EntityKind) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.base_id,
            self.config.table(kind)
        )
    }

    fn throttle(&self) {
        let interval = self.config.min_request_interval();
        let mut last = self
            .last_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    fn fetch_page(
        &self,
        kind: EntityKind,
        formula: Option<&str>,
        offset: Option<&str>,
    ) -> Result<ListPage, SourceError> {
        self.throttle();

        let page_size = self.config.page_size.to_string();
        let mut request = self
            .agent
            .get(&self.table_url(kind))
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .query("pageSize", &page_size);
        if let Some(formula) = formula {
            request = request.query("filterByFormula", formula);
        }
        if let Some(offset) = offset {
            request = request.query("offset", offset);
        }

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(SourceError::Status { kind, status, body });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(SourceError::Transport {
                    kind,
                    message: transport.to_string(),
                });
            }
        };

        response
            .into_json::<ListPage>()
            .map_err(|source| SourceError::Body { kind, source })
    }
}

impl SourceClient for HttpSourceClient {
    fn query(
        &self,
        kind: EntityKind,
        filter: &RecordFilter<'_>,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let formula = match filter {
            RecordFilter::All => None,
            RecordFilter::Ids(ids) => Some(ids_formula(ids)),
            RecordFilter::FieldEquals { field, value } => Some(field_formula(field, value)),
        };

        let mut records = Vec::new();
        let mut offset: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let page = self.fetch_page(kind, formula.as_deref(), offset.as_deref())?;
            pages += 1;
            records.extend(page.records);
            match page.offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        tracing::debug!(
            "fetched {} {} record(s) in {} page(s)",
            records.len(),
            kind,
            pages
        );
        Ok(records)
    }
}

/// `OR(RECORD_ID()='a',RECORD_ID()='b')`
pub fn ids_formula(ids: &[SourceId]) -> String {
    let terms: Vec<String> = ids
        .iter()
        .map(|id| format!("RECORD_ID()='{}'", escape_formula(&id.0)))
        .collect();
    format!("OR({})", terms.join(","))
}

/// `{Field}='value'`. Single-element lookup columns compare as their value.
pub fn field_formula(field: &str, value: &str) -> String {
    format!("{{{field}}}='{}'", escape_formula(value))
}

/// Escape a string literal for use inside single quotes in a formula.
pub fn escape_formula(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
