//! Batch-write access to the remote store.
//!
//! The store is reached through the `BatchWriter` trait so that the submitter can run against
//! DynamoDB, a dry-run writer that only traces requests, or the in-crate mock used by tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use aws_sdk_dynamodb::config::{Credentials, Region};
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, WriteRequest};
use aws_sdk_dynamodb::Client as DynamoDbClient;
use thiserror::Error;
use tracing::{debug, info};

use crate::mapping::{Record, RecordMapper};

/// The most put-requests a single `BatchWriteItem` call accepts.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("batch write request could not be built: {0}")]
    InvalidRequest(String),
    #[error("batch write request failed: {0}")]
    RequestFailed(String),
}

/// A store accepting batches of records, with partial-failure semantics.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    /// Write `records` to `table` in a single call.
    ///
    /// An `Err` means the call as a whole failed. `Ok` carries the records the store left
    /// unprocessed, which is empty when every record was written.
    async fn write_batch(
        &self,
        table: &str,
        records: &[Record],
    ) -> Result<Vec<Record>, StoreError>;
}

/// Connection settings for DynamoDB.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

pub struct DynamoBatchWriter {
    client: DynamoDbClient,
    /// Renders each put-request for debug logging.
    mapper: RecordMapper,
}

impl DynamoBatchWriter {
    pub fn new(client: DynamoDbClient, mapper: RecordMapper) -> Self {
        Self { client, mapper }
    }

    /// Build a client from `settings`. Static credentials are used when both keys are set,
    /// otherwise the default AWS provider chain applies.
    pub async fn from_settings(settings: &StoreSettings, mapper: RecordMapper) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));

        if let Some(endpoint_url) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }

        if let (Some(access_key), Some(secret_key)) = (&settings.access_key, &settings.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "loader-config",
            ));
        }

        let config = loader.load().await;
        info!(region = %settings.region, "initialized DynamoDB client");

        Self::new(DynamoDbClient::new(&config), mapper)
    }
}

#[async_trait]
impl BatchWriter for DynamoBatchWriter {
    async fn write_batch(
        &self,
        table: &str,
        records: &[Record],
    ) -> Result<Vec<Record>, StoreError> {
        let requests = records
            .iter()
            .map(write_request)
            .collect::<Result<Vec<WriteRequest>, StoreError>>()?;
        for record in records {
            debug!(table, "POST: {}", self.mapper.render(record));
        }

        let output = self
            .client
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
            .map_err(|e| StoreError::RequestFailed(DisplayErrorContext(&e).to_string()))?;

        let unprocessed = output
            .unprocessed_items()
            .and_then(|items| items.get(table))
            .map(|requests| requests.iter().filter_map(record_from_write_request).collect())
            .unwrap_or_default();

        Ok(unprocessed)
    }
}

/// Translate a record into a put-request, storing every field as a string attribute.
pub fn write_request(record: &Record) -> Result<WriteRequest, StoreError> {
    let item: HashMap<String, AttributeValue> = record
        .iter()
        .map(|(name, value)| (name.to_owned(), AttributeValue::S(value.to_owned())))
        .collect();

    let put_request = PutRequest::builder()
        .set_item(Some(item))
        .build()
        .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;

    Ok(WriteRequest::builder().put_request(put_request).build())
}

/// Recover the record carried by a put-request. Non-string attributes are skipped.
pub fn record_from_write_request(request: &WriteRequest) -> Option<Record> {
    let put_request = request.put_request()?;

    Some(
        put_request
            .item()
            .iter()
            .filter_map(|(name, value)| value.as_s().ok().map(|s| (name.clone(), s.clone())))
            .collect(),
    )
}

/// Traces every would-be put-request and reports the batch as fully written.
pub struct DryRunWriter {
    mapper: RecordMapper,
}

impl DryRunWriter {
    pub fn new(mapper: RecordMapper) -> Self {
        Self { mapper }
    }
}

#[async_trait]
impl BatchWriter for DryRunWriter {
    async fn write_batch(
        &self,
        table: &str,
        records: &[Record],
    ) -> Result<Vec<Record>, StoreError> {
        let span = tracing::span!(tracing::Level::INFO, "dry run batch", table);
        let _enter = span.enter();

        for record in records {
            info!("POST: {}", self.mapper.render(record));
        }

        Ok(Vec::new())
    }
}

/// Mock writer for testing - always available, no conditional compilation needed.
///
/// Records whose `field` equals `value` for a registered `unprocessed_when` rule are returned as
/// unprocessed; a batch containing a record matching a `fail_when` rule fails as a whole.
#[derive(Clone, Default)]
pub struct MockBatchWriter {
    unprocessed_rules: Vec<(String, String)>,
    failure_rules: Vec<(String, String)>,
    latency: Option<time::Duration>,
    calls: Arc<Mutex<Vec<(String, Vec<Record>)>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockBatchWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unprocessed_when(mut self, field: &str, value: &str) -> Self {
        self.unprocessed_rules.push((field.to_owned(), value.to_owned()));
        self
    }

    pub fn fail_when(mut self, field: &str, value: &str) -> Self {
        self.failure_rules.push((field.to_owned(), value.to_owned()));
        self
    }

    pub fn with_latency(mut self, latency: time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every call received so far, as (table, records).
    pub fn calls(&self) -> Vec<(String, Vec<Record>)> {
        self.calls.lock().expect("mock call log poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("mock call log poisoned").len()
    }

    /// Highest number of calls observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn matches(rules: &[(String, String)], record: &Record) -> bool {
        rules
            .iter()
            .any(|(field, value)| record.get(field) == Some(value.as_str()))
    }
}

#[async_trait]
impl BatchWriter for MockBatchWriter {
    async fn write_batch(
        &self,
        table: &str,
        records: &[Record],
    ) -> Result<Vec<Record>, StoreError> {
        self.calls
            .lock()
            .expect("mock call log poisoned")
            .push((table.to_owned(), records.to_vec()));

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug!(table, records = records.len(), "mock batch write");

        if records.iter().any(|record| Self::matches(&self.failure_rules, record)) {
            return Err(StoreError::RequestFailed("mock service unavailable".to_owned()));
        }

        Ok(records
            .iter()
            .filter(|record| Self::matches(&self.unprocessed_rules, record))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Delimiter;

    fn record(sku: &str, vendor: &str) -> Record {
        [("SKU", sku), ("VendorID", vendor)].into_iter().collect()
    }

    #[test]
    fn test_write_request_carries_string_attributes() {
        let request = write_request(&record("53726339", "M123")).unwrap();
        let item = request.put_request().unwrap().item();

        assert_eq!(item.len(), 2);
        assert_eq!(
            item.get("SKU"),
            Some(&AttributeValue::S("53726339".to_owned()))
        );
        assert_eq!(
            item.get("VendorID"),
            Some(&AttributeValue::S("M123".to_owned()))
        );
    }

    #[test]
    fn test_record_from_write_request() {
        let original = record("53726339", "M123");
        let request = write_request(&original).unwrap();

        assert_eq!(record_from_write_request(&request), Some(original));
        assert_eq!(
            record_from_write_request(&WriteRequest::builder().build()),
            None
        );
    }

    #[test]
    fn test_record_from_write_request_skips_non_string_attributes() {
        let mut item = HashMap::new();
        item.insert("SKU".to_owned(), AttributeValue::S("1".to_owned()));
        item.insert("Count".to_owned(), AttributeValue::N("3".to_owned()));
        let request = WriteRequest::builder()
            .put_request(PutRequest::builder().set_item(Some(item)).build().unwrap())
            .build();

        let recovered = record_from_write_request(&request).unwrap();

        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered.get("SKU"), Some("1"));
    }

    #[tokio::test]
    async fn test_dry_run_writer_accepts_everything() {
        let mapper = RecordMapper::new("SKU,VendorID".parse().unwrap(), Delimiter::default());
        let writer = DryRunWriter::new(mapper);

        let unprocessed = writer
            .write_batch("my-table", &[record("1", "a"), record("2", "b")])
            .await
            .unwrap();

        assert!(unprocessed.is_empty());
    }

    #[tokio::test]
    async fn test_mock_writer_rules() {
        let writer = MockBatchWriter::new()
            .unprocessed_when("SKU", "2")
            .fail_when("VendorID", "boom");

        let unprocessed = writer
            .write_batch("my-table", &[record("1", "a"), record("2", "b")])
            .await
            .unwrap();
        assert_eq!(unprocessed, vec![record("2", "b")]);

        let result = writer.write_batch("my-table", &[record("3", "boom")]).await;
        assert!(matches!(result, Err(StoreError::RequestFailed(_))));

        let calls = writer.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "my-table");
        assert_eq!(calls[1].1, vec![record("3", "boom")]);
        assert_eq!(writer.max_in_flight(), 1);
    }
}
