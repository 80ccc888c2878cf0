//! `cloudwatch` logging plugin.
//!
//! Entries go through a bounded channel with `try_send()`, like the `file`
//! plugin. An uploader thread with its own runtime makes sure the log
//! stream exists, then ships whatever is queued as one `PutLogEvents` batch
//! per wakeup. Each event is a JSON object with `timestamp` (milliseconds),
//! `level`, `text` and, when present, `context`.
//!
//! Credentials come from the default AWS provider chain unless both
//! `access_key_id` and `secret_access_key` are set.

use std::thread::JoinHandle;
use std::time::Duration;

use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_cloudwatchlogs::config::Credentials;
use aws_sdk_cloudwatchlogs::error::DisplayErrorContext;
use aws_sdk_cloudwatchlogs::types::InputLogEvent;
use aws_sdk_cloudwatchlogs::Client;
use aws_types::region::Region;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{LogRecord, QUEUE_CAPACITY};
use crate::error::{GatewayError, Result};
use crate::plugins::{LogLevel, LoggingContext, LoggingPlugin};

/// Events per `PutLogEvents` call
const MAX_BATCH: usize = 256;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Config for the `cloudwatch` plugin
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudWatchLoggingConfig {
    /// Log group; must already exist
    pub group: String,

    /// Log stream; created when missing
    pub stream: String,

    #[serde(default)]
    pub region: Option<String>,

    /// Minimum level uploaded (default `warn`)
    #[serde(default)]
    pub level: Option<String>,

    /// CloudWatch Logs endpoint override
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,
}

/// Where and as whom the uploader writes
struct Destination {
    group: String,
    stream: String,
    region: Option<String>,
    endpoint: Option<String>,
    credentials: Option<Credentials>,
}

impl Destination {
    async fn client(&self) -> Client {
        let mut config_loader = aws_config::defaults(BehaviorVersion::latest()).timeout_config(
            TimeoutConfig::builder()
                .operation_timeout(REQUEST_TIMEOUT)
                .build(),
        );
        if let Some(region) = &self.region {
            config_loader = config_loader.region(Region::new(region.clone()));
        }
        if let Some(credentials) = &self.credentials {
            config_loader = config_loader.credentials_provider(credentials.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        let sdk_config = config_loader.load().await;
        Client::new(&sdk_config)
    }
}

/// Uploads structured log entries to a CloudWatch Logs stream.
pub struct CloudWatchLogging {
    level: LogLevel,
    tx: Option<mpsc::Sender<Box<LogRecord>>>,
    uploader: Option<JoinHandle<()>>,
}

impl CloudWatchLogging {
    /// Validate the config and start the uploader thread.
    pub fn new(config: CloudWatchLoggingConfig) -> Result<Self> {
        let level = match config.level.as_deref() {
            Some(level) => level.parse()?,
            None => LogLevel::Warn,
        };
        if config.group.is_empty() || config.stream.is_empty() {
            return Err(GatewayError::Config(
                "cloudwatch logging needs a non-empty group and stream".into(),
            ));
        }
        let credentials = match (config.access_key_id, config.secret_access_key) {
            (Some(id), Some(secret)) => {
                Some(Credentials::new(id, secret, None, None, "pggateway"))
            }
            (None, None) => None,
            _ => {
                return Err(GatewayError::Config(
                    "cloudwatch logging needs both access_key_id and secret_access_key".into(),
                ))
            }
        };

        let destination = Destination {
            group: config.group,
            stream: config.stream,
            region: config.region,
            endpoint: config.endpoint,
            credentials,
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let uploader = std::thread::Builder::new()
            .name("pggateway-cloudwatch".into())
            .spawn(move || runtime.block_on(run_upload_task(rx, destination)))?;

        Ok(Self {
            level,
            tx: Some(tx),
            uploader: Some(uploader),
        })
    }
}

impl LoggingPlugin for CloudWatchLogging {
    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    fn log(&self, level: LogLevel, context: Option<&LoggingContext>, message: &str) {
        let Some(tx) = &self.tx else {
            return;
        };
        let record = LogRecord::new(level, context, message);
        if tx.try_send(Box::new(record)).is_err() {
            trace!("cloudwatch log queue full, dropping entry");
        }
    }
}

impl Drop for CloudWatchLogging {
    fn drop(&mut self) {
        // The uploader sends what is left in the queue, then exits
        self.tx.take();
        if let Some(uploader) = self.uploader.take() {
            let _ = uploader.join();
        }
    }
}

async fn run_upload_task(mut rx: mpsc::Receiver<Box<LogRecord>>, destination: Destination) {
    let client = destination.client().await;
    if let Err(e) = ensure_stream(&client, &destination).await {
        error!(
            "CloudWatch log stream {}/{} unavailable: {}",
            destination.group, destination.stream, e
        );
    }

    let mut batch = Vec::with_capacity(MAX_BATCH);
    while let Some(record) = rx.recv().await {
        batch.push(record);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }

        if let Err(e) = put_events(&client, &destination, &batch).await {
            warn!("Dropped {} CloudWatch log events: {}", batch.len(), e);
        }
        batch.clear();
    }
}

/// Create the stream unless a stream of that exact name is listed.
async fn ensure_stream(client: &Client, destination: &Destination) -> Result<()> {
    let described = client
        .describe_log_streams()
        .log_group_name(&destination.group)
        .log_stream_name_prefix(&destination.stream)
        .send()
        .await
        .map_err(|e| {
            GatewayError::Plugin(format!("DescribeLogStreams failed: {}", DisplayErrorContext(&e)))
        })?;

    let exists = described
        .log_streams()
        .iter()
        .any(|s| s.log_stream_name() == Some(destination.stream.as_str()));
    if exists {
        return Ok(());
    }

    match client
        .create_log_stream()
        .log_group_name(&destination.group)
        .log_stream_name(&destination.stream)
        .send()
        .await
    {
        Ok(_) => {
            debug!(
                "Created CloudWatch log stream {}/{}",
                destination.group, destination.stream
            );
            Ok(())
        }
        // Another gateway created it in between
        Err(e)
            if e.as_service_error()
                .is_some_and(|e| e.is_resource_already_exists_exception()) =>
        {
            Ok(())
        }
        Err(e) => Err(GatewayError::Plugin(format!(
            "CreateLogStream failed: {}",
            DisplayErrorContext(&e)
        ))),
    }
}

fn event_message(record: &LogRecord) -> String {
    let mut event = serde_json::json!({
        "timestamp": record.time.timestamp_millis(),
        "level": record.level,
        "text": record.message,
    });
    if let Some(context) = &record.context {
        event["context"] = serde_json::json!(context);
    }
    event.to_string()
}

async fn put_events(
    client: &Client,
    destination: &Destination,
    batch: &[Box<LogRecord>],
) -> Result<()> {
    let events = batch
        .iter()
        .map(|record| {
            InputLogEvent::builder()
                .timestamp(record.time.timestamp_millis())
                .message(event_message(record))
                .build()
                .map_err(|e| GatewayError::Plugin(format!("invalid log event: {}", e)))
        })
        .collect::<Result<Vec<_>>>()?;

    let output = client
        .put_log_events()
        .log_group_name(&destination.group)
        .log_stream_name(&destination.stream)
        .set_log_events(Some(events))
        .send()
        .await
        .map_err(|e| {
            GatewayError::Plugin(format!("PutLogEvents failed: {}", DisplayErrorContext(&e)))
        })?;

    if let Some(rejected) = output.rejected_log_events_info() {
        warn!("CloudWatch rejected log events: {:?}", rejected);
    }
    Ok(())
}
