//! Configuration for sync runs.

use std::time::Duration;

/// Upper bound for concurrent attachment transfers.
pub const MAX_CONCURRENT_TRANSFERS: usize = 8;

/// Controls the shape of the CSV written by a download.
///
/// Fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsvConfig {
    /// Download attachment files and write their local paths into the CSV.
    pub include_attachments: bool,
    /// Re-encode cells for the Scan app.
    pub scan_formatting: bool,
    /// Append the row metadata columns.
    pub extra_metadata_columns: bool,
}

impl CsvConfig {
    /// Creates a CSV configuration.
    pub fn new(include_attachments: bool, scan_formatting: bool, extra_metadata_columns: bool) -> Self {
        Self {
            include_attachments,
            scan_formatting,
            extra_metadata_columns,
        }
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Rows requested per page on download.
    pub page_size: u32,
    /// Maximum rows per upload request.
    pub upload_batch_rows: usize,
    /// Maximum serialized size of one upload request, in bytes.
    pub upload_batch_bytes: usize,
    /// Attachment transfers in flight at once.
    pub max_concurrent_transfers: usize,
    /// Timeout applied to every network call.
    pub request_timeout: Duration,
    /// Overwrite an existing CSV instead of refusing to start.
    pub force_overwrite: bool,
    /// Download attachments even when a file of the expected size is present.
    pub refetch_attachments: bool,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a sync configuration with defaults.
    pub fn new() -> Self {
        Self {
            page_size: 500,
            upload_batch_rows: 500,
            upload_batch_bytes: 1024 * 1024,
            max_concurrent_transfers: 4,
            request_timeout: Duration::from_secs(30),
            force_overwrite: false,
            refetch_attachments: false,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the download page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the upload batch limits.
    pub fn with_upload_batch(mut self, rows: usize, bytes: usize) -> Self {
        self.upload_batch_rows = rows.max(1);
        self.upload_batch_bytes = bytes.max(1);
        self
    }

    /// Sets the number of concurrent attachment transfers (clamped to 1..=8).
    pub fn with_max_concurrent_transfers(mut self, workers: usize) -> Self {
        self.max_concurrent_transfers = workers.clamp(1, MAX_CONCURRENT_TRANSFERS);
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the force-overwrite policy.
    pub fn with_force_overwrite(mut self, force: bool) -> Self {
        self.force_overwrite = force;
        self
    }

    /// Sets whether present attachments are downloaded again.
    pub fn with_refetch_attachments(mut self, refetch: bool) -> Self {
        self.refetch_attachments = refetch;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How transient failures of idempotent requests are retried.
///
/// The wait before retry `n` (1-based) is `base_delay * factor^(n-1)`,
/// capped at `max_delay`, plus up to a quarter of that when `jitter` is on.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts per request, the first one included.
    pub max_attempts: u32,
    /// Wait before the first retry.
    pub base_delay: Duration,
    /// Upper bound of a single wait, before jitter.
    pub max_delay: Duration,
    /// Growth of the wait per retry.
    pub factor: f64,
    /// Spread waits so concurrent transfers do not retry in lockstep.
    pub jitter: bool,
}

impl RetryConfig {
    /// `max_attempts` attempts, 250 ms doubling up to 30 s, with jitter.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
        }
    }

    /// A single attempt. Used for requests that must not be replayed.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
            jitter: false,
        }
    }

    /// Sets the wait before the first retry.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Caps a single wait.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor; values below 1 are raised to 1.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Turns jitter on or off.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before retry number `retry`; zero for the first attempt.
    pub fn backoff(&self, retry: u32) -> Duration {
        let Some(exponent) = retry.checked_sub(1) else {
            return Duration::ZERO;
        };
        let grown = self.base_delay.as_secs_f64() * self.factor.powi(exponent.min(64) as i32);
        let wait = Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()));
        if self.jitter {
            wait + wait.mul_f64(0.25 * jitter_fraction())
        } else {
            wait
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(4)
    }
}

/// A value in `[0, 1)` derived from the wall clock.
fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1024) / 1024.0
}
