//! Transactional retry: run a unit of work in a fresh transaction, retrying the whole of it
//! on serialization conflicts with exponential backoff and jitter.

use crate::error::{AppError, ConfigError};
use crate::store::{Store, StoreTx};
use futures::future::BoxFuture;
use rand::Rng;
use std::time::Duration;

/// How after-hooks queued by a committed unit of work are run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AfterHookDispatch {
    /// On a detached task; the caller gets its result without waiting.
    #[default]
    Spawn,
    /// Awaited before the call returns. Failures are still only logged.
    Inline,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransactionOptions {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub enable_retry: bool,
    pub after_hooks: AfterHookDispatch,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        TransactionOptions {
            max_retries: 5,
            initial_delay_ms: 50,
            max_delay_ms: 5000,
            enable_retry: true,
            after_hooks: AfterHookDispatch::Spawn,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::Load(format!("{}: cannot parse '{}'", key, v))),
        Err(_) => Ok(default),
    }
}

impl TransactionOptions {
    /// Defaults overridden by `RELFORGE_TX_MAX_RETRIES`, `RELFORGE_TX_INITIAL_DELAY_MS`,
    /// `RELFORGE_TX_MAX_DELAY_MS`, `RELFORGE_TX_ENABLE_RETRY` and `RELFORGE_AFTER_HOOKS` (spawn|inline).
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let after_hooks = match std::env::var("RELFORGE_AFTER_HOOKS") {
            Ok(v) => match v.trim().to_lowercase().as_str() {
                "spawn" => AfterHookDispatch::Spawn,
                "inline" => AfterHookDispatch::Inline,
                other => {
                    return Err(ConfigError::Load(format!(
                        "RELFORGE_AFTER_HOOKS: expected spawn or inline, got '{}'",
                        other
                    )))
                }
            },
            Err(_) => d.after_hooks,
        };
        Ok(TransactionOptions {
            max_retries: env_parse("RELFORGE_TX_MAX_RETRIES", d.max_retries)?,
            initial_delay_ms: env_parse("RELFORGE_TX_INITIAL_DELAY_MS", d.initial_delay_ms)?,
            max_delay_ms: env_parse("RELFORGE_TX_MAX_DELAY_MS", d.max_delay_ms)?,
            enable_retry: env_parse("RELFORGE_TX_ENABLE_RETRY", d.enable_retry)?,
            after_hooks,
        })
    }

    /// Delay before retry number `attempt + 1`, with `sample` in [-0.5, 0.5] scaling the ±10% jitter.
    pub fn backoff_delay(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.initial_delay_ms as f64 * 2f64.powi(attempt.min(62) as i32);
        let jitter = base * 0.10 * sample.clamp(-0.5, 0.5);
        let ms = (base + jitter).clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(ms.round() as u64)
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(-0.5..=0.5);
        self.backoff_delay(attempt, sample)
    }
}

/// Post-commit work queued during a unit of work.
pub type AfterJob = BoxFuture<'static, ()>;

/// The transaction of one attempt plus the after-hooks it has queued. A failed attempt's
/// queue is dropped with it, so after-hooks only ever run for the attempt that committed.
pub struct UnitOfWork {
    tx: Box<dyn StoreTx>,
    after: Vec<AfterJob>,
    attempt: u32,
}

impl UnitOfWork {
    pub fn new(tx: Box<dyn StoreTx>, attempt: u32) -> Self {
        UnitOfWork {
            tx,
            after: Vec::new(),
            attempt,
        }
    }

    pub fn tx(&mut self) -> &mut dyn StoreTx {
        self.tx.as_mut()
    }

    /// Zero-based attempt number of the enclosing retry loop.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn defer_after(&mut self, job: AfterJob) {
        self.after.push(job);
    }

    pub fn pending_after(&self) -> usize {
        self.after.len()
    }

    /// Commit and hand back the queued after-hooks.
    pub async fn commit(self) -> Result<Vec<AfterJob>, AppError> {
        self.tx.commit().await?;
        Ok(self.after)
    }

    pub async fn rollback(self) -> Result<(), AppError> {
        self.tx.rollback().await
    }
}

/// Run queued after-hooks in order. Each job logs its own failure.
pub async fn dispatch_after(jobs: Vec<AfterJob>, mode: AfterHookDispatch) {
    if jobs.is_empty() {
        return;
    }
    match mode {
        AfterHookDispatch::Inline => {
            for job in jobs {
                job.await;
            }
        }
        AfterHookDispatch::Spawn => {
            tokio::spawn(async move {
                for job in jobs {
                    job.await;
                }
            });
        }
    }
}

/// Run `work` in a new transaction, committing on success. A serialization conflict from
/// `work` or from commit re-runs `work` from the start while retries remain; any other
/// error rolls back and returns. At most `max_retries + 1` attempts are made.
pub async fn run_in_transaction<T, F>(store: &dyn Store, opts: &TransactionOptions, mut work: F) -> Result<T, AppError>
where
    F: for<'a> FnMut(&'a mut UnitOfWork) -> BoxFuture<'a, Result<T, AppError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let err = match attempt_once(store, attempt, &mut work).await {
            Ok((value, jobs)) => {
                dispatch_after(jobs, opts.after_hooks).await;
                return Ok(value);
            }
            Err(e) => e,
        };
        if !(err.is_retryable() && opts.enable_retry && attempt < opts.max_retries) {
            if err.is_retryable() {
                tracing::warn!(attempts = attempt + 1, error = %err, "giving up after serialization conflicts");
            }
            return Err(err);
        }
        let delay = opts.next_delay(attempt);
        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "serialization conflict, retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

async fn attempt_once<T, F>(store: &dyn Store, attempt: u32, work: &mut F) -> Result<(T, Vec<AfterJob>), AppError>
where
    F: for<'a> FnMut(&'a mut UnitOfWork) -> BoxFuture<'a, Result<T, AppError>>,
{
    let mut uow = UnitOfWork::new(store.begin().await?, attempt);
    match work(&mut uow).await {
        Ok(value) => {
            let jobs = uow.commit().await?;
            Ok((value, jobs))
        }
        Err(e) => {
            if let Err(rb) = uow.rollback().await {
                tracing::warn!(error = %rb, "rollback failed");
            }
            Err(e)
        }
    }
}
