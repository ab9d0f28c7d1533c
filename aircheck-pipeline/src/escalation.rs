//! Model escalation policy
//!
//! One place decides how inference failures are handled, keyed on the
//! error kind attached at the call site:
//!
//! - `Transient`: retried in place with exponential backoff, then the
//!   whole retry budget is spent again on the fallback model.
//! - `Auth`: fails immediately. A different model cannot fix a bad key,
//!   and retrying would just burn quota on rejections.
//! - `Validation` (and any other client-side rejection): one attempt on
//!   the fallback model, then fail.
//! - `Data`: fails immediately. The input is wrong; no model fixes that.
//!
//! The model that finally produced the accepted output is returned with
//! the value, so stages can record which model did the work.

use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use aircheck_common::{Error, ErrorKind, Result};

use crate::inference::{GenerateRequest, InferenceClient};

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    max_transient_retries: u32,
    initial_backoff: Duration,
}

impl EscalationPolicy {
    pub fn new(max_transient_retries: u32) -> Self {
        Self {
            max_transient_retries,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }

    /// Override the initial backoff. Tests use this to avoid real sleeps.
    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Run `call` against the primary model, escalating to the fallback
    /// per the policy. Returns the value and the model that produced it.
    pub async fn run<T, F, Fut>(
        &self,
        operation_name: &str,
        primary: &str,
        fallback: &str,
        call: F,
    ) -> Result<(T, String)>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.run_with_retries(operation_name, primary, &call).await {
            Ok(value) => Ok((value, primary.to_string())),
            Err(err) => match err.kind() {
                ErrorKind::Auth | ErrorKind::Data => Err(err),
                ErrorKind::Transient => {
                    warn!(
                        operation = operation_name,
                        primary, fallback,
                        error = %err,
                        "Primary model exhausted transient retries, escalating to fallback"
                    );
                    let value = self.run_with_retries(operation_name, fallback, &call).await?;
                    Ok((value, fallback.to_string()))
                }
                ErrorKind::Validation => {
                    warn!(
                        operation = operation_name,
                        primary, fallback,
                        error = %err,
                        "Primary model output rejected, trying fallback once"
                    );
                    let value = call(fallback.to_string()).await?;
                    Ok((value, fallback.to_string()))
                }
            },
        }
    }

    /// Run `call` against one model, retrying transient failures with
    /// exponential backoff. Non-transient failures return immediately.
    async fn run_with_retries<T, F, Fut>(
        &self,
        operation_name: &str,
        model: &str,
        call: &F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match call(model.to_string()).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation_name,
                            model, attempt, "Call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if err.kind() == ErrorKind::Transient => {
                    if attempt > self.max_transient_retries {
                        return Err(err);
                    }
                    warn!(
                        operation = operation_name,
                        model,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient failure, will retry after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Parse a model response strictly; on failure, make one reformat call
/// with the fixed repair model and parse that. The repair call never
/// escalates: a second malformed response is terminal for the item.
pub async fn parse_or_repair<T: DeserializeOwned>(
    client: &dyn InferenceClient,
    repair_model: &str,
    schema: &serde_json::Value,
    raw: &str,
) -> Result<T> {
    let cleaned = strip_code_fences(raw);
    match serde_json::from_str(cleaned) {
        Ok(value) => Ok(value),
        Err(parse_err) => {
            warn!(
                repair_model,
                error = %parse_err,
                "Response failed strict parse, attempting reformat"
            );
            let request = GenerateRequest::new(
                repair_model,
                format!(
                    "Reformat the following content so it is valid JSON conforming \
                     to the response schema. Preserve all content; output JSON only.\n\n{raw}"
                ),
            )
            .with_schema(schema.clone());
            let repaired = client.generate(&request).await?;
            serde_json::from_str(strip_code_fences(&repaired.text)).map_err(|e| {
                Error::validation(format!("response still malformed after repair: {e}"))
            })
        }
    }
}

/// Strip a surrounding markdown code fence, if present. Models sometimes
/// wrap JSON output in one even when asked not to.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(retries: u32) -> EscalationPolicy {
        EscalationPolicy::new(retries).with_initial_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn success_on_primary_records_primary() {
        let policy = fast_policy(3);
        let (value, model) = policy
            .run("op", "big-model", "small-model", |model| async move {
                Ok::<_, Error>(model.len())
            })
            .await
            .unwrap();
        assert_eq!(value, "big-model".len());
        assert_eq!(model, "big-model");
    }

    #[tokio::test]
    async fn transient_failures_retry_then_escalate() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(2);
        let (_, model) = policy
            .run("op", "big-model", "small-model", |model| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if model == "big-model" {
                        Err(Error::transient("503"))
                    } else {
                        Ok(1)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(model, "small-model");
        // 3 attempts on primary (1 + 2 retries), then 1 on fallback.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn auth_errors_never_retry() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3);
        let result = policy
            .run("op", "big-model", "small-model", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::auth("bad key")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validation_errors_get_one_fallback_attempt() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3);
        let result = policy
            .run("op", "big-model", "small-model", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::validation("refused")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn data_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3);
        let result = policy
            .run("op", "big-model", "small-model", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Data("bad time".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }
}
