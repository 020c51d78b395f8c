//! Fixed-interval polling.
//!
//! Every convergence wait is a loop of attempts separated by a fixed sleep
//! (no backoff, no jitter). An attempt either finishes, asks to be retried
//! with a reason, or fails fatally.

use std::future::Future;
use std::time::Duration;

use meshboot_api::{ApiError, ApiResult};
use tokio::time::Instant;
use tracing::{debug, warn};

/// ACL readiness and replication.
pub const ACL_INTERVAL: Duration = Duration::from_millis(250);
/// Leader, catalog and KV checks.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(500);
/// Agent anti-entropy sync.
pub const ANTI_ENTROPY_INTERVAL: Duration = Duration::from_secs(5);

/// What a polling loop is waiting on. Its fields tag every retry event.
#[derive(Debug, Clone, Copy)]
pub struct Op<'a> {
    pub operation: &'a str,
    pub cluster: &'a str,
    pub node: Option<&'a str>,
    pub kind: Option<&'a str>,
}

impl<'a> Op<'a> {
    pub fn new(operation: &'a str, cluster: &'a str) -> Self {
        Self {
            operation,
            cluster,
            node: None,
            kind: None,
        }
    }

    pub fn on(mut self, node: &'a str) -> Self {
        self.node = Some(node);
        self
    }

    pub fn kind(mut self, kind: &'a str) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// Outcome of one polling attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    Retry(String),
    Fail(E),
}

impl<T, E> Attempt<T, E> {
    pub fn map_err<F>(self, f: impl FnOnce(E) -> F) -> Attempt<T, F> {
        match self {
            Attempt::Done(value) => Attempt::Done(value),
            Attempt::Retry(reason) => Attempt::Retry(reason),
            Attempt::Fail(e) => Attempt::Fail(f(e)),
        }
    }
}

impl<T> Attempt<T, ApiError> {
    /// Retry errors matching `transient`, fail on everything else.
    pub fn classify(result: ApiResult<T>, transient: fn(&ApiError) -> bool) -> Self {
        match result {
            Ok(value) => Attempt::Done(value),
            Err(e) if transient(&e) => Attempt::Retry(e.to_string()),
            Err(e) => Attempt::Fail(e),
        }
    }
}

/// Run `attempt` every `interval` until it is done or fails. Unbounded.
pub async fn poll<T, E, F, Fut>(op: Op<'_>, interval: Duration, mut attempt: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt().await {
            Attempt::Done(value) => {
                if attempts > 1 {
                    debug!(
                        operation = op.operation,
                        cluster = op.cluster,
                        node = op.node,
                        kind = op.kind,
                        attempts,
                        "condition reached"
                    );
                }
                return Ok(value);
            }
            Attempt::Fail(e) => return Err(e),
            Attempt::Retry(reason) => {
                warn!(
                    operation = op.operation,
                    cluster = op.cluster,
                    node = op.node,
                    kind = op.kind,
                    attempt = attempts,
                    %reason,
                    "not ready, retrying"
                );
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Like [`poll`], but gives up once `deadline` passes, turning the last
/// retry reason into an error with `elapsed`.
pub async fn poll_until<T, E, F, Fut>(
    op: Op<'_>,
    interval: Duration,
    deadline: Instant,
    mut attempt: F,
    elapsed: impl FnOnce(String) -> E,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt().await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(e) => return Err(e),
            Attempt::Retry(reason) => {
                let now = Instant::now();
                if now >= deadline {
                    warn!(
                        operation = op.operation,
                        cluster = op.cluster,
                        node = op.node,
                        kind = op.kind,
                        attempts,
                        %reason,
                        "deadline exceeded"
                    );
                    return Err(elapsed(reason));
                }
                warn!(
                    operation = op.operation,
                    cluster = op.cluster,
                    node = op.node,
                    kind = op.kind,
                    attempt = attempts,
                    %reason,
                    "not ready, retrying"
                );
                tokio::time::sleep(interval.min(deadline - now)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl Captured {
        fn events(&self) -> Vec<serde_json::Value> {
            let raw = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            raw.lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_done() {
        let mut calls = 0;
        let start = Instant::now();
        let result: Result<u32, String> = poll(Op::new("count", "dc1"), ACL_INTERVAL, || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Attempt::Retry(format!("only {n}"))
                } else {
                    Attempt::Done(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert!(start.elapsed() >= ACL_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_stops_immediately() {
        let mut calls = 0;
        let result: Result<(), String> = poll(Op::new("fatal", "dc1"), ACL_INTERVAL, || {
            calls += 1;
            async { Attempt::Fail("boom".to_string()) }
        })
        .await;
        assert_eq!(result, Err("boom".to_string()));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_last_reason() {
        let deadline = Instant::now() + Duration::from_secs(2);
        let result: Result<(), String> = poll_until(
            Op::new("never", "dc1"),
            CHECK_INTERVAL,
            deadline,
            || async { Attempt::Retry("web is critical".to_string()) },
            |reason| format!("timed out: {reason}"),
        )
        .await;
        assert_eq!(result, Err("timed out: web is critical".to_string()));
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_events_carry_structured_fields() {
        let logs = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(logs.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);

        let mut calls = 0;
        let op = Op::new("token replication", "dc2").on("dc2-server1").kind("agent");
        let result: Result<(), String> = poll(op, ACL_INTERVAL, || {
            calls += 1;
            let n = calls;
            async move {
                if n < 2 {
                    Attempt::Retry("ACL not found".to_string())
                } else {
                    Attempt::Done(())
                }
            }
        })
        .await;
        drop(guard);
        assert_eq!(result, Ok(()));

        let events = logs.events();
        let retry = events
            .iter()
            .find(|e| e["level"] == "WARN")
            .expect("retry event logged");
        let fields = &retry["fields"];
        assert_eq!(fields["operation"], "token replication");
        assert_eq!(fields["cluster"], "dc2");
        assert_eq!(fields["node"], "dc2-server1");
        assert_eq!(fields["kind"], "agent");
        assert_eq!(fields["attempt"], 1);
        assert_eq!(fields["reason"], "ACL not found");
    }

    #[tokio::test(start_paused = true)]
    async fn absent_node_is_not_logged() {
        let logs = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(logs.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);

        let deadline = Instant::now() + CHECK_INTERVAL;
        let _: Result<(), String> = poll_until(
            Op::new("mesh health", "dc1"),
            CHECK_INTERVAL,
            deadline,
            || async { Attempt::Retry("pong is critical".to_string()) },
            |reason| reason,
        )
        .await;
        drop(guard);

        let events = logs.events();
        assert!(!events.is_empty());
        for event in &events {
            assert_eq!(event["fields"]["cluster"], "dc1");
            assert!(event["fields"].get("node").is_none());
        }
    }

    #[test]
    fn classify_splits_transient() {
        let transient = ApiError::status(500, "a", "No cluster leader");
        let fatal = ApiError::status(403, "a", "Permission denied");
        assert!(matches!(
            Attempt::classify(Err::<(), _>(transient), crate::classify::is_booting),
            Attempt::Retry(_)
        ));
        assert!(matches!(
            Attempt::classify(Err::<(), _>(fatal), crate::classify::is_booting),
            Attempt::Fail(_)
        ));
    }
}
