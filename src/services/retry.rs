//! Retry engine: drives produce→evaluate loops with bounded attempts,
//! compiled feedback, and backoff.

use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::gate::{AttemptRecord, GateOutcome, RetrySpec};
use crate::domain::ports::RetryContext;

/// What a producer yields per attempt.
#[derive(Debug, Clone)]
pub struct Produced {
    pub data: Value,
    pub raw: String,
}

/// Successful loop result.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub data: Value,
    pub raw: String,
    /// Attempts consumed, including the successful one
    pub attempts: u32,
    /// Gate outcomes of the passing attempt
    pub gates: Vec<GateOutcome>,
    pub history: Vec<AttemptRecord>,
}

/// Observer invoked after each attempt record is appended.
pub type OnAttempt = dyn Fn(&AttemptRecord) + Send + Sync;

/// Compile gate failures into a deterministic, numbered feedback block.
pub fn compile_feedback(failures: &[GateOutcome]) -> String {
    if failures.is_empty() {
        return "No gate failures recorded.".to_string();
    }

    let mut out = String::from("The previous attempt failed these checks:\n");
    for (idx, failure) in failures.iter().enumerate() {
        out.push_str(&format!(
            "{}. {}: {}",
            idx + 1,
            failure.gate_name,
            failure.reason.as_deref().unwrap_or("failed")
        ));
        if let Some(details) = &failure.details {
            out.push_str(&format!(
                " (details: {})",
                serde_json::to_string(details).unwrap_or_default()
            ));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Run `producer` until `evaluate` passes or the retry budget is exhausted.
///
/// Exhaustion yields [`DomainError::GateExhausted`] carrying the full
/// attempt history.
pub async fn run<P, PFut, E, EFut>(
    spec: &RetrySpec,
    mut producer: P,
    mut evaluate: E,
    on_attempt: Option<&OnAttempt>,
) -> DomainResult<RetryOutcome>
where
    P: FnMut(RetryContext) -> PFut,
    PFut: Future<Output = DomainResult<Produced>>,
    E: FnMut(Value, String, RetryContext) -> EFut,
    EFut: Future<Output = Vec<GateOutcome>>,
{
    let max = spec.effective_max();
    let mut history: Vec<AttemptRecord> = Vec::new();
    let mut feedback: Option<String> = None;
    let mut failures: Vec<GateOutcome> = Vec::new();

    for attempt in 1..=max {
        let ctx = RetryContext {
            attempt,
            feedback: feedback.clone(),
            failures: failures.clone(),
        };
        let started = Instant::now();

        let produced = producer(ctx.clone()).await?;
        let gates = evaluate(produced.data.clone(), produced.raw.clone(), ctx).await;
        let passed = gates.iter().all(|g| g.passed);

        let record = AttemptRecord {
            attempt,
            gates: gates.clone(),
            passed,
            feedback_sent: feedback.take(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        history.push(record);
        if let Some(observer) = on_attempt {
            observer(history.last().expect("just pushed"));
        }

        if passed {
            return Ok(RetryOutcome {
                data: produced.data,
                raw: produced.raw,
                attempts: attempt,
                gates,
                history,
            });
        }

        failures = gates.into_iter().filter(|g| !g.passed).collect();

        if attempt == max {
            return Err(DomainError::GateExhausted(history));
        }

        if spec.feedback {
            feedback = Some(compile_feedback(&failures));
        }

        let delay = spec.backoff.delay_ms(spec.delay_ms, attempt);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    unreachable!("loop returns or errors on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::domain::models::gate::Backoff;

    fn passing_gate() -> Vec<GateOutcome> {
        vec![GateOutcome::pass("g", 0)]
    }

    fn failing_gate(reason: &str) -> Vec<GateOutcome> {
        vec![GateOutcome::fail("g", reason, 0)]
    }

    #[tokio::test]
    async fn single_attempt_when_gates_pass() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let spec = RetrySpec { max: 1, ..Default::default() };
        let outcome = run(
            &spec,
            move |_ctx| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Produced { data: serde_json::json!({}), raw: "out".to_string() })
                }
            },
            |_data, _raw, _ctx| async { passing_gate() },
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.history.len(), 1);
        assert!(outcome.history[0].passed);
    }

    #[tokio::test]
    async fn retries_with_compiled_feedback() {
        let feedback_seen = Arc::new(Mutex::new(Vec::<Option<String>>::new()));
        let feedback_clone = feedback_seen.clone();

        let spec = RetrySpec { max: 3, feedback: true, ..Default::default() };
        let outcome = run(
            &spec,
            move |ctx| {
                let feedback_seen = feedback_clone.clone();
                async move {
                    feedback_seen.lock().unwrap().push(ctx.feedback.clone());
                    let raw = if ctx.attempt == 1 { "too short" } else { "this is a longer answer" };
                    Ok(Produced { data: serde_json::Value::Null, raw: raw.to_string() })
                }
            },
            |_data, raw, _ctx| async move {
                if raw.split_whitespace().count() >= 5 {
                    passing_gate()
                } else {
                    vec![GateOutcome::fail("word_count", "Word count 2 is below min 5", 0)]
                }
            },
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.attempts, 2);
        let seen = feedback_seen.lock().unwrap();
        assert_eq!(seen[0], None);
        let second = seen[1].as_deref().unwrap();
        assert!(second.contains("Word count 2 is below min 5"), "{second}");
        assert!(second.contains("1. word_count"), "{second}");
    }

    #[tokio::test]
    async fn exhaustion_carries_full_history() {
        let spec = RetrySpec { max: 3, feedback: true, ..Default::default() };
        let err = run(
            &spec,
            |_ctx| async { Ok(Produced { data: serde_json::Value::Null, raw: "x".to_string() }) },
            |_data, _raw, _ctx| async { failing_gate("always fails") },
            None,
        )
        .await
        .unwrap_err();

        match err {
            DomainError::GateExhausted(history) => {
                assert_eq!(history.len(), 3);
                assert!(history.iter().all(|r| !r.passed));
                // Second and third attempts carried feedback.
                assert!(history[1].feedback_sent.is_some());
                assert!(history[2].feedback_sent.is_some());
                assert!(history[0].feedback_sent.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn zero_max_normalized_to_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let spec = RetrySpec { max: 0, ..Default::default() };
        let err = run(
            &spec,
            move |_ctx| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Produced { data: serde_json::Value::Null, raw: String::new() })
                }
            },
            |_data, _raw, _ctx| async { failing_gate("nope") },
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DomainError::GateExhausted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_delays_observed() {
        let spec = RetrySpec {
            max: 3,
            feedback: false,
            delay_ms: 10,
            backoff: Backoff::Linear,
        };
        let started = Instant::now();
        let _ = run(
            &spec,
            |_ctx| async { Ok(Produced { data: serde_json::Value::Null, raw: String::new() }) },
            |_data, _raw, _ctx| async { failing_gate("nope") },
            None,
        )
        .await;
        // Delays after attempts 1 and 2: 10ms + 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn on_attempt_observer_fires_per_attempt() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let records_clone = records.clone();
        let observer = move |record: &AttemptRecord| {
            records_clone.lock().unwrap().push(record.attempt);
        };

        let spec = RetrySpec { max: 2, ..Default::default() };
        let _ = run(
            &spec,
            |_ctx| async { Ok(Produced { data: serde_json::Value::Null, raw: String::new() }) },
            |_data, _raw, _ctx| async { failing_gate("nope") },
            Some(&observer),
        )
        .await;

        assert_eq!(*records.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn feedback_compilation_is_deterministic() {
        let failures = vec![
            GateOutcome::fail("schema", "missing field", 1)
                .with_details(serde_json::json!({"path": "$.x"})),
            GateOutcome::fail("regex", "no match", 2),
        ];
        let a = compile_feedback(&failures);
        let b = compile_feedback(&failures);
        assert_eq!(a, b);
        assert!(a.contains("1. schema: missing field"));
        assert!(a.contains(r#"(details: {"path":"$.x"})"#));
        assert!(a.contains("2. regex: no match"));
    }

    #[test]
    fn empty_failures_sentinel() {
        assert_eq!(compile_feedback(&[]), "No gate failures recorded.");
    }
}
