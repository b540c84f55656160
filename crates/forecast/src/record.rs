//! The forecast record and its guarded transitions.
//!
//! Invariant: `output_json`, `score` and `run_at` are set iff `status == Completed`.
//! Only the holder of the current [`Lease`] may complete or fail a running record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use farmflow_core::{ForecastId, GroupId};

use crate::kind::ForecastKind;
use crate::output::ForecastOutput;
use crate::status::{ForecastStatus, TransitionError};

/// Opaque token identifying one queue delivery of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which delivery holds a running record, and until when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Producer-side input for a new record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewForecast {
    pub group_id: GroupId,
    pub kind: ForecastKind,
    pub model_name: String,
    pub input_json: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastRecord {
    pub id: ForecastId,
    pub group_id: GroupId,
    #[serde(rename = "type")]
    pub kind: ForecastKind,
    pub model_name: String,
    pub input_json: JsonValue,
    pub status: ForecastStatus,
    pub output_json: Option<ForecastOutput>,
    pub score: Option<f64>,
    pub run_at: Option<DateTime<Utc>>,
    /// Operator-facing failure reason; never a result.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub lease: Option<Lease>,
}

impl ForecastRecord {
    /// A fresh `pending` record.
    pub fn new(input: NewForecast, now: DateTime<Utc>) -> Self {
        Self {
            id: ForecastId::new(),
            group_id: input.group_id,
            kind: input.kind,
            model_name: input.model_name,
            input_json: input.input_json,
            status: ForecastStatus::Pending,
            output_json: None,
            score: None,
            run_at: None,
            error: None,
            created_at: now,
            updated_at: now,
            lease: None,
        }
    }

    /// `pending → running`, or take over a running record whose lease has lapsed.
    ///
    /// Re-entering with the current token just extends the lease.
    pub fn begin_run(
        &mut self,
        token: LeaseToken,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        match self.status {
            ForecastStatus::Pending => {}
            ForecastStatus::Running => match &self.lease {
                Some(lease) if lease.token == token || lease.is_expired(now) => {}
                None => {}
                Some(_) => return Err(TransitionError::LeaseHeld),
            },
            from => {
                return Err(TransitionError::Illegal {
                    from,
                    to: ForecastStatus::Running,
                });
            }
        }

        self.status = ForecastStatus::Running;
        self.lease = Some(Lease {
            token,
            expires_at: now + ttl,
        });
        self.updated_at = now;
        Ok(())
    }

    /// `running → completed`, storing the output. Requires the current lease.
    pub fn complete(
        &mut self,
        token: &LeaseToken,
        output: ForecastOutput,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.check_holder(token, ForecastStatus::Completed)?;

        self.score = Some(output.score());
        self.output_json = Some(output);
        self.run_at = Some(now);
        self.status = ForecastStatus::Completed;
        self.error = None;
        self.lease = None;
        self.updated_at = now;
        Ok(())
    }

    /// `running → failed`. Requires the current lease. No output is stored.
    pub fn fail(
        &mut self,
        token: &LeaseToken,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.check_holder(token, ForecastStatus::Failed)?;
        self.mark_failed(reason.into(), now);
        Ok(())
    }

    /// `pending → failed` for a record whose job never reached the queue.
    pub fn fail_pending(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != ForecastStatus::Pending {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: ForecastStatus::Failed,
            });
        }
        self.mark_failed(reason.into(), now);
        Ok(())
    }

    /// Fail a running record whose lease lapsed at or before `cutoff`.
    ///
    /// Returns `false` (untouched) for anything else.
    pub fn expire_if_stale(&mut self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let stale = self.status == ForecastStatus::Running
            && self
                .lease
                .as_ref()
                .map_or(self.updated_at <= cutoff, |l| l.expires_at <= cutoff);
        if stale {
            self.mark_failed("worker lease expired without a result".to_string(), now);
        }
        stale
    }

    fn check_holder(&self, token: &LeaseToken, to: ForecastStatus) -> Result<(), TransitionError> {
        if self.status != ForecastStatus::Running {
            return Err(TransitionError::Illegal { from: self.status, to });
        }
        match &self.lease {
            Some(lease) if &lease.token == token => Ok(()),
            _ => Err(TransitionError::LeaseMismatch),
        }
    }

    fn mark_failed(&mut self, reason: String, now: DateTime<Utc>) {
        self.status = ForecastStatus::Failed;
        self.output_json = None;
        self.score = None;
        self.run_at = None;
        self.error = Some(reason);
        self.lease = None;
        self.updated_at = now;
    }

    /// `output_json`, `score` and `run_at` are present exactly when completed.
    pub fn result_invariant_holds(&self) -> bool {
        let completed = self.status == ForecastStatus::Completed;
        completed == self.output_json.is_some()
            && completed == self.score.is_some()
            && completed == self.run_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SeriesForecast;
    use proptest::prelude::*;
    use serde_json::json;

    fn record() -> ForecastRecord {
        ForecastRecord::new(
            NewForecast {
                group_id: GroupId::new(),
                kind: ForecastKind::EggProduction,
                model_name: "default-model".to_string(),
                input_json: json!({ "horizonDays": 3 }),
            },
            Utc::now(),
        )
    }

    fn output() -> ForecastOutput {
        let first = Utc::now().date_naive();
        ForecastOutput::new(
            ForecastKind::EggProduction,
            SeriesForecast::from_values(0.9, first, &[1.0, 2.0, 3.0], 0.1),
        )
    }

    fn ttl() -> Duration {
        Duration::seconds(60)
    }

    #[test]
    fn happy_path_sets_result_fields() {
        let mut r = record();
        let t = LeaseToken::new("d-1");
        let now = Utc::now();

        r.begin_run(t.clone(), ttl(), now).unwrap();
        assert_eq!(r.status, ForecastStatus::Running);
        assert!(r.result_invariant_holds());

        r.complete(&t, output(), now).unwrap();
        assert_eq!(r.status, ForecastStatus::Completed);
        assert_eq!(r.score, Some(0.9));
        assert_eq!(r.run_at, Some(now));
        assert!(r.lease.is_none());
        assert!(r.result_invariant_holds());
    }

    #[test]
    fn live_lease_blocks_second_delivery() {
        let mut r = record();
        let now = Utc::now();
        r.begin_run(LeaseToken::new("d-1"), ttl(), now).unwrap();

        assert_eq!(
            r.begin_run(LeaseToken::new("d-2"), ttl(), now),
            Err(TransitionError::LeaseHeld)
        );
    }

    #[test]
    fn expired_lease_can_be_taken_over_and_old_holder_loses() {
        let mut r = record();
        let now = Utc::now();
        let first = LeaseToken::new("d-1");
        let second = LeaseToken::new("d-2");

        r.begin_run(first.clone(), ttl(), now).unwrap();
        let later = now + Duration::seconds(61);
        r.begin_run(second.clone(), ttl(), later).unwrap();

        assert_eq!(r.complete(&first, output(), later), Err(TransitionError::LeaseMismatch));
        assert_eq!(
            r.fail(&first, "slow worker", later),
            Err(TransitionError::LeaseMismatch)
        );
        r.complete(&second, output(), later).unwrap();
    }

    #[test]
    fn terminal_records_reject_everything() {
        let mut r = record();
        let t = LeaseToken::new("d-1");
        let now = Utc::now();
        r.begin_run(t.clone(), ttl(), now).unwrap();
        r.fail(&t, "predictor exploded", now).unwrap();

        assert!(r.begin_run(LeaseToken::new("d-2"), ttl(), now).is_err());
        assert!(r.complete(&t, output(), now).is_err());
        assert!(r.fail_pending("x", now).is_err());
        assert_eq!(r.status, ForecastStatus::Failed);
        assert!(r.output_json.is_none());
        assert_eq!(r.error.as_deref(), Some("predictor exploded"));
    }

    #[test]
    fn pending_record_can_fail_without_lease() {
        let mut r = record();
        r.fail_pending("queue unavailable", Utc::now()).unwrap();
        assert_eq!(r.status, ForecastStatus::Failed);
        assert!(r.result_invariant_holds());
    }

    #[test]
    fn stale_sweep_only_touches_expired_running_records() {
        let now = Utc::now();
        let mut pending = record();
        assert!(!pending.expire_if_stale(now, now));

        let mut running = record();
        running.begin_run(LeaseToken::new("d-1"), ttl(), now).unwrap();
        assert!(!running.expire_if_stale(now, now));
        assert!(running.expire_if_stale(now + Duration::seconds(120), now));
        assert_eq!(running.status, ForecastStatus::Failed);
    }

    #[test]
    fn api_json_hides_lease_and_uses_spec_names() {
        let mut r = record();
        r.begin_run(LeaseToken::new("secret-delivery"), ttl(), Utc::now()).unwrap();
        let v = serde_json::to_value(&r).unwrap();

        assert_eq!(v["type"], "egg_production");
        assert_eq!(v["status"], "running");
        assert!(v["outputJson"].is_null());
        assert!(v.get("lease").is_none());
        assert!(!v.to_string().contains("secret-delivery"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Begin(u8, i64),
        Complete(u8),
        Fail(u8),
        FailPending,
        Sweep(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3, 0i64..200).prop_map(|(t, s)| Op::Begin(t, s)),
            (0u8..3).prop_map(Op::Complete),
            (0u8..3).prop_map(Op::Fail),
            Just(Op::FailPending),
            (0i64..200).prop_map(Op::Sweep),
        ]
    }

    proptest! {
        #[test]
        fn status_is_monotonic_and_result_invariant_holds(ops in proptest::collection::vec(op(), 0..40)) {
            let mut r = record();
            let base = Utc::now();
            let mut last_rank = r.status.rank();
            let mut terminal_seen: Option<ForecastStatus> = None;

            for op in ops {
                let token = |t: u8| LeaseToken::new(format!("d-{t}"));
                match op {
                    Op::Begin(t, s) => { let _ = r.begin_run(token(t), ttl(), base + Duration::seconds(s)); }
                    Op::Complete(t) => { let _ = r.complete(&token(t), output(), base); }
                    Op::Fail(t) => { let _ = r.fail(&token(t), "boom", base); }
                    Op::FailPending => { let _ = r.fail_pending("enqueue", base); }
                    Op::Sweep(s) => { r.expire_if_stale(base + Duration::seconds(s), base); }
                }

                prop_assert!(r.status.rank() >= last_rank);
                prop_assert!(r.result_invariant_holds());
                if let Some(t) = terminal_seen {
                    prop_assert_eq!(r.status, t);
                }
                if r.status.is_terminal() {
                    terminal_seen = Some(r.status);
                }
                last_rank = r.status.rank();
            }
        }
    }
}
