use crate::database::IdentityStore;
use crate::security::identity::Identity;
use chrono::{DateTime, Datelike, Duration, Local, NaiveTime, TimeZone, Utc, Weekday};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    Minute,
    Weekly,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Weekly => "weekly",
        }
    }
}

/// Quota snapshot returned with an allowed request.
#[derive(Debug, Clone, Serialize)]
pub struct RateStatus {
    pub plan: String,
    pub weekly_limit: i64,
    pub minute_limit: i64,
    pub weekly_used: i64,
    pub minute_used: i64,
}

/// Structured denial handed to the dispatcher for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDenial {
    pub limit_type: LimitType,
    pub plan: String,
    pub weekly_limit: i64,
    pub minute_limit: i64,
    pub weekly_used: i64,
    pub minute_used: i64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum RateDecision {
    Allowed(RateStatus),
    Denied(Box<RateLimitDenial>),
}

/// Two-window quota check against the usage log tables.
///
/// The limiter never increments anything itself; the post-hoc usage log
/// write is the source of truth for the next request's count. Backend
/// failures fail open.
pub struct RateLimiter {
    store: Arc<dyn IdentityStore>,
    week_start: Weekday,
    week_boundary_utc: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn IdentityStore>, week_start: Weekday, week_boundary_utc: bool) -> Self {
        Self {
            store,
            week_start,
            week_boundary_utc,
        }
    }

    pub async fn check(&self, identity: &Identity) -> RateDecision {
        self.check_at(identity, Utc::now()).await
    }

    /// Deterministic given `(identity, now, log table contents)`.
    pub async fn check_at(&self, identity: &Identity, now: DateTime<Utc>) -> RateDecision {
        let limits = identity.plan.limits();
        let week_since = start_of_week(now, self.week_start, self.week_boundary_utc);
        let minute_since = now - Duration::seconds(60);

        let (week_result, minute_result) = tokio::join!(
            self.store.count_events(&identity.user_id, week_since),
            self.store.count_events(&identity.user_id, minute_since),
        );

        let (weekly_used, minute_used) = match (week_result, minute_result) {
            (Ok(w), Ok(m)) => (w, m),
            (Err(e), _) | (_, Err(e)) => {
                warn!(
                    "Rate-limit backend error for {}, failing open: {}",
                    identity.user_id, e
                );
                return RateDecision::Allowed(RateStatus {
                    plan: "unknown".to_string(),
                    weekly_limit: -1,
                    minute_limit: -1,
                    weekly_used: -1,
                    minute_used: -1,
                });
            }
        };

        let minute_ok = limits.minute == -1 || minute_used < limits.minute;
        let weekly_ok = limits.weekly == -1 || weekly_used < limits.weekly;

        debug!(
            user = %identity.user_id,
            weekly_used,
            minute_used,
            "Rate-limit check"
        );

        if minute_ok && weekly_ok {
            return RateDecision::Allowed(RateStatus {
                plan: identity.plan.as_str().to_string(),
                weekly_limit: limits.weekly,
                minute_limit: limits.minute,
                weekly_used,
                minute_used,
            });
        }

        // Minute failures take precedence when both windows are exhausted.
        let (limit_type, reset_at) = if !minute_ok {
            (LimitType::Minute, next_minute(now))
        } else {
            (LimitType::Weekly, week_since + Duration::days(7))
        };

        RateDecision::Denied(Box::new(RateLimitDenial {
            limit_type,
            plan: identity.plan.as_str().to_string(),
            weekly_limit: limits.weekly,
            minute_limit: limits.minute,
            weekly_used,
            minute_used,
            reset_at,
        }))
    }
}

/// Most recent `week_start` midnight at or before `now`.
pub fn start_of_week(now: DateTime<Utc>, week_start: Weekday, use_utc: bool) -> DateTime<Utc> {
    if use_utc {
        let days_back = (now.weekday().num_days_from_monday() as i64
            - week_start.num_days_from_monday() as i64)
            .rem_euclid(7);
        let date = now.date_naive() - Duration::days(days_back);
        date.and_time(NaiveTime::MIN).and_utc()
    } else {
        let local = now.with_timezone(&Local);
        let days_back = (local.weekday().num_days_from_monday() as i64
            - week_start.num_days_from_monday() as i64)
            .rem_euclid(7);
        let date = local.date_naive() - Duration::days(days_back);
        match Local
            .from_local_datetime(&date.and_time(NaiveTime::MIN))
            .earliest()
        {
            Some(boundary) => boundary.with_timezone(&Utc),
            // DST gap at midnight; fall back to the UTC boundary.
            None => date.and_time(NaiveTime::MIN).and_utc(),
        }
    }
}

/// Next whole-minute boundary strictly after `now`.
pub fn next_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    let next = (now.timestamp().div_euclid(60) + 1) * 60;
    DateTime::from_timestamp(next, 0).unwrap_or_else(|| now + Duration::seconds(60))
}

/// Weekday from a config string; anything unrecognized means Sunday.
pub fn parse_week_start(s: &str) -> Weekday {
    match s.to_lowercase().as_str() {
        "monday" | "mon" => Weekday::Mon,
        "tuesday" | "tue" => Weekday::Tue,
        "wednesday" | "wed" => Weekday::Wed,
        "thursday" | "thu" => Weekday::Thu,
        "friday" | "fri" => Weekday::Fri,
        "saturday" | "sat" => Weekday::Sat,
        _ => Weekday::Sun,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::identity_repository::MockIdentityStore;
    use crate::security::identity::{IdentityKind, Plan};

    fn identity(user_id: &str, plan: Plan) -> Identity {
        Identity {
            kind: IdentityKind::Token,
            user_id: user_id.to_string(),
            plan,
            token_prefix: None,
        }
    }

    fn limiter_with_counts(weekly: i64, minute: i64) -> RateLimiter {
        let mut store = MockIdentityStore::new();
        store.expect_count_events().returning(move |_, since| {
            // The minute window opens 60 s before "now"; the week window is
            // always older than that.
            let now = fixed_now();
            if since >= now - Duration::seconds(60) {
                Ok(minute)
            } else {
                Ok(weekly)
            }
        });
        RateLimiter::new(Arc::new(store), Weekday::Sun, true)
    }

    // Wednesday 2026-07-29 15:30:45 UTC.
    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-29T15:30:45Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn week_starts_on_previous_sunday_midnight() {
        let start = start_of_week(fixed_now(), Weekday::Sun, true);
        assert_eq!(start.to_rfc3339(), "2026-07-26T00:00:00+00:00");
    }

    #[test]
    fn week_start_on_boundary_day_is_same_day() {
        let sunday = DateTime::parse_from_rfc3339("2026-07-26T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let start = start_of_week(sunday, Weekday::Sun, true);
        assert_eq!(start.to_rfc3339(), "2026-07-26T00:00:00+00:00");
    }

    #[test]
    fn configurable_week_start_is_honored() {
        let start = start_of_week(fixed_now(), Weekday::Mon, true);
        assert_eq!(start.to_rfc3339(), "2026-07-27T00:00:00+00:00");
    }

    #[test]
    fn next_minute_is_a_whole_boundary() {
        let reset = next_minute(fixed_now());
        assert_eq!(reset.to_rfc3339(), "2026-07-29T15:31:00+00:00");
    }

    #[tokio::test]
    async fn allows_request_under_both_quotas() {
        let limiter = limiter_with_counts(3, 0);
        let decision = limiter
            .check_at(&identity("u1", Plan::Hobby), fixed_now())
            .await;

        match decision {
            RateDecision::Allowed(status) => {
                assert_eq!(status.plan, "hobby");
                assert_eq!(status.weekly_used, 3);
                assert_eq!(status.minute_used, 0);
            }
            RateDecision::Denied(_) => panic!("expected allow"),
        }
    }

    #[tokio::test]
    async fn hobby_weekly_quota_denies_with_week_reset() {
        let limiter = limiter_with_counts(10, 0);
        let decision = limiter
            .check_at(&identity("u1", Plan::Hobby), fixed_now())
            .await;

        match decision {
            RateDecision::Denied(denial) => {
                assert_eq!(denial.limit_type, LimitType::Weekly);
                assert_eq!(denial.plan, "hobby");
                assert_eq!(denial.weekly_limit, 10);
                assert_eq!(denial.reset_at.to_rfc3339(), "2026-08-02T00:00:00+00:00");
            }
            RateDecision::Allowed(_) => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn pro_minute_quota_denies_with_minute_reset() {
        let limiter = limiter_with_counts(50, 20);
        let decision = limiter
            .check_at(&identity("u2", Plan::Pro), fixed_now())
            .await;

        match decision {
            RateDecision::Denied(denial) => {
                assert_eq!(denial.limit_type, LimitType::Minute);
                assert_eq!(denial.minute_limit, 20);
                assert_eq!(denial.reset_at.to_rfc3339(), "2026-07-29T15:31:00+00:00");
            }
            RateDecision::Allowed(_) => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn minute_takes_precedence_when_both_windows_exhausted() {
        let limiter = limiter_with_counts(10, 1);
        let decision = limiter
            .check_at(&identity("u1", Plan::Hobby), fixed_now())
            .await;

        match decision {
            RateDecision::Denied(denial) => assert_eq!(denial.limit_type, LimitType::Minute),
            RateDecision::Allowed(_) => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn enterprise_is_unlimited() {
        let limiter = limiter_with_counts(1_000_000, 500);
        let decision = limiter
            .check_at(&identity("big", Plan::Enterprise), fixed_now())
            .await;

        assert!(matches!(decision, RateDecision::Allowed(_)));
    }

    #[tokio::test]
    async fn backend_error_fails_open_with_unknown_plan() {
        let mut store = MockIdentityStore::new();
        store
            .expect_count_events()
            .returning(|_, _| Err(anyhow::anyhow!("db down")));
        let limiter = RateLimiter::new(Arc::new(store), Weekday::Sun, true);

        let decision = limiter
            .check_at(&identity("u1", Plan::Hobby), fixed_now())
            .await;

        match decision {
            RateDecision::Allowed(status) => {
                assert_eq!(status.plan, "unknown");
                assert_eq!(status.weekly_limit, -1);
                assert_eq!(status.minute_limit, -1);
            }
            RateDecision::Denied(_) => panic!("fail-open must allow"),
        }
    }

    #[tokio::test]
    async fn decision_is_deterministic_for_fixed_inputs() {
        let limiter = limiter_with_counts(10, 0);
        let id = identity("u1", Plan::Hobby);

        let first = limiter.check_at(&id, fixed_now()).await;
        let second = limiter.check_at(&id, fixed_now()).await;

        match (first, second) {
            (RateDecision::Denied(a), RateDecision::Denied(b)) => {
                assert_eq!(a.limit_type, b.limit_type);
                assert_eq!(a.reset_at, b.reset_at);
            }
            _ => panic!("expected identical denials"),
        }
    }

    #[test]
    fn parses_week_start_names() {
        assert_eq!(parse_week_start("monday"), Weekday::Mon);
        assert_eq!(parse_week_start("SUN"), Weekday::Sun);
        assert_eq!(parse_week_start("nonsense"), Weekday::Sun);
    }
}
