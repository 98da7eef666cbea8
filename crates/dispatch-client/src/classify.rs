//! Upstream response classification
//!
//! A [`ClassificationTable`] is an ordered list of named rules. The first
//! rule whose predicate matches decides the [`Verdict`]; when none matches,
//! 2xx responses are successes and anything else is unknown.

use crate::transport::UpstreamResponse;

/// Headers carrying the upstream's per-identity rate-limit budget.
pub const RATE_LIMIT_REMAINING: &str = "x-rate-limit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-rate-limit-reset";

/// Remaining budget at or below which an identity is parked until reset.
const RATE_LIMIT_FLOOR: i64 = 5;

const CODE_RATE_LIMITED: i64 = 88;
const CODE_AUTH_REJECTED: i64 = 32;
const CODE_DEPENDENCY: i64 = 131;
const CODE_ACCESS_DENIED: i64 = 326;

/// Classification result for one upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// `until` is the upstream's reset time in unix ms, when known.
    RateLimited { until: Option<i64> },
    Banned { reason: String },
    AuthExpired { reason: String },
    /// Stop the request; retrying elsewhere will not help.
    Abort { reason: String },
    Unknown { reason: String },
}

impl Verdict {
    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Success => "success",
            Verdict::RateLimited { .. } => "rate_limited",
            Verdict::Banned { .. } => "banned",
            Verdict::AuthExpired { .. } => "auth_expired",
            Verdict::Abort { .. } => "abort",
            Verdict::Unknown { .. } => "unknown",
        }
    }
}

/// What a rule yields on match. Reasons and reset times are filled in from
/// the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictKind {
    Success,
    RateLimited,
    Banned,
    AuthExpired,
    Abort,
    Unknown,
}

impl VerdictKind {
    pub fn resolve(self, response: &UpstreamResponse) -> Verdict {
        let reason = || describe(response);
        match self {
            VerdictKind::Success => Verdict::Success,
            VerdictKind::RateLimited => Verdict::RateLimited {
                until: reset_millis(response),
            },
            VerdictKind::Banned => Verdict::Banned { reason: reason() },
            VerdictKind::AuthExpired => Verdict::AuthExpired { reason: reason() },
            VerdictKind::Abort => Verdict::Abort { reason: reason() },
            VerdictKind::Unknown => Verdict::Unknown { reason: reason() },
        }
    }
}

/// `x-rate-limit-reset` (unix seconds) as unix ms, if positive.
fn reset_millis(response: &UpstreamResponse) -> Option<i64> {
    response
        .header_i64(RATE_LIMIT_RESET)
        .filter(|reset| *reset > 0)
        .map(|reset| reset * 1000)
}

fn describe(response: &UpstreamResponse) -> String {
    match response.error_summary() {
        Some(errors) => format!("status {}: {errors}", response.status),
        None => format!("status {}", response.status),
    }
}

type Predicate = Box<dyn Fn(&UpstreamResponse) -> bool + Send + Sync>;

struct Rule {
    name: &'static str,
    predicate: Predicate,
    kind: VerdictKind,
}

/// Ordered response classification rules.
pub struct ClassificationTable {
    rules: Vec<Rule>,
}

impl std::fmt::Debug for ClassificationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|rule| (rule.name, rule.kind)))
            .finish()
    }
}

impl Default for ClassificationTable {
    fn default() -> Self {
        default_table()
    }
}

impl ClassificationTable {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule after the existing ones.
    pub fn rule<F>(mut self, name: &'static str, kind: VerdictKind, predicate: F) -> Self
    where
        F: Fn(&UpstreamResponse) -> bool + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            name,
            predicate: Box::new(predicate),
            kind,
        });
        self
    }

    /// Insert a rule ahead of every existing one.
    pub fn prepend<F>(mut self, name: &'static str, kind: VerdictKind, predicate: F) -> Self
    where
        F: Fn(&UpstreamResponse) -> bool + Send + Sync + 'static,
    {
        self.rules.insert(
            0,
            Rule {
                name,
                predicate: Box::new(predicate),
                kind,
            },
        );
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name).collect()
    }

    /// Name of the first matching rule, or `None` for the fallback.
    pub fn matching_rule(&self, response: &UpstreamResponse) -> Option<&'static str> {
        self.rules
            .iter()
            .find(|rule| (rule.predicate)(response))
            .map(|rule| rule.name)
    }

    pub fn classify(&self, response: &UpstreamResponse) -> Verdict {
        match self.rules.iter().find(|rule| (rule.predicate)(response)) {
            Some(rule) => rule.kind.resolve(response),
            None if response.is_success() => Verdict::Success,
            None => VerdictKind::Unknown.resolve(response),
        }
    }
}

fn message_contains(response: &UpstreamResponse, needle: &str) -> bool {
    response
        .errors()
        .iter()
        .any(|(_, message)| message.contains(needle))
}

fn has_user_data(response: &UpstreamResponse) -> bool {
    response
        .json()
        .and_then(|json| json.get("data"))
        .and_then(|data| data.get("user"))
        .is_some_and(|user| !user.is_null())
}

/// Rules for an X/Twitter-style GraphQL upstream, in match order:
///
/// 1. `rate_limit_exhausted`: remaining budget ≤ 5 with a reset time
/// 2. `rate_limit_code`: error 88 while budget remains (identity-level ban)
/// 3. `access_denied`: error 326
/// 4. `auth_rejected`: error 32
/// 5. `forbidden`: 403 without error details
/// 6. `dependency_with_data`: error 131 on a 200 that still carries data
/// 7. `dependency_failure`: error 131
/// 8. `missing_content`: 200 with a "_Missing" error
/// 9. `authorization_notice`: 200 with an "Authorization" error
/// 10. `unauthorized`: 401
/// 11. `too_many_requests`: 429
/// 12. `server_error`: 5xx
pub fn default_table() -> ClassificationTable {
    ClassificationTable::empty()
        .rule("rate_limit_exhausted", VerdictKind::RateLimited, |r| {
            let remaining = r.header_i64(RATE_LIMIT_REMAINING);
            let reset = r.header_i64(RATE_LIMIT_RESET);
            matches!((remaining, reset), (Some(rem), Some(reset)) if rem <= RATE_LIMIT_FLOOR && reset > 0)
        })
        .rule("rate_limit_code", VerdictKind::Banned, |r| {
            r.has_error_code(CODE_RATE_LIMITED)
                && r.header_i64(RATE_LIMIT_REMAINING).is_some_and(|rem| rem > 0)
        })
        .rule("access_denied", VerdictKind::Banned, |r| {
            r.has_error_code(CODE_ACCESS_DENIED)
        })
        .rule("auth_rejected", VerdictKind::AuthExpired, |r| {
            r.has_error_code(CODE_AUTH_REJECTED)
        })
        .rule("forbidden", VerdictKind::AuthExpired, |r| {
            r.status == 403 && !r.has_errors()
        })
        .rule("dependency_with_data", VerdictKind::Success, |r| {
            r.status == 200 && r.has_error_code(CODE_DEPENDENCY) && has_user_data(r)
        })
        .rule("dependency_failure", VerdictKind::Abort, |r| {
            r.has_error_code(CODE_DEPENDENCY)
        })
        .rule("missing_content", VerdictKind::Success, |r| {
            r.status == 200 && message_contains(r, "_Missing")
        })
        .rule("authorization_notice", VerdictKind::Success, |r| {
            r.status == 200 && message_contains(r, "Authorization")
        })
        .rule("unauthorized", VerdictKind::AuthExpired, |r| r.status == 401)
        .rule("too_many_requests", VerdictKind::RateLimited, |r| {
            r.status == 429
        })
        .rule("server_error", VerdictKind::Unknown, |r| r.status >= 500)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn response(status: u16, body: &str) -> UpstreamResponse {
        UpstreamResponse::new(status, BTreeMap::new(), body)
    }

    fn error_body(code: i64, message: &str) -> String {
        serde_json::json!({ "errors": [{ "code": code, "message": message }] }).to_string()
    }

    #[test]
    fn plain_success() {
        let table = default_table();
        let r = response(200, r#"{"data":{}}"#).with_header(RATE_LIMIT_REMAINING, "120");
        assert_eq!(table.classify(&r), Verdict::Success);
        assert_eq!(table.matching_rule(&r), None);
    }

    #[test]
    fn exhausted_budget_parks_until_reset() {
        let table = default_table();
        let r = response(200, r#"{"data":{}}"#)
            .with_header(RATE_LIMIT_REMAINING, "5")
            .with_header(RATE_LIMIT_RESET, "1700000900");
        assert_eq!(
            table.classify(&r),
            Verdict::RateLimited {
                until: Some(1_700_000_900_000)
            }
        );
    }

    #[test]
    fn budget_without_reset_is_not_rate_limited() {
        let table = default_table();
        let r = response(200, r#"{"data":{}}"#).with_header(RATE_LIMIT_REMAINING, "0");
        assert_eq!(table.classify(&r), Verdict::Success);
    }

    #[test]
    fn rate_limit_code_with_budget_left_is_a_ban() {
        let table = default_table();
        let r = response(429, &error_body(88, "Rate limit exceeded"))
            .with_header(RATE_LIMIT_REMAINING, "40")
            .with_header(RATE_LIMIT_RESET, "1700000900");
        let verdict = table.classify(&r);
        assert_eq!(verdict.label(), "banned");
        assert_eq!(
            verdict,
            Verdict::Banned {
                reason: "status 429: (88) Rate limit exceeded".into()
            }
        );
    }

    #[test]
    fn header_exhaustion_wins_over_rate_limit_code() {
        let table = default_table();
        let r = response(429, &error_body(88, "Rate limit exceeded"))
            .with_header(RATE_LIMIT_REMAINING, "0")
            .with_header(RATE_LIMIT_RESET, "1700000900");
        assert_eq!(table.matching_rule(&r), Some("rate_limit_exhausted"));
    }

    #[test]
    fn ban_and_auth_codes() {
        let table = default_table();
        let denied = response(200, &error_body(326, "Authorization: Denied by access control"));
        assert_eq!(table.classify(&denied).label(), "banned");

        let rejected = response(401, &error_body(32, "Could not authenticate you"));
        assert_eq!(table.matching_rule(&rejected), Some("auth_rejected"));
        assert_eq!(table.classify(&rejected).label(), "auth_expired");

        let forbidden = response(403, "");
        assert_eq!(table.classify(&forbidden).label(), "auth_expired");

        let unauthorized = response(401, "");
        assert_eq!(table.matching_rule(&unauthorized), Some("unauthorized"));
    }

    #[test]
    fn dependency_error_aborts_unless_data_present() {
        let table = default_table();
        let failed = response(200, &error_body(131, "Dependency: Internal error."));
        assert_eq!(
            table.classify(&failed),
            Verdict::Abort {
                reason: "status 200: (131) Dependency: Internal error.".into()
            }
        );

        let partial = response(
            200,
            r#"{"data":{"user":{"id":"1"}},"errors":[{"code":131,"message":"Dependency: Internal error."}]}"#,
        );
        assert_eq!(table.classify(&partial), Verdict::Success);
    }

    #[test]
    fn benign_errors_on_200_are_successes() {
        let table = default_table();
        let missing = response(200, &error_body(144, "_Missing: No status found with that ID"));
        assert_eq!(table.matching_rule(&missing), Some("missing_content"));
        assert_eq!(table.classify(&missing), Verdict::Success);

        let notice = response(200, &error_body(37, "Authorization: protected tweet"));
        assert_eq!(table.classify(&notice), Verdict::Success);

        let other = response(200, &error_body(214, "BadRequest: something odd"));
        assert_eq!(table.matching_rule(&other), None);
        assert_eq!(table.classify(&other), Verdict::Success);
    }

    #[test]
    fn throttling_and_server_errors() {
        let table = default_table();
        let throttled = response(429, "").with_header(RATE_LIMIT_RESET, "1700000900");
        assert_eq!(
            table.classify(&throttled),
            Verdict::RateLimited {
                until: Some(1_700_000_900_000)
            }
        );
        assert_eq!(
            table.classify(&response(429, "")),
            Verdict::RateLimited { until: None }
        );

        let unavailable = response(503, "<html>down</html>");
        assert_eq!(
            table.classify(&unavailable),
            Verdict::Unknown {
                reason: "status 503".into()
            }
        );
    }

    #[test]
    fn unmatched_non_success_is_unknown() {
        let table = default_table();
        assert_eq!(table.classify(&response(404, "")).label(), "unknown");
        assert_eq!(table.classify(&response(304, "")).label(), "unknown");
    }

    #[test]
    fn first_matching_rule_wins() {
        let table = ClassificationTable::empty()
            .rule("teapot_abort", VerdictKind::Abort, |r| r.status == 418)
            .rule("teapot_ban", VerdictKind::Banned, |r| r.status == 418);
        assert_eq!(table.classify(&response(418, "")).label(), "abort");

        let table = table.prepend("teapot_ok", VerdictKind::Success, |r| r.status == 418);
        assert_eq!(table.classify(&response(418, "")), Verdict::Success);
        assert_eq!(
            table.rule_names(),
            vec!["teapot_ok", "teapot_abort", "teapot_ban"]
        );
    }

    #[test]
    fn default_table_order() {
        assert_eq!(
            default_table().rule_names(),
            vec![
                "rate_limit_exhausted",
                "rate_limit_code",
                "access_denied",
                "auth_rejected",
                "forbidden",
                "dependency_with_data",
                "dependency_failure",
                "missing_content",
                "authorization_notice",
                "unauthorized",
                "too_many_requests",
                "server_error",
            ]
        );
    }
}
