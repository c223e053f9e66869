//! Sliding-history rate policies.
//!
//! A policy keeps, per cache key, the timestamps of the requests it admitted inside the
//! current window (newest first) in the shared [`CounterStore`]. A request is denied once the
//! window already holds `num_requests` entries.

use crate::clock::Clock;
use crate::config::ThrottleSettings;
use crate::error::{Error, Result};
use crate::throttling::policy::{get_ident, PolicyInit, PolicyType, ThrottlePolicy};
use crate::throttling::store::CounterStore;
use crate::user::User;
use axum::http::request::Parts;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::warn;

static RATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*/\s*([A-Za-z]+)\s*$").expect("rate pattern is a valid regex")
});

/// `<num>/<period>`, where only the first letter of the period counts: `10/min`, `1000/day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rate {
    pub num_requests: u64,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl FromStr for Rate {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = || Error::Configuration(format!("invalid throttle rate `{}`", raw));
        let captures = RATE_PATTERN.captures(raw).ok_or_else(invalid)?;

        let num_requests: u64 = captures[1].parse().map_err(|_| invalid())?;
        let secs = match captures[2].chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('s') => 1,
            Some('m') => 60,
            Some('h') => 3600,
            Some('d') => 86400,
            _ => return Err(invalid()),
        };

        Ok(Rate {
            num_requests,
            duration: Duration::from_secs(secs),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keying {
    /// Only anonymous users, keyed by client ident.
    Anonymous,
    /// Authenticated users by id, everyone else by client ident.
    User,
}

/// Shared engine behind the built-in rate policies.
pub struct SimpleRateThrottle {
    scope: String,
    rate: Option<Rate>,
    keying: Keying,
    user: User,
    num_proxies: Option<u32>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    history: Vec<f64>,
    now: f64,
}

impl SimpleRateThrottle {
    fn new(init: PolicyInit<'_>, scope: String, keying: Keying) -> Result<Self> {
        let settings = init.services.get::<ThrottleSettings>()?;
        let store = init.services.get::<dyn CounterStore>()?;
        let clock = init.services.get::<dyn Clock>()?;
        let rate = Self::configured_rate(init.options.get("rate"), &scope, &settings)?;

        Ok(Self {
            scope,
            rate,
            keying,
            user: init.user.clone(),
            num_proxies: settings.num_proxies,
            store,
            clock,
            history: Vec::new(),
            now: 0.0,
        })
    }

    /// An explicit `rate` option wins over the settings; `null` or a `none` rate disables the
    /// policy.
    fn configured_rate(
        option: Option<&Value>,
        scope: &str,
        settings: &ThrottleSettings,
    ) -> Result<Option<Rate>> {
        match option {
            Some(Value::Null) => Ok(None),
            Some(Value::String(raw)) => raw.parse().map(Some),
            Some(other) => Err(Error::Configuration(format!(
                "throttle rate must be a string, got {}",
                other
            ))),
            None => match settings.throttle_rates.get(scope) {
                Some(Some(raw)) => raw.parse().map(Some),
                Some(None) => Ok(None),
                None => Err(Error::Configuration(format!(
                    "No default throttle rate set for '{}' scope",
                    scope
                ))),
            },
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn rate(&self) -> Option<Rate> {
        self.rate
    }

    fn cache_key(&self, request: &Parts) -> Option<String> {
        let ident = match (self.keying, self.user.id()) {
            (Keying::Anonymous, Some(_)) => return None,
            (Keying::User, Some(id)) => id.to_string(),
            (_, None) => get_ident(request, self.num_proxies),
        };
        Some(format!("throttle_{}_{}", self.scope, ident))
    }
}

impl ThrottlePolicy for SimpleRateThrottle {
    fn allow_request(&mut self, request: &Parts) -> bool {
        let Some(rate) = self.rate else {
            return true;
        };
        let Some(key) = self.cache_key(request) else {
            return true;
        };

        self.now = self.clock.now();
        self.history = match self.store.get_history(&key) {
            Ok(history) => history,
            Err(err) => {
                warn!(scope = %self.scope, key = %key, error = %err, "throttle history unavailable, admitting request");
                return true;
            }
        };

        let window_start = self.now - rate.duration.as_secs_f64();
        while self
            .history
            .last()
            .is_some_and(|&oldest| oldest <= window_start)
        {
            self.history.pop();
        }

        if self.history.len() as u64 >= rate.num_requests {
            return false;
        }

        self.history.insert(0, self.now);
        if let Err(err) = self.store.set_history(&key, &self.history, rate.duration) {
            warn!(scope = %self.scope, key = %key, error = %err, "failed to record throttle history");
        }
        true
    }

    fn wait(&self) -> Option<Duration> {
        let rate = self.rate?;
        let duration = rate.duration.as_secs_f64();

        let remaining = match self.history.last() {
            Some(&oldest) => duration - (self.now - oldest),
            None => duration,
        };
        let used = u64::try_from(self.history.len()).unwrap_or(u64::MAX);
        let available = rate.num_requests.saturating_add(1).saturating_sub(used);
        if available == 0 {
            return None;
        }

        Some(Duration::from_secs_f64((remaining / available as f64).max(0.0)))
    }
}

macro_rules! rate_policy {
    ($(#[$meta:meta])* $name:ident, $label:literal, $keying:expr, $scope:expr) => {
        $(#[$meta])*
        pub struct $name(SimpleRateThrottle);

        impl $name {
            pub fn inner(&self) -> &SimpleRateThrottle {
                &self.0
            }
        }

        impl ThrottlePolicy for $name {
            fn allow_request(&mut self, request: &Parts) -> bool {
                self.0.allow_request(request)
            }

            fn wait(&self) -> Option<Duration> {
                self.0.wait()
            }
        }

        impl PolicyType for $name {
            const NAME: &'static str = $label;

            fn new(init: PolicyInit<'_>) -> Result<Self> {
                let scope: fn(&PolicyInit<'_>) -> Result<String> = $scope;
                let scope = scope(&init)?;
                SimpleRateThrottle::new(init, scope, $keying).map($name)
            }
        }
    };
}

rate_policy!(
    /// Limits anonymous clients by address; authenticated users pass untouched.
    AnonRateThrottle,
    "anon",
    Keying::Anonymous,
    |_| Ok("anon".to_string())
);

rate_policy!(
    /// Limits authenticated users by id and anonymous clients by address.
    UserRateThrottle,
    "user",
    Keying::User,
    |_| Ok("user".to_string())
);

rate_policy!(
    /// Like [`UserRateThrottle`], under the scope named by the `scope` option.
    DynamicRateThrottle,
    "dynamic",
    Keying::User,
    |init| match init.options.get("scope") {
        Some(Value::String(scope)) if !scope.is_empty() => Ok(scope.clone()),
        _ => Err(Error::Configuration(
            "DynamicRateThrottle requires a `scope` option".to_string(),
        )),
    }
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppContext;
    use crate::clock::ManualClock;
    use crate::resolver::Resolver;
    use crate::throttling::policy::PolicyOptions;
    use crate::throttling::store::InMemoryStore;
    use axum::extract::ConnectInfo;
    use axum::http::Request;
    use serde_json::json;
    use std::net::SocketAddr;

    struct Fixture {
        resolver: Resolver,
        clock: Arc<ManualClock>,
    }

    fn fixture(settings: ThrottleSettings) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let app = AppContext::builder(settings)
            .clock(clock.clone())
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap();
        Fixture {
            resolver: app.resolver(),
            clock,
        }
    }

    fn request_from(ip: [u8; 4]) -> Parts {
        let (mut parts, _) = Request::builder().uri("/").body(()).unwrap().into_parts();
        parts
            .extensions
            .insert(ConnectInfo(SocketAddr::from((ip, 1234))));
        parts
    }

    fn build<P: PolicyType>(fx: &Fixture, user: &User, options: &PolicyOptions) -> Result<P> {
        P::new(PolicyInit {
            user,
            response: None,
            options,
            services: &fx.resolver,
        })
    }

    fn options(value: Value) -> PolicyOptions {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_parse_rates() {
        assert_eq!(
            "10/min".parse::<Rate>().unwrap(),
            Rate {
                num_requests: 10,
                duration: Duration::from_secs(60)
            }
        );
        assert_eq!(
            "1000/day".parse::<Rate>().unwrap().duration,
            Duration::from_secs(86400)
        );
        assert_eq!("3/s".parse::<Rate>().unwrap().duration, Duration::from_secs(1));
        assert_eq!("5/Hour".parse::<Rate>().unwrap().duration, Duration::from_secs(3600));
        assert!("ten/min".parse::<Rate>().is_err());
        assert!("10/week".parse::<Rate>().is_err());
        assert!("10".parse::<Rate>().is_err());
    }

    #[test]
    fn test_user_rate_denies_after_limit_and_recovers() {
        let fx = fixture(ThrottleSettings::default().with_rate("user", Some("3/min")));
        let user = User::authenticated("7");
        let request = request_from([1, 2, 3, 4]);
        let opts = PolicyOptions::new();

        for _ in 0..3 {
            let mut policy: UserRateThrottle = build(&fx, &user, &opts).unwrap();
            assert!(policy.allow_request(&request));
            fx.clock.advance(1.0);
        }

        let mut policy: UserRateThrottle = build(&fx, &user, &opts).unwrap();
        assert!(!policy.allow_request(&request));
        // Oldest entry at t=1000, now t=1003, window 60s, one slot frees up.
        assert_eq!(policy.wait(), Some(Duration::from_secs(57)));

        fx.clock.advance(60.0);
        let mut policy: UserRateThrottle = build(&fx, &user, &opts).unwrap();
        assert!(policy.allow_request(&request));
    }

    #[test]
    fn test_users_are_counted_separately() {
        let fx = fixture(ThrottleSettings::default().with_rate("user", Some("1/min")));
        let request = request_from([1, 2, 3, 4]);
        let opts = PolicyOptions::new();

        let mut first: UserRateThrottle =
            build(&fx, &User::authenticated("a"), &opts).unwrap();
        assert!(first.allow_request(&request));
        let mut second: UserRateThrottle =
            build(&fx, &User::authenticated("b"), &opts).unwrap();
        assert!(second.allow_request(&request));
        let mut again: UserRateThrottle =
            build(&fx, &User::authenticated("a"), &opts).unwrap();
        assert!(!again.allow_request(&request));
    }

    #[test]
    fn test_anon_rate_ignores_authenticated_users() {
        let fx = fixture(ThrottleSettings::default().with_rate("anon", Some("1/min")));
        let request = request_from([9, 9, 9, 9]);
        let opts = PolicyOptions::new();

        for _ in 0..5 {
            let mut policy: AnonRateThrottle =
                build(&fx, &User::authenticated("1"), &opts).unwrap();
            assert!(policy.allow_request(&request));
        }

        let anonymous = User::anonymous();
        let mut policy: AnonRateThrottle = build(&fx, &anonymous, &opts).unwrap();
        assert!(policy.allow_request(&request));
        let mut policy: AnonRateThrottle = build(&fx, &anonymous, &opts).unwrap();
        assert!(!policy.allow_request(&request));

        let mut other_client: AnonRateThrottle = build(&fx, &anonymous, &opts).unwrap();
        assert!(other_client.allow_request(&request_from([8, 8, 8, 8])));
    }

    #[test]
    fn test_rate_option_overrides_settings() {
        let fx = fixture(ThrottleSettings::default());
        let opts = options(json!({ "rate": "1/min" }));
        let user = User::authenticated("x");
        let request = request_from([1, 1, 1, 1]);

        let mut policy: UserRateThrottle = build(&fx, &user, &opts).unwrap();
        assert_eq!(policy.inner().rate().unwrap().num_requests, 1);
        assert!(policy.allow_request(&request));
        let mut policy: UserRateThrottle = build(&fx, &user, &opts).unwrap();
        assert!(!policy.allow_request(&request));
    }

    #[test]
    fn test_disabled_scope_always_admits() {
        let fx = fixture(ThrottleSettings::default().with_rate("user", None));
        let user = User::authenticated("x");
        let request = request_from([1, 1, 1, 1]);
        for _ in 0..10 {
            let mut policy: UserRateThrottle =
                build(&fx, &user, &PolicyOptions::new()).unwrap();
            assert!(policy.allow_request(&request));
        }
    }

    #[test]
    fn test_dynamic_scope_from_options() {
        let fx = fixture(ThrottleSettings::default().with_rate("uploads", Some("2/h")));
        let user = User::authenticated("u");

        let policy: DynamicRateThrottle =
            build(&fx, &user, &options(json!({ "scope": "uploads" }))).unwrap();
        assert_eq!(policy.inner().scope(), "uploads");
        assert_eq!(policy.inner().rate().unwrap().num_requests, 2);

        assert!(matches!(
            build::<DynamicRateThrottle>(&fx, &user, &PolicyOptions::new()),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            build::<DynamicRateThrottle>(&fx, &user, &options(json!({ "scope": "unknown" }))),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_wait_without_history_is_full_window() {
        let fx = fixture(ThrottleSettings::default().with_rate("user", Some("0/min")));
        let user = User::authenticated("z");
        let mut policy: UserRateThrottle = build(&fx, &user, &PolicyOptions::new()).unwrap();
        assert!(!policy.allow_request(&request_from([1, 1, 1, 1])));
        assert_eq!(policy.wait(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_wait_with_rate_beyond_i64() {
        let fx = fixture(ThrottleSettings::default());
        let opts = options(json!({ "rate": format!("{}/s", u64::MAX) }));
        let user = User::authenticated("big");
        let request = request_from([1, 1, 1, 1]);

        let mut policy: UserRateThrottle = build(&fx, &user, &opts).unwrap();
        assert_eq!(policy.inner().rate().unwrap().num_requests, u64::MAX);
        assert!(policy.allow_request(&request));
        let wait = policy.wait().unwrap();
        assert!(wait < Duration::from_millis(1));
    }
}
