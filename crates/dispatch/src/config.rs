use std::str::FromStr;
use std::time::Duration;

use jobgate_core::admission::{
    AdmissionConfig, StoreFailurePolicy, DEFAULT_DEDUP_MAX_ENTRIES, DEFAULT_DEDUP_WINDOW,
};
use jobgate_core::backoff::BackoffPolicy;
use jobgate_core::budget::{BudgetConfig, StageCost};
use jobgate_core::error::CoreError;

/// Default per-attempt timeout for queue submission.
const DEFAULT_SUBMIT_ATTEMPT_MS: u64 = 5000;

/// Default interval of the dedup cache sweeper.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Dispatcher configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development. The stage
/// costs and platform ceiling are environment-specific; deployments are
/// expected to set them.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub admission: AdmissionConfig,
    /// Capacity of the in-memory dedup store.
    pub dedup_max_entries: usize,
    pub budget: BudgetConfig,
    /// Retry shape applied to queue submission.
    pub submit: StageCost,
    /// How often expired dedup marks are swept.
    pub sweep_interval: Duration,
}

impl DispatchConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default      |
    /// |----------------------------------|--------------|
    /// | `JOBGATE_DEDUP_TTL_MS`           | `5000`       |
    /// | `JOBGATE_DEDUP_MAX_ENTRIES`      | `10000`      |
    /// | `JOBGATE_DEDUP_FAILURE_POLICY`   | `fail_open`  |
    /// | `JOBGATE_RETRY_MAX_ATTEMPTS`     | `3`          |
    /// | `JOBGATE_RETRY_INITIAL_DELAY_MS` | `1000`       |
    /// | `JOBGATE_RETRY_MULTIPLIER`       | `2.0`        |
    /// | `JOBGATE_RETRY_MAX_DELAY_MS`     | `10000`      |
    /// | `JOBGATE_IMAGE_ATTEMPT_MS`       | `60000`      |
    /// | `JOBGATE_AUDIO_ATTEMPT_MS`       | `90000`      |
    /// | `JOBGATE_LLM_INVOCATION_MS`      | `480000`     |
    /// | `JOBGATE_OVERHEAD_MS`            | `15000`      |
    /// | `JOBGATE_PLATFORM_CEILING_MS`    | `900000`     |
    /// | `JOBGATE_SUBMIT_ATTEMPT_MS`      | `5000`       |
    /// | `JOBGATE_SWEEP_INTERVAL_SECS`    | `60`         |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let env = Env(&lookup);
        let budget_defaults = BudgetConfig::default();
        let retry_defaults = BackoffPolicy::default();

        let retry = BackoffPolicy {
            max_attempts: env.parse("JOBGATE_RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            initial_delay: env.millis(
                "JOBGATE_RETRY_INITIAL_DELAY_MS",
                retry_defaults.initial_delay,
            )?,
            multiplier: env.parse("JOBGATE_RETRY_MULTIPLIER", retry_defaults.multiplier)?,
            max_delay: env.millis("JOBGATE_RETRY_MAX_DELAY_MS", retry_defaults.max_delay)?,
        };

        let stage = |key: &str, default: Duration| -> Result<StageCost, CoreError> {
            Ok(StageCost {
                per_attempt: env.millis(key, default)?,
                retry,
            })
        };

        let budget = BudgetConfig {
            image_stage: stage(
                "JOBGATE_IMAGE_ATTEMPT_MS",
                budget_defaults.image_stage.per_attempt,
            )?,
            audio_stage: stage(
                "JOBGATE_AUDIO_ATTEMPT_MS",
                budget_defaults.audio_stage.per_attempt,
            )?,
            llm_invocation: env.millis(
                "JOBGATE_LLM_INVOCATION_MS",
                budget_defaults.llm_invocation,
            )?,
            overhead: env.millis("JOBGATE_OVERHEAD_MS", budget_defaults.overhead)?,
            platform_ceiling: env.millis(
                "JOBGATE_PLATFORM_CEILING_MS",
                budget_defaults.platform_ceiling,
            )?,
        };

        let admission = AdmissionConfig {
            window: env.millis("JOBGATE_DEDUP_TTL_MS", DEFAULT_DEDUP_WINDOW)?,
            on_store_failure: env.parse(
                "JOBGATE_DEDUP_FAILURE_POLICY",
                StoreFailurePolicy::FailOpen,
            )?,
        };

        let config = Self {
            admission,
            dedup_max_entries: env.parse("JOBGATE_DEDUP_MAX_ENTRIES", DEFAULT_DEDUP_MAX_ENTRIES)?,
            budget,
            submit: stage(
                "JOBGATE_SUBMIT_ATTEMPT_MS",
                Duration::from_millis(DEFAULT_SUBMIT_ATTEMPT_MS),
            )?,
            sweep_interval: Duration::from_secs(
                env.parse("JOBGATE_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every section; the first problem found is returned.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.admission.validate()?;
        self.budget.validate()?;
        self.submit.validate("submit")?;
        if self.dedup_max_entries == 0 {
            return Err(CoreError::Configuration(
                "JOBGATE_DEDUP_MAX_ENTRIES must be at least 1".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(CoreError::Configuration(
                "JOBGATE_SWEEP_INTERVAL_SECS must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Typed access to a key lookup.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, CoreError>
    where
        T::Err: std::fmt::Display,
    {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e| {
                CoreError::Configuration(format!("{key} has invalid value '{raw}': {e}"))
            }),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, CoreError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default_ms).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    fn load(pairs: &[(&str, &str)]) -> Result<DispatchConfig, CoreError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DispatchConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = load(&[]).expect("defaults are valid");
        assert_eq!(config.admission.window, Duration::from_secs(5));
        assert_eq!(config.admission.on_store_failure, StoreFailurePolicy::FailOpen);
        assert_eq!(config.dedup_max_entries, 10_000);
        assert_eq!(config.budget.llm_invocation, Duration::from_millis(480_000));
        assert_eq!(config.budget.overhead, Duration::from_millis(15_000));
        assert_eq!(config.budget.platform_ceiling, Duration::from_millis(900_000));
        assert_eq!(config.submit.per_attempt, Duration::from_millis(5000));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("JOBGATE_DEDUP_FAILURE_POLICY", "fail_closed"),
            ("JOBGATE_RETRY_MAX_ATTEMPTS", "5"),
            ("JOBGATE_IMAGE_ATTEMPT_MS", "1234"),
            ("JOBGATE_PLATFORM_CEILING_MS", "600000"),
        ])
        .expect("valid overrides");

        assert_eq!(config.admission.on_store_failure, StoreFailurePolicy::FailClosed);
        assert_eq!(config.budget.image_stage.retry.max_attempts, 5);
        assert_eq!(config.submit.retry.max_attempts, 5);
        assert_eq!(config.budget.image_stage.per_attempt, Duration::from_millis(1234));
        assert_eq!(config.budget.platform_ceiling, Duration::from_secs(600));
    }

    #[test]
    fn unparsable_value_fails_fast() {
        assert_matches!(
            load(&[("JOBGATE_OVERHEAD_MS", "soon")]),
            Err(CoreError::Configuration(msg)) if msg.contains("JOBGATE_OVERHEAD_MS")
        );
    }

    #[test]
    fn invalid_policy_values_fail_fast() {
        assert_matches!(
            load(&[("JOBGATE_RETRY_MULTIPLIER", "1.0")]),
            Err(CoreError::Configuration(_))
        );
        assert_matches!(
            load(&[("JOBGATE_RETRY_MAX_ATTEMPTS", "0")]),
            Err(CoreError::Configuration(_))
        );
        assert_matches!(
            load(&[("JOBGATE_DEDUP_FAILURE_POLICY", "maybe")]),
            Err(CoreError::Configuration(_))
        );
    }

    #[test]
    fn ceiling_below_minimum_budget_is_rejected() {
        assert_matches!(
            load(&[("JOBGATE_PLATFORM_CEILING_MS", "60000")]),
            Err(CoreError::Configuration(msg)) if msg.contains("platform ceiling")
        );
    }
}
