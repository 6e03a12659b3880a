//! Job timeout budgeting from request shape.
//!
//! A job runs in two timed stages: attachment preprocessing, then the
//! model invocation. Attachment modalities are preprocessed concurrently,
//! so the attachment stage costs as much as its slowest *modality*, and
//! the number of attachments within a modality never multiplies time.
//! Each modality's cost is the worst case of its retry policy.
//!
//! ```text
//! total = max(stage(m) for m present) + llm_invocation + overhead
//! total = min(total, platform_ceiling)
//! ```
//!
//! The ceiling may never be lower than `llm_invocation + overhead`; such a
//! configuration is rejected when the calculator is built.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Development defaults
// ---------------------------------------------------------------------------

/// Per-attempt cost of the image-analysis stage (vision model call).
pub const DEFAULT_IMAGE_ATTEMPT: Duration = Duration::from_secs(60);
/// Per-attempt cost of the audio stage (fetch plus transcription).
pub const DEFAULT_AUDIO_ATTEMPT: Duration = Duration::from_secs(90);
/// Model invocation budget, already inclusive of its own retries.
pub const DEFAULT_LLM_INVOCATION: Duration = Duration::from_secs(480);
/// Queue, network and storage time outside the timed stages.
pub const DEFAULT_OVERHEAD: Duration = Duration::from_secs(15);
/// Longest runtime the worker infrastructure honours per job.
pub const DEFAULT_PLATFORM_CEILING: Duration = Duration::from_secs(900);

// ---------------------------------------------------------------------------
// Request shape
// ---------------------------------------------------------------------------

/// Attachment category with its own preprocessing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Image,
    Audio,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Image, Modality::Audio];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
        }
    }
}

/// How many attachments of each modality a request carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentProfile {
    pub image_count: u32,
    pub audio_count: u32,
}

impl AttachmentProfile {
    pub fn new(image_count: u32, audio_count: u32) -> Self {
        Self {
            image_count,
            audio_count,
        }
    }

    pub fn count(&self, modality: Modality) -> u32 {
        match modality {
            Modality::Image => self.image_count,
            Modality::Audio => self.audio_count,
        }
    }

    /// Modalities with at least one attachment.
    pub fn present(&self) -> impl Iterator<Item = Modality> + '_ {
        Modality::ALL
            .into_iter()
            .filter(move |m| self.count(*m) > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.present().next().is_none()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Cost model for one preprocessing stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageCost {
    /// Time one attempt may take before it is abandoned.
    pub per_attempt: Duration,
    /// How the stage retries a failed attempt.
    pub retry: BackoffPolicy,
}

impl StageCost {
    pub fn new(per_attempt: Duration) -> Self {
        Self {
            per_attempt,
            retry: BackoffPolicy::default(),
        }
    }

    /// Time the stage may consume if every attempt times out.
    pub fn worst_case(&self) -> Duration {
        self.retry.total_elapsed(self.per_attempt)
    }

    pub fn validate(&self, stage: &str) -> Result<(), CoreError> {
        if self.per_attempt.is_zero() {
            return Err(CoreError::Configuration(format!(
                "{stage} stage per-attempt timeout must be greater than zero"
            )));
        }
        self.retry
            .validate()
            .map_err(|e| CoreError::Configuration(format!("{stage} stage retry policy: {e}")))
    }
}

/// Injected tuning for [`TimeoutCalculator`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub image_stage: StageCost,
    pub audio_stage: StageCost,
    pub llm_invocation: Duration,
    pub overhead: Duration,
    pub platform_ceiling: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            image_stage: StageCost::new(DEFAULT_IMAGE_ATTEMPT),
            audio_stage: StageCost::new(DEFAULT_AUDIO_ATTEMPT),
            llm_invocation: DEFAULT_LLM_INVOCATION,
            overhead: DEFAULT_OVERHEAD,
            platform_ceiling: DEFAULT_PLATFORM_CEILING,
        }
    }
}

impl BudgetConfig {
    pub fn stage(&self, modality: Modality) -> &StageCost {
        match modality {
            Modality::Image => &self.image_stage,
            Modality::Audio => &self.audio_stage,
        }
    }

    /// Smallest total the ceiling may clamp to: enough for the model call
    /// plus overhead with no attachments at all.
    pub fn minimum_total(&self) -> Duration {
        self.llm_invocation.saturating_add(self.overhead)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.image_stage.validate(Modality::Image.as_str())?;
        self.audio_stage.validate(Modality::Audio.as_str())?;
        if self.llm_invocation.is_zero() {
            return Err(CoreError::Configuration(
                "llm invocation budget must be greater than zero".into(),
            ));
        }
        if self.platform_ceiling < self.minimum_total() {
            return Err(CoreError::Configuration(format!(
                "platform ceiling {}ms is below the minimum job budget {}ms \
                 (llm invocation + overhead)",
                self.platform_ceiling.as_millis(),
                self.minimum_total().as_millis(),
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Per-request deadline breakdown, in milliseconds.
///
/// Computed once at submission and handed unchanged to the queue and to
/// the completion waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutBudget {
    pub total_ms: u64,
    pub llm_invocation_ms: u64,
    pub attachment_stage_ms: u64,
    pub overhead_ms: u64,
    /// Worst case of the image stage, or 0 when no images are attached.
    pub image_stage_ms: u64,
    /// Worst case of the audio stage, or 0 when no audio is attached.
    pub audio_stage_ms: u64,
    /// Whether `total_ms` was cut down to the platform ceiling.
    pub clamped: bool,
}

impl TimeoutBudget {
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms)
    }

    /// Sum of the stages before the ceiling was applied.
    pub fn unclamped_ms(&self) -> u64 {
        self.attachment_stage_ms
            .saturating_add(self.llm_invocation_ms)
            .saturating_add(self.overhead_ms)
    }
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

/// Validated budget calculator.
///
/// Construction fails fast on any inconsistent configuration; afterwards
/// [`compute_job_timeout`](Self::compute_job_timeout) is infallible and
/// depends only on the attachment profile.
#[derive(Debug, Clone)]
pub struct TimeoutCalculator {
    config: BudgetConfig,
    image_stage_ms: u64,
    audio_stage_ms: u64,
}

impl TimeoutCalculator {
    pub fn new(config: BudgetConfig) -> Result<Self, CoreError> {
        if let Err(e) = config.validate() {
            tracing::error!(error = %e, "Rejected timeout budget configuration");
            return Err(e);
        }
        Ok(Self {
            image_stage_ms: millis(config.image_stage.worst_case()),
            audio_stage_ms: millis(config.audio_stage.worst_case()),
            config,
        })
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Worst-case stage time for one modality.
    pub fn stage_ms(&self, modality: Modality) -> u64 {
        match modality {
            Modality::Image => self.image_stage_ms,
            Modality::Audio => self.audio_stage_ms,
        }
    }

    /// Compute the deadline for a request with the given attachments.
    pub fn compute_job_timeout(&self, attachments: &AttachmentProfile) -> TimeoutBudget {
        let stage_if_present = |m: Modality| {
            if attachments.count(m) > 0 {
                self.stage_ms(m)
            } else {
                0
            }
        };
        let image_stage_ms = stage_if_present(Modality::Image);
        let audio_stage_ms = stage_if_present(Modality::Audio);

        // Modalities run side by side; only the slowest one counts.
        let attachment_stage_ms = image_stage_ms.max(audio_stage_ms);
        let llm_invocation_ms = millis(self.config.llm_invocation);
        let overhead_ms = millis(self.config.overhead);
        let ceiling_ms = millis(self.config.platform_ceiling);

        let unclamped = attachment_stage_ms
            .saturating_add(llm_invocation_ms)
            .saturating_add(overhead_ms);
        let clamped = unclamped > ceiling_ms;
        let total_ms = unclamped.min(ceiling_ms);

        if clamped {
            tracing::warn!(
                unclamped_ms = unclamped,
                ceiling_ms,
                image_count = attachments.image_count,
                audio_count = attachments.audio_count,
                "Job budget clamped to platform ceiling",
            );
        } else {
            tracing::debug!(
                total_ms,
                attachment_stage_ms,
                image_count = attachments.image_count,
                audio_count = attachments.audio_count,
                "Computed job budget",
            );
        }

        TimeoutBudget {
            total_ms,
            llm_invocation_ms,
            attachment_stage_ms,
            overhead_ms,
            image_stage_ms,
            audio_stage_ms,
            clamped,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn calculator() -> TimeoutCalculator {
        TimeoutCalculator::new(BudgetConfig::default()).expect("default config is valid")
    }

    // Default retry policy: 3 attempts, delays 1000 + 2000.
    const IMAGE_STAGE_MS: u64 = 60_000 * 3 + 3000;
    const AUDIO_STAGE_MS: u64 = 90_000 * 3 + 3000;

    #[test]
    fn no_attachments_is_llm_plus_overhead() {
        let budget = calculator().compute_job_timeout(&AttachmentProfile::default());
        assert_eq!(budget.attachment_stage_ms, 0);
        assert_eq!(budget.llm_invocation_ms, 480_000);
        assert_eq!(budget.overhead_ms, 15_000);
        assert_eq!(budget.total_ms, 495_000);
        assert!(!budget.clamped);
    }

    #[test]
    fn image_count_does_not_multiply_time() {
        let calc = calculator();
        let one = calc.compute_job_timeout(&AttachmentProfile::new(1, 0));
        let fifty = calc.compute_job_timeout(&AttachmentProfile::new(50, 0));
        assert_eq!(one, fifty);
        assert_eq!(one.attachment_stage_ms, IMAGE_STAGE_MS);
    }

    #[test]
    fn audio_count_does_not_multiply_time() {
        let calc = calculator();
        assert_eq!(
            calc.compute_job_timeout(&AttachmentProfile::new(0, 1)),
            calc.compute_job_timeout(&AttachmentProfile::new(0, 12)),
        );
    }

    #[test]
    fn both_modalities_take_the_max_not_the_sum() {
        let budget = calculator().compute_job_timeout(&AttachmentProfile::new(3, 2));
        assert_eq!(budget.image_stage_ms, IMAGE_STAGE_MS);
        assert_eq!(budget.audio_stage_ms, AUDIO_STAGE_MS);
        assert_eq!(budget.attachment_stage_ms, AUDIO_STAGE_MS);
        assert_eq!(budget.total_ms, 15_000 + 480_000 + AUDIO_STAGE_MS);
    }

    #[test]
    fn absent_modality_contributes_nothing() {
        let budget = calculator().compute_job_timeout(&AttachmentProfile::new(2, 0));
        assert_eq!(budget.audio_stage_ms, 0);
        assert_eq!(budget.total_ms, 15_000 + 480_000 + IMAGE_STAGE_MS);
    }

    #[test]
    fn total_is_clamped_to_ceiling_but_never_below_minimum() {
        let config = BudgetConfig {
            platform_ceiling: Duration::from_secs(600),
            ..Default::default()
        };
        let calc = TimeoutCalculator::new(config).expect("valid");
        let budget = calc.compute_job_timeout(&AttachmentProfile::new(1, 1));

        assert!(budget.clamped);
        assert_eq!(budget.total_ms, 600_000);
        assert!(budget.total_ms >= budget.llm_invocation_ms + budget.overhead_ms);
        assert_eq!(budget.unclamped_ms(), 15_000 + 480_000 + AUDIO_STAGE_MS);
    }

    #[test]
    fn ceiling_equal_to_minimum_is_accepted() {
        let config = BudgetConfig {
            platform_ceiling: Duration::from_millis(495_000),
            ..Default::default()
        };
        let calc = TimeoutCalculator::new(config).expect("ceiling at minimum is valid");
        let budget = calc.compute_job_timeout(&AttachmentProfile::new(1, 0));
        assert_eq!(budget.total_ms, 495_000);
    }

    #[test]
    fn ceiling_below_minimum_is_a_configuration_error() {
        let config = BudgetConfig {
            platform_ceiling: Duration::from_secs(300),
            ..Default::default()
        };
        assert_matches!(
            TimeoutCalculator::new(config),
            Err(CoreError::Configuration(msg)) if msg.contains("platform ceiling")
        );
    }

    #[test]
    fn invalid_stage_policy_is_rejected() {
        let mut config = BudgetConfig::default();
        config.audio_stage.retry.multiplier = 0.5;
        assert_matches!(
            TimeoutCalculator::new(config),
            Err(CoreError::Configuration(msg)) if msg.starts_with("audio stage")
        );

        let mut config = BudgetConfig::default();
        config.image_stage.per_attempt = Duration::ZERO;
        assert_matches!(TimeoutCalculator::new(config), Err(CoreError::Configuration(_)));

        let config = BudgetConfig {
            llm_invocation: Duration::ZERO,
            ..Default::default()
        };
        assert_matches!(TimeoutCalculator::new(config), Err(CoreError::Configuration(_)));
    }

    #[test]
    fn stage_retry_shape_feeds_worst_case() {
        let mut config = BudgetConfig::default();
        config.image_stage.retry.max_attempts = 1;
        let calc = TimeoutCalculator::new(config).expect("valid");
        assert_eq!(calc.stage_ms(Modality::Image), 60_000);
    }

    #[test]
    fn profile_reports_present_modalities() {
        assert!(AttachmentProfile::default().is_empty());
        let present: Vec<_> = AttachmentProfile::new(0, 4).present().collect();
        assert_eq!(present, vec![Modality::Audio]);
    }

    #[test]
    fn budget_serializes_with_snake_case_fields() {
        let budget = calculator().compute_job_timeout(&AttachmentProfile::default());
        let json = serde_json::to_value(budget).expect("serialization should succeed");
        assert_eq!(json["total_ms"], 495_000);
        assert_eq!(json["attachment_stage_ms"], 0);
        assert_eq!(json["clamped"], false);
    }
}
