use std::process::ExitCode;

use jobgate_core::budget::{AttachmentProfile, TimeoutCalculator};
use jobgate_dispatch::DispatchConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Attachment mixes whose budgets are logged at startup.
const SAMPLE_PROFILES: [(u32, u32); 4] = [(0, 0), (1, 0), (0, 1), (2, 1)];

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "jobgate_dispatch=debug,jobgate_events=debug,jobgate_core=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match DispatchConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid dispatcher configuration");
            return ExitCode::FAILURE;
        }
    };

    let calculator = match TimeoutCalculator::new(config.budget) {
        Ok(calculator) => calculator,
        Err(e) => {
            tracing::error!(error = %e, "Invalid timeout budget configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        dedup_window_ms = config.admission.window.as_millis() as u64,
        on_store_failure = config.admission.on_store_failure.as_str(),
        dedup_max_entries = config.dedup_max_entries,
        platform_ceiling_ms = config.budget.platform_ceiling.as_millis() as u64,
        "Dispatcher configuration valid",
    );

    for (images, audio) in SAMPLE_PROFILES {
        let budget = calculator.compute_job_timeout(&AttachmentProfile::new(images, audio));
        tracing::info!(
            images,
            audio,
            total_ms = budget.total_ms,
            attachment_stage_ms = budget.attachment_stage_ms,
            clamped = budget.clamped,
            "Sample job budget",
        );
    }

    ExitCode::SUCCESS
}
