use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::retry::{RetryBudget, RetryDecision};
use common::{BackoffConfig, ExtractionRequested, ReceiptStatus, UsageRecorded};
use sea_orm::{DatabaseConnection, DbErr, EntityTrait};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::ExtractionError;
use super::normalize::{ExtractedFields, normalize};
use super::parser::{DocumentParser, InferenceError};
use super::schema::ParsedReceipt;
use crate::config::{ExtractionConfig, InferenceConfig};
use crate::entity::receipt;
use crate::store::{self, PersistOutcome};

/// Stored error messages are cut to this many characters.
const MAX_ERROR_MESSAGE: usize = 500;

/// Persistence seam of the orchestrator.
#[async_trait]
pub trait ReceiptRecords: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<Option<receipt::Model>, DbErr>;
    async fn persist(&self, id: Uuid, fields: &ExtractedFields) -> Result<PersistOutcome, DbErr>;
    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<bool, DbErr>;
}

#[async_trait]
impl ReceiptRecords for DatabaseConnection {
    async fn load(&self, id: Uuid) -> Result<Option<receipt::Model>, DbErr> {
        receipt::Entity::find_by_id(id).one(self).await
    }

    async fn persist(&self, id: Uuid, fields: &ExtractedFields) -> Result<PersistOutcome, DbErr> {
        store::apply_extraction(self, id, fields).await
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<bool, DbErr> {
        store::mark_failed(self, id, message).await
    }
}

/// Why a run stopped without writing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The trigger event named something that is not a receipt id.
    InvalidReceiptId,
    /// The receipt was deleted before or during the run.
    Deleted,
    Cancelled,
    /// Redelivered event for a receipt that is no longer pending.
    AlreadyFinal(ReceiptStatus),
}

/// State of one extraction run. Each step consumes the current state and returns the next.
#[derive(Debug)]
pub enum RunState {
    Parsing {
        attempt: u8,
    },
    Persisting {
        extraction: ParsedReceipt,
        attempt: u8,
    },
    Done {
        receipt_id: Uuid,
    },
    Failed {
        error: ExtractionError,
    },
    Aborted {
        reason: AbortReason,
    },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done { .. } | Self::Failed { .. } | Self::Aborted { .. }
        )
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Parsing { .. } => "parsing",
            Self::Persisting { .. } => "persisting",
            Self::Done { .. } => "done",
            Self::Failed { .. } => "failed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// Limits applied to every run.
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub max_steps: u32,
    pub max_parse_attempts: u8,
    pub max_persist_attempts: u8,
    pub backoff: BackoffConfig,
    /// Upper bound on a single parse attempt.
    pub parse_timeout: Duration,
}

impl RunSettings {
    pub fn new(extraction: &ExtractionConfig, inference: &InferenceConfig) -> Self {
        Self {
            max_steps: extraction.max_steps,
            max_parse_attempts: extraction.max_parse_attempts,
            max_persist_attempts: extraction.max_persist_attempts,
            backoff: extraction.backoff,
            parse_timeout: Duration::from_secs(inference.timeout_secs),
        }
    }
}

/// Per-run context that does not change between steps.
struct Run<'a> {
    receipt_id: Uuid,
    url: &'a str,
    file_name: String,
    parse_budget: RetryBudget,
    persist_budget: RetryBudget,
}

/// Drives one receipt from `Parsing` to a terminal state.
pub struct Orchestrator {
    records: Arc<dyn ReceiptRecords>,
    parser: Arc<dyn DocumentParser>,
    settings: RunSettings,
    usage: Option<mpsc::UnboundedSender<UsageRecorded>>,
}

impl Orchestrator {
    pub fn new(
        records: Arc<dyn ReceiptRecords>,
        parser: Arc<dyn DocumentParser>,
        settings: RunSettings,
    ) -> Self {
        Self {
            records,
            parser,
            settings,
            usage: None,
        }
    }

    /// Emit a `UsageRecorded` event after every committed run.
    pub fn with_usage_sink(mut self, usage: mpsc::UnboundedSender<UsageRecorded>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Execute one run and return its terminal state.
    ///
    /// Unrecoverable failures are recorded on the receipt before returning, so callers only
    /// need to log the result.
    #[instrument(skip(self, event), fields(receipt_id = %event.receipt_id))]
    pub async fn run(&self, event: &ExtractionRequested) -> RunState {
        let Ok(receipt_id) = Uuid::parse_str(&event.receipt_id) else {
            warn!("Extraction event carries an invalid receipt id");
            return RunState::Aborted {
                reason: AbortReason::InvalidReceiptId,
            };
        };

        let receipt = match self.records.load(receipt_id).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => {
                info!("Receipt no longer exists, skipping extraction");
                return RunState::Aborted {
                    reason: AbortReason::Deleted,
                };
            }
            Err(e) => {
                let state = RunState::Failed { error: e.into() };
                self.finish(receipt_id, &state).await;
                return state;
            }
        };

        if receipt.status.is_final() {
            info!(status = %receipt.status, "Receipt already final, skipping extraction");
            return RunState::Aborted {
                reason: AbortReason::AlreadyFinal(receipt.status),
            };
        }
        if receipt.cancel_requested {
            if let Err(e) = self
                .records
                .mark_failed(receipt_id, "extraction cancelled")
                .await
            {
                error!(error = %e, "Failed to record cancellation");
            }
            return RunState::Aborted {
                reason: AbortReason::Cancelled,
            };
        }

        let mut run = Run {
            receipt_id,
            url: &event.url,
            file_name: receipt.file_name,
            parse_budget: RetryBudget::new(self.settings.max_parse_attempts, self.settings.backoff),
            persist_budget: RetryBudget::new(
                self.settings.max_persist_attempts,
                self.settings.backoff,
            ),
        };

        let mut state = RunState::Parsing { attempt: 1 };
        let mut steps = 0u32;

        while !state.is_terminal() {
            steps += 1;
            if steps > self.settings.max_steps {
                state = RunState::Failed {
                    error: ExtractionError::ExtractionFailed("step limit exceeded".into()),
                };
                break;
            }

            let from = state.name();
            state = match state {
                RunState::Parsing { attempt } => self.parse_step(&mut run, attempt).await,
                RunState::Persisting {
                    extraction,
                    attempt,
                } => self.persist_step(&mut run, extraction, attempt).await,
                terminal => terminal,
            };
            info!(step = steps, from, to = state.name(), "Extraction step finished");
        }

        self.finish(receipt_id, &state).await;
        state
    }

    async fn parse_step(&self, run: &mut Run<'_>, attempt: u8) -> RunState {
        let result = tokio::time::timeout(self.settings.parse_timeout, self.parser.parse(run.url))
            .await
            .unwrap_or(Err(InferenceError::Timeout(self.settings.parse_timeout)));

        let err = match result {
            Ok(extraction) => {
                info!(attempt, items = extraction.items.len(), "Receipt parsed");
                return RunState::Persisting {
                    extraction,
                    attempt: 1,
                };
            }
            Err(e) => e,
        };

        if !err.is_transient() {
            return RunState::Failed {
                error: ExtractionError::ParseFailed(err.to_string()),
            };
        }

        match run.parse_budget.record_failure() {
            RetryDecision::Retry { delay, .. } => {
                warn!(
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Parse attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                RunState::Parsing {
                    attempt: attempt + 1,
                }
            }
            RetryDecision::Exhausted => RunState::Failed {
                error: ExtractionError::ParseFailed(format!(
                    "{err} (after {} attempts)",
                    run.parse_budget.failures()
                )),
            },
        }
    }

    async fn persist_step(
        &self,
        run: &mut Run<'_>,
        extraction: ParsedReceipt,
        attempt: u8,
    ) -> RunState {
        let fields = normalize(&extraction, &run.file_name);

        match self.records.persist(run.receipt_id, &fields).await {
            Ok(PersistOutcome::Committed(saved)) => {
                self.emit_usage(&saved);
                RunState::Done {
                    receipt_id: run.receipt_id,
                }
            }
            Ok(PersistOutcome::Missing) => RunState::Aborted {
                reason: AbortReason::Deleted,
            },
            Ok(PersistOutcome::Cancelled) => RunState::Aborted {
                reason: AbortReason::Cancelled,
            },
            Ok(PersistOutcome::AlreadyFinal(status)) => RunState::Aborted {
                reason: AbortReason::AlreadyFinal(status),
            },
            Err(e) => match run.persist_budget.record_failure() {
                RetryDecision::Retry { delay, .. } => {
                    warn!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Persist attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    RunState::Persisting {
                        extraction,
                        attempt: attempt + 1,
                    }
                }
                RetryDecision::Exhausted => RunState::Failed {
                    error: ExtractionError::ExtractionFailed(format!(
                        "{e} (after {} attempts)",
                        run.persist_budget.failures()
                    )),
                },
            },
        }
    }

    fn emit_usage(&self, saved: &receipt::Model) {
        let Some(usage) = &self.usage else {
            return;
        };
        let event = UsageRecorded::scan(&saved.owner_id, saved.id.to_string());
        if usage.send(event).is_err() {
            warn!(receipt_id = %saved.id, "Metering channel closed, usage not recorded");
        }
    }

    async fn finish(&self, receipt_id: Uuid, state: &RunState) {
        match state {
            RunState::Done { .. } => info!("Extraction run completed"),
            RunState::Aborted { reason } => info!(?reason, "Extraction run aborted"),
            RunState::Failed { error } => {
                error!(error = %error, "Extraction run failed");
                let message: String = error.to_string().chars().take(MAX_ERROR_MESSAGE).collect();
                match self.records.mark_failed(receipt_id, &message).await {
                    Ok(true) => {}
                    Ok(false) => info!("Receipt was no longer pending, failure not recorded"),
                    Err(e) => error!(error = %e, "Failed to record extraction failure"),
                }
            }
            RunState::Parsing { .. } | RunState::Persisting { .. } => {}
        }
    }
}
