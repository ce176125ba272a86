// ABOUTME: drives each log event through propose -> sanitize -> evaluate -> record -> execute or notify.
// ABOUTME: also serves human approvals, which are re-evaluated in full before anything runs.

use std::sync::Arc;

use sre_agent_common::{sanitize, ExecutionOutcome, NewIncident, PolicyEngine};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::ledger::IncidentLedger;
use crate::monitor::LogEvent;
use crate::notifier::{Notification, Notifier};
use crate::proposer::CommandProposer;
use crate::runner::{CommandRunner, SecurityRejection};

/// What happened to one log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    NoProposal,
    AwaitingApproval { incident_id: u64 },
    Blocked { incident_id: u64, reason: String },
    Executed {
        incident_id: u64,
        outcome: ExecutionOutcome,
    },
}

pub struct Remediator {
    policy: Arc<PolicyEngine>,
    runner: Arc<CommandRunner>,
    ledger: Arc<dyn IncidentLedger>,
    proposer: Arc<dyn CommandProposer>,
    notifier: Arc<dyn Notifier>,
}

impl Remediator {
    pub fn new(
        policy: Arc<PolicyEngine>,
        runner: Arc<CommandRunner>,
        ledger: Arc<dyn IncidentLedger>,
        proposer: Arc<dyn CommandProposer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            policy,
            runner,
            ledger,
            proposer,
            notifier,
        }
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn ledger(&self) -> &dyn IncidentLedger {
        self.ledger.as_ref()
    }

    pub async fn handle_log_event(&self, event: &LogEvent) -> anyhow::Result<EventOutcome> {
        let Some(raw) = self.proposer.propose(&event.line).await? else {
            tracing::warn!(line = %preview(&event.line), "model proposed nothing for log line");
            return Ok(EventOutcome::NoProposal);
        };

        let command = sanitize(&raw);
        let verdict = self.policy.evaluate(&command);
        let risk_level = self.policy.risk_level(&command);

        let incident_id = self
            .ledger
            .append(NewIncident {
                log_line: event.line.clone(),
                command: command.clone(),
                auto_executed: event.auto,
                safe: verdict.safe,
                risk_level,
                block_reason: verdict.reason.clone(),
            })
            .await?;
        tracing::info!(
            incident_id,
            command,
            safe = verdict.safe,
            %risk_level,
            auto = event.auto,
            "incident recorded"
        );

        if !event.auto {
            self.send(Notification::AwaitingApproval {
                incident_id,
                log_line: event.line.clone(),
                command,
                safe: verdict.safe,
                risk_level,
            })
            .await;
            return Ok(EventOutcome::AwaitingApproval { incident_id });
        }

        if !verdict.safe {
            let reason = verdict.reason.unwrap_or_default();
            self.send(Notification::AutoExecution {
                incident_id,
                log_line: event.line.clone(),
                command,
                risk_level,
                blocked_reason: Some(reason.clone()),
            })
            .await;
            return Ok(EventOutcome::Blocked {
                incident_id,
                reason,
            });
        }

        self.send(Notification::AutoExecution {
            incident_id,
            log_line: event.line.clone(),
            command: command.clone(),
            risk_level,
            blocked_reason: None,
        })
        .await;

        match self.runner.execute_with_policy(&command, &self.policy).await {
            Ok(outcome) => {
                self.ledger
                    .record_execution(incident_id, &outcome, true)
                    .await?;
                self.send(Notification::ExecutionCompleted {
                    command,
                    outcome: outcome.clone(),
                })
                .await;
                Ok(EventOutcome::Executed {
                    incident_id,
                    outcome,
                })
            }
            // The deny-list was reloaded between the first verdict and the run.
            Err(rejection) => {
                let message = rejection.to_string();
                self.ledger
                    .record_execution(incident_id, &ExecutionOutcome::failure(&message), false)
                    .await?;
                self.send(Notification::AutoExecution {
                    incident_id,
                    log_line: event.line.clone(),
                    command,
                    risk_level: sre_agent_common::RiskLevel::Critical,
                    blocked_reason: Some(rejection.reason.clone()),
                })
                .await;
                Ok(EventOutcome::Blocked {
                    incident_id,
                    reason: rejection.reason,
                })
            }
        }
    }

    /// Runs a command a human approved. The command gets no more trust than a fresh one.
    pub async fn approve(
        &self,
        command: &str,
        incident_id: Option<u64>,
    ) -> Result<ExecutionOutcome, SecurityRejection> {
        let outcome = match self.runner.execute_with_policy(command, &self.policy).await {
            Ok(outcome) => outcome,
            Err(rejection) => {
                tracing::warn!(?incident_id, command, reason = %rejection.reason, "approval rejected by policy");
                return Err(rejection);
            }
        };

        if let Some(id) = incident_id {
            if let Err(err) = self.ledger.record_execution(id, &outcome, true).await {
                tracing::error!(incident_id = id, error = %err, "failed to record approved execution");
            }
        }
        self.send(Notification::ExecutionCompleted {
            command: command.to_string(),
            outcome: outcome.clone(),
        })
        .await;
        Ok(outcome)
    }

    /// Consumes log events until the channel closes, with at most `max_in_flight` events
    /// handled at once. Returns after every in-flight event has finished.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<LogEvent>, max_in_flight: usize) {
        let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let mut tasks = JoinSet::new();

        while let Some(event) = rx.recv().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            while let Some(joined) = tasks.try_join_next() {
                log_join_error(joined);
            }

            let remediator = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(err) = remediator.handle_log_event(&event).await {
                    tracing::error!(line = %preview(&event.line), error = %err, "failed to handle log event");
                }
            });
        }

        tracing::info!(in_flight = tasks.len(), "log event channel closed; draining");
        while let Some(joined) = tasks.join_next().await {
            log_join_error(joined);
        }
    }

    async fn send(&self, notification: Notification) {
        if let Err(err) = self.notifier.notify(&notification).await {
            tracing::error!(error = %err, "failed to send notification");
        }
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        tracing::error!(error = %err, "log event task failed");
    }
}

fn preview(line: &str) -> &str {
    sre_agent_common::truncate_chars(line, 100)
}
