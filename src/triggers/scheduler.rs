//! Workflow scheduler for time-based triggers.
//!
//! Registers one job per ACTIVE workflow whose trigger node carries a
//! `schedule`. Each tick fires the workflow through the engine, so the
//! trigger's idempotency settings decide whether a tick starts a run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::engine::{Engine, FireOutcome};
use crate::error::{Error, Result};
use crate::idempotency::TriggerFiring;
use crate::workflow::{Schedule, WorkflowDefinition};

/// A schedule reduced to what the job scheduler understands.
#[derive(Debug, Clone, PartialEq)]
enum CompiledSchedule {
    /// Six-field cron expression (with seconds)
    Cron {
        expression: String,
        timezone: Option<String>,
    },
    Interval(Duration),
}

/// Manages scheduled workflow firings.
pub struct Scheduler {
    job_scheduler: Arc<Mutex<JobScheduler>>,
    /// Workflow id to its job ids
    jobs: Arc<RwLock<HashMap<String, Vec<uuid::Uuid>>>>,
    engine: Engine,
}

impl Scheduler {
    pub async fn new(engine: Engine) -> Result<Self> {
        let job_scheduler = JobScheduler::new()
            .await
            .map_err(|e| Error::Internal(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            job_scheduler: Arc::new(Mutex::new(job_scheduler)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            engine,
        })
    }

    /// Start the scheduler and register every ACTIVE workflow's schedule.
    pub async fn start(&self) -> Result<()> {
        info!("Starting workflow scheduler...");

        let workflows = self.engine.storage().list_workflows(None).await?;
        let mut scheduled_count = 0;

        for stored in workflows {
            match stored.to_definition() {
                Ok(workflow) => match self.register_workflow(&workflow).await {
                    Ok(count) => scheduled_count += count,
                    Err(e) => warn!(
                        "Failed to register schedule for workflow '{}': {}",
                        workflow.id, e
                    ),
                },
                Err(e) => warn!("Failed to parse workflow '{}': {}", stored.id, e),
            }
        }

        {
            let sched = self.job_scheduler.lock().await;
            sched
                .start()
                .await
                .map_err(|e| Error::Internal(format!("Failed to start scheduler: {}", e)))?;
        }

        info!("Scheduler started with {} job(s)", scheduled_count);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping workflow scheduler...");

        {
            let mut sched = self.job_scheduler.lock().await;
            sched
                .shutdown()
                .await
                .map_err(|e| Error::Internal(format!("Failed to stop scheduler: {}", e)))?;
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Register the trigger schedule of `workflow`. Inactive workflows and
    /// triggers without a schedule register nothing.
    ///
    /// Returns the number of jobs added.
    pub async fn register_workflow(&self, workflow: &WorkflowDefinition) -> Result<usize> {
        if !workflow.is_active() {
            return Ok(0);
        }
        let Some(schedule) = workflow.trigger_config()?.schedule else {
            return Ok(0);
        };

        let compiled = compile_schedule(&schedule)?;
        let job = create_job(&compiled, self.engine.clone(), workflow.id.clone())?;
        let job_id = job.guid();

        {
            let sched = self.job_scheduler.lock().await;
            sched
                .add(job)
                .await
                .map_err(|e| Error::Internal(format!("Failed to add scheduled job: {}", e)))?;
        }

        self.jobs
            .write()
            .await
            .entry(workflow.id.clone())
            .or_default()
            .push(job_id);

        info!("Registered schedule for '{}': {:?}", workflow.id, compiled);
        Ok(1)
    }

    /// Remove every job registered for `workflow_id`.
    pub async fn unregister_workflow(&self, workflow_id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;

        if let Some(job_ids) = jobs.remove(workflow_id) {
            let sched = self.job_scheduler.lock().await;
            for job_id in job_ids {
                if let Err(e) = sched.remove(&job_id).await {
                    warn!("Failed to remove job {}: {}", job_id, e);
                }
            }
            info!("Unregistered schedule for workflow '{}'", workflow_id);
        }

        Ok(())
    }

    /// Replace a workflow's jobs after an edit or status change.
    pub async fn reload_workflow(&self, workflow: &WorkflowDefinition) -> Result<usize> {
        self.unregister_workflow(&workflow.id).await?;
        self.register_workflow(workflow).await
    }

    pub async fn job_count(&self) -> usize {
        let jobs = self.jobs.read().await;
        jobs.values().map(|v| v.len()).sum()
    }
}

fn compile_schedule(schedule: &Schedule) -> Result<CompiledSchedule> {
    match schedule {
        Schedule::Cron {
            expression,
            timezone,
        } => {
            let fields = expression.split_whitespace().count();
            let expression = match fields {
                5 => format!("0 {}", expression.trim()),
                6 | 7 => expression.trim().to_string(),
                _ => {
                    return Err(Error::Validation(format!(
                        "Cron expression '{}' must have 5 or 6 fields",
                        expression
                    )))
                }
            };
            Ok(CompiledSchedule::Cron {
                expression,
                timezone: timezone.clone(),
            })
        }
        Schedule::Interval { every_seconds } => {
            if *every_seconds == 0 {
                return Err(Error::Validation(
                    "Interval schedule needs every_seconds > 0".into(),
                ));
            }
            Ok(CompiledSchedule::Interval(Duration::from_secs(*every_seconds)))
        }
        Schedule::DayOfMonth { days, at, timezone } => {
            if days.is_empty() || days.iter().any(|d| !(1..=31).contains(d)) {
                return Err(Error::Validation(format!(
                    "day_of_month days must be within 1-31, got {:?}",
                    days
                )));
            }
            let time = NaiveTime::parse_from_str(at, "%H:%M").map_err(|_| {
                Error::Validation(format!("day_of_month time '{}' is not HH:MM", at))
            })?;

            let mut days = days.clone();
            days.sort_unstable();
            days.dedup();
            let days = days
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",");

            Ok(CompiledSchedule::Cron {
                expression: format!("0 {} {} {} * *", time.minute(), time.hour(), days),
                timezone: timezone.clone(),
            })
        }
    }
}

fn create_job(schedule: &CompiledSchedule, engine: Engine, workflow_id: String) -> Result<Job> {
    match schedule {
        CompiledSchedule::Interval(every) => {
            Job::new_repeated_async(*every, move |_uuid, _lock| {
                Box::pin(fire_scheduled(engine.clone(), workflow_id.clone()))
            })
            .map_err(|e| Error::Internal(format!("Failed to create interval job: {}", e)))
        }
        CompiledSchedule::Cron {
            expression,
            timezone,
        } => match timezone.as_deref().map(parse_timezone).transpose()? {
            None | Some(CronTimezone::Utc) => create_cron_job(expression, Utc, engine, workflow_id),
            Some(CronTimezone::FixedOffset(offset)) => {
                create_cron_job(expression, offset, engine, workflow_id)
            }
            Some(CronTimezone::Named(tz)) => create_cron_job(expression, tz, engine, workflow_id),
        },
    }
}

fn create_cron_job<TZ: TimeZone + Send + Sync + 'static>(
    expression: &str,
    timezone: TZ,
    engine: Engine,
    workflow_id: String,
) -> Result<Job> {
    Job::new_async_tz(expression, timezone, move |_uuid, _lock| {
        Box::pin(fire_scheduled(engine.clone(), workflow_id.clone()))
    })
    .map_err(|e| Error::Validation(format!("Invalid cron expression '{}': {}", expression, e)))
}

async fn fire_scheduled(engine: Engine, workflow_id: String) {
    info!("Scheduled trigger firing for workflow '{}'", workflow_id);

    match engine
        .fire(&workflow_id, TriggerFiring::schedule(Utc::now()))
        .await
    {
        Ok(FireOutcome::Started { execution_id, .. }) => {
            info!("Scheduled execution {} of '{}' started", execution_id, workflow_id);
        }
        Ok(FireOutcome::Duplicate {
            existing_execution_id,
            ..
        }) => {
            info!(
                "Scheduled firing of '{}' deduplicated against execution {}",
                workflow_id, existing_execution_id
            );
        }
        Err(e) => error!("Scheduled firing of '{}' failed: {}", workflow_id, e),
    }
}

enum CronTimezone {
    Utc,
    FixedOffset(FixedOffset),
    Named(Tz),
}

fn parse_timezone(raw: &str) -> Result<CronTimezone> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("utc") {
        return Ok(CronTimezone::Utc);
    }

    if let Ok(tz) = trimmed.parse::<Tz>() {
        return Ok(CronTimezone::Named(tz));
    }

    if let Some(offset) = parse_fixed_offset(trimmed) {
        return Ok(CronTimezone::FixedOffset(offset));
    }

    Err(Error::Validation(format!(
        "Invalid timezone '{}'. Use an IANA name (e.g. 'Asia/Kolkata') or UTC offset (e.g. '+05:30')",
        raw
    )))
}

fn parse_fixed_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None if rest.len() == 4 => (rest[0..2].parse::<i32>().ok()?, rest[2..4].parse::<i32>().ok()?),
        None => return None,
    };

    if hours > 23 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{RecordingDb, RecordingNotifications};
    use crate::actions::ActionRegistry;
    use crate::engine::EngineConfig;
    use crate::nodes::NodeRegistry;
    use crate::storage::SqliteStorage;
    use serde_json::json;

    fn engine() -> Engine {
        let db = Arc::new(RecordingDb::default());
        let actions = Arc::new(ActionRegistry::new(
            Arc::new(RecordingNotifications::default()),
            db.clone(),
        ));
        Engine::new(
            SqliteStorage::open_in_memory().unwrap(),
            NodeRegistry::new(actions, db, 2),
            EngineConfig::default(),
        )
    }

    fn workflow(trigger_config: serde_json::Value) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "id": "nightly",
            "nodes": [{"id": "start", "type": "TRIGGER", "config": trigger_config}]
        }))
        .unwrap()
    }

    #[test]
    fn test_five_field_cron_gets_seconds() {
        let compiled = compile_schedule(&Schedule::Cron {
            expression: "0 9 * * 1-5".into(),
            timezone: None,
        })
        .unwrap();
        assert_eq!(
            compiled,
            CompiledSchedule::Cron {
                expression: "0 0 9 * * 1-5".into(),
                timezone: None
            }
        );
    }

    #[test]
    fn test_day_of_month_compiles_to_cron() {
        let compiled = compile_schedule(&Schedule::DayOfMonth {
            days: vec![15, 1, 15],
            at: "09:30".into(),
            timezone: Some("Asia/Kolkata".into()),
        })
        .unwrap();
        assert_eq!(
            compiled,
            CompiledSchedule::Cron {
                expression: "0 30 9 1,15 * *".into(),
                timezone: Some("Asia/Kolkata".into())
            }
        );
    }

    #[test]
    fn test_invalid_schedules_are_rejected() {
        assert!(compile_schedule(&Schedule::Interval { every_seconds: 0 }).is_err());
        assert!(compile_schedule(&Schedule::DayOfMonth {
            days: vec![32],
            at: "09:00".into(),
            timezone: None
        })
        .is_err());
        assert!(compile_schedule(&Schedule::DayOfMonth {
            days: vec![1],
            at: "9am".into(),
            timezone: None
        })
        .is_err());
        assert!(compile_schedule(&Schedule::Cron {
            expression: "* *".into(),
            timezone: None
        })
        .is_err());
    }

    #[test]
    fn test_parse_timezone_variants() {
        assert!(matches!(parse_timezone("Asia/Kolkata").unwrap(), CronTimezone::Named(_)));
        assert!(matches!(parse_timezone("utc").unwrap(), CronTimezone::Utc));
        assert!(matches!(parse_timezone("+05:30").unwrap(), CronTimezone::FixedOffset(_)));
        assert!(matches!(parse_timezone("-0800").unwrap(), CronTimezone::FixedOffset(_)));
        assert!(parse_timezone("not-a-real-tz").is_err());
        assert!(parse_fixed_offset("+25:00").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_register_and_unregister() {
        let scheduler = Scheduler::new(engine()).await.unwrap();

        let cron = workflow(json!({"schedule": {"type": "cron", "expression": "0 9 * * *"}}));
        assert_eq!(scheduler.register_workflow(&cron).await.unwrap(), 1);
        assert_eq!(scheduler.job_count().await, 1);

        let interval = workflow(json!({"schedule": {"type": "interval", "every_seconds": 60}}));
        assert_eq!(scheduler.reload_workflow(&interval).await.unwrap(), 1);
        assert_eq!(scheduler.job_count().await, 1);

        scheduler.unregister_workflow("nightly").await.unwrap();
        assert_eq!(scheduler.job_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unscheduled_or_inactive_registers_nothing() {
        let scheduler = Scheduler::new(engine()).await.unwrap();

        assert_eq!(
            scheduler
                .register_workflow(&workflow(json!({"event_name": "lead.created"})))
                .await
                .unwrap(),
            0
        );

        let mut inactive = workflow(json!({"schedule": {"type": "interval", "every_seconds": 5}}));
        inactive.status = crate::workflow::WorkflowStatus::Inactive;
        assert_eq!(scheduler.register_workflow(&inactive).await.unwrap(), 0);
        assert_eq!(scheduler.job_count().await, 0);
    }
}
