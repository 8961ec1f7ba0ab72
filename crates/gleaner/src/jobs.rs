//! `gleaner job` subcommands.

use std::io::Write;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Subcommand, ValueEnum};
use miette::Result;

use gleaner_scheduler::{
    JobManager, JobPatch, JobPriority, JobRecord, JobStatus, ScheduleRule, ScheduleType,
};

#[derive(Subcommand)]
pub enum JobCommand {
    /// Create a job that scrapes a stored configuration
    Create {
        /// Display name of the job
        name: String,

        /// Name of the fetch configuration to scrape
        config: String,

        /// Recurrence of the job; runs once, right away, when omitted
        #[arg(long, value_enum)]
        schedule_type: Option<ScheduleArg>,

        /// First run, as RFC 3339 or "YYYY-MM-DD[ HH:MM[:SS]]" in UTC (default: now)
        #[arg(long, value_parser = parse_time)]
        start_time: Option<DateTime<Utc>>,

        /// No runs after this time
        #[arg(long, value_parser = parse_time)]
        end_time: Option<DateTime<Utc>>,

        /// Days, weeks or months between runs, depending on the schedule type
        #[arg(long)]
        repeat_interval: Option<u32>,

        /// Cron expression for custom schedules
        #[arg(long)]
        cron_expression: Option<String>,

        /// Stop recurring after this many successful runs
        #[arg(long)]
        max_runs: Option<u32>,

        /// Failed attempts allowed before the job is marked failed
        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long, value_enum)]
        priority: Option<PriorityArg>,
    },

    /// List jobs, oldest first
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Only jobs scraping this configuration
        #[arg(long)]
        config: Option<String>,

        /// Print every field of each job
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show every field of one job
    Show { id: String },

    /// Queue a job for the scheduler's next poll
    Run { id: String },

    /// Stop a pending or scheduled job from running
    Cancel { id: String },

    /// Delete a job permanently
    Delete {
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScheduleArg {
    Once,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl From<ScheduleArg> for ScheduleType {
    fn from(arg: ScheduleArg) -> Self {
        match arg {
            ScheduleArg::Once => ScheduleType::Once,
            ScheduleArg::Daily => ScheduleType::Daily,
            ScheduleArg::Weekly => ScheduleType::Weekly,
            ScheduleArg::Monthly => ScheduleType::Monthly,
            ScheduleArg::Custom => ScheduleType::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<StatusArg> for JobStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => JobStatus::Pending,
            StatusArg::Scheduled => JobStatus::Scheduled,
            StatusArg::Running => JobStatus::Running,
            StatusArg::Completed => JobStatus::Completed,
            StatusArg::Failed => JobStatus::Failed,
            StatusArg::Cancelled => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
}

impl From<PriorityArg> for JobPriority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => JobPriority::Low,
            PriorityArg::Normal => JobPriority::Normal,
            PriorityArg::High => JobPriority::High,
        }
    }
}

/// Parse a UTC timestamp from RFC 3339 or a plain date with optional time.
pub fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
        .ok_or_else(|| {
            format!("invalid time '{s}', expected RFC 3339 or YYYY-MM-DD[ HH:MM[:SS]]")
        })
}

/// Options for the schedule of a new job.
#[derive(Debug, Default)]
pub struct ScheduleArgs {
    pub kind: Option<ScheduleArg>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub repeat_interval: Option<u32>,
    pub cron_expression: Option<String>,
}

impl ScheduleArgs {
    /// Build the rule, or `None` for an unscheduled job.
    ///
    /// Custom schedules default to an interval of 1, since the cron
    /// expression carries the recurrence.
    pub fn build(self, now: DateTime<Utc>) -> Result<Option<ScheduleRule>> {
        let Some(kind) = self.kind else {
            if self.start_time.is_some()
                || self.end_time.is_some()
                || self.repeat_interval.is_some()
                || self.cron_expression.is_some()
            {
                return Err(miette::miette!("schedule options require --schedule-type"));
            }
            return Ok(None);
        };

        let kind = ScheduleType::from(kind);
        let repeat_interval = match kind {
            ScheduleType::Custom => self.repeat_interval.or(Some(1)),
            _ => self.repeat_interval,
        };
        let rule = ScheduleRule::new(
            kind,
            self.start_time.unwrap_or(now),
            repeat_interval,
            self.cron_expression,
        )
        .map_err(|e| miette::miette!("{}", e))?;

        Ok(Some(match self.end_time {
            Some(end) => rule.until(end),
            None => rule,
        }))
    }
}

pub async fn run(manager: &JobManager, command: JobCommand) -> Result<()> {
    match command {
        JobCommand::Create {
            name,
            config,
            schedule_type,
            start_time,
            end_time,
            repeat_interval,
            cron_expression,
            max_runs,
            max_retries,
            priority,
        } => {
            let schedule = ScheduleArgs {
                kind: schedule_type,
                start_time,
                end_time,
                repeat_interval,
                cron_expression,
            }
            .build(Utc::now())?;

            let mut job = manager
                .create_job(&name, &config, schedule)
                .await
                .map_err(|e| miette::miette!("failed to create job: {}", e))?;

            let patch = JobPatch {
                priority: priority.map(JobPriority::from),
                max_runs,
                max_retries,
                ..JobPatch::default()
            };
            if !patch.is_empty()
                && let Some(updated) = manager
                    .update_job(&job.id, patch)
                    .await
                    .map_err(|e| miette::miette!("failed to update job: {}", e))?
            {
                job = updated;
            }

            println!("Created job {}", job.id);
            println!("Status: {}", job.status);
            if let Some(next_run) = job.next_run {
                println!("Next run: {}", format_time(next_run));
            }
            Ok(())
        }

        JobCommand::List {
            status,
            config,
            verbose,
        } => {
            let jobs = manager
                .get_jobs(status.map(JobStatus::from), config.as_deref())
                .await;
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }

            print!("{}", render_table(&jobs));
            if verbose {
                for job in &jobs {
                    println!();
                    print!("{}", render_details(job));
                }
            }
            Ok(())
        }

        JobCommand::Show { id } => {
            let job = find(manager, &id).await?;
            print!("{}", render_details(&job));
            Ok(())
        }

        JobCommand::Run { id } => {
            let job = manager
                .run_now(&id)
                .await
                .map_err(|e| miette::miette!("failed to queue job: {}", e))?
                .ok_or_else(|| not_found(&id))?;
            println!(
                "Job '{}' queued; a running scheduler picks it up on its next poll.",
                job.name
            );
            Ok(())
        }

        JobCommand::Cancel { id } => {
            let job = manager
                .cancel_job(&id)
                .await
                .map_err(|e| miette::miette!("failed to cancel job: {}", e))?
                .ok_or_else(|| not_found(&id))?;
            println!("Job '{}' cancelled.", job.name);
            Ok(())
        }

        JobCommand::Delete { id, yes } => {
            let job = find(manager, &id).await?;
            if !yes && !confirm(&format!("Delete job '{}' ({})?", job.name, job.id)).await? {
                println!("Aborted.");
                return Ok(());
            }

            let deleted = manager
                .delete_job(&id)
                .await
                .map_err(|e| miette::miette!("failed to delete job: {}", e))?;
            if !deleted {
                return Err(not_found(&id));
            }
            println!("Job '{}' deleted.", job.name);
            Ok(())
        }
    }
}

async fn find(manager: &JobManager, id: &str) -> Result<JobRecord> {
    manager.get_job(id).await.ok_or_else(|| not_found(id))
}

fn not_found(id: &str) -> miette::Report {
    miette::miette!("job '{}' not found", id)
}

/// Ask a yes/no question on the terminal; anything but "y"/"yes" is no.
async fn confirm(question: &str) -> Result<bool> {
    let question = question.to_string();
    tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
        print!("{question} [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    })
    .await
    .map_err(|e| miette::miette!("{}", e))?
    .map_err(|e| miette::miette!("failed to read answer: {}", e))
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M").to_string()
}

fn format_opt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(format_time).unwrap_or_else(|| "-".to_string())
}

/// One row per job with the id shortened to eight characters.
fn render_table(jobs: &[JobRecord]) -> String {
    let mut out = format!(
        "{:<8}  {:<20}  {:<16}  {:<9}  {:>4}  {:<16}  {:<16}  {:<16}\n",
        "ID", "NAME", "CONFIG", "STATUS", "RUNS", "CREATED", "LAST RUN", "NEXT RUN"
    );
    for job in jobs {
        let short_id: String = job.id.chars().take(8).collect();
        out.push_str(&format!(
            "{:<8}  {:<20}  {:<16}  {:<9}  {:>4}  {:<16}  {:<16}  {:<16}\n",
            short_id,
            job.name,
            job.config_ref,
            job.status.as_str(),
            job.run_count,
            format_time(job.created_at),
            format_opt_time(job.last_run),
            format_opt_time(job.next_run),
        ));
    }
    out
}

fn render_details(job: &JobRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("ID:       {}\n", job.id));
    out.push_str(&format!("Name:     {}\n", job.name));
    out.push_str(&format!("Config:   {}\n", job.config_ref));
    out.push_str(&format!("Status:   {}\n", job.status));
    out.push_str(&format!("Priority: {}\n", job.priority));
    if let Some(schedule) = &job.schedule {
        let mut line = format!(
            "Schedule: {} from {}",
            schedule.kind(),
            format_time(schedule.start_time())
        );
        // Cron rules carry a placeholder interval that means nothing to the reader.
        if let Some(n) = schedule.repeat_interval()
            && schedule.kind() != ScheduleType::Custom
        {
            line.push_str(&format!(", every {n}"));
        }
        if let Some(expr) = schedule.cron_expression() {
            line.push_str(&format!(", cron '{expr}'"));
        }
        if let Some(end) = schedule.end_time() {
            line.push_str(&format!(", until {}", format_time(end)));
        }
        out.push_str(&line);
        out.push('\n');
    }
    match job.max_runs {
        Some(max) => out.push_str(&format!("Runs:     {} (max: {max})\n", job.run_count)),
        None => out.push_str(&format!("Runs:     {}\n", job.run_count)),
    }
    out.push_str(&format!("Retries:  {}/{}\n", job.retries, job.max_retries));
    out.push_str(&format!("Created:  {}\n", format_time(job.created_at)));
    out.push_str(&format!("Last run: {}\n", format_opt_time(job.last_run)));
    out.push_str(&format!("Next run: {}\n", format_opt_time(job.next_run)));
    if let Some(error) = &job.error_message {
        out.push_str(&format!("Error:    {error}\n"));
    }
    out
}
