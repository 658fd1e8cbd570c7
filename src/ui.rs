//! Interface de terminal do fleetq: tabelas coloridas e spinner do worker.
//!
//! Usa `console` para estilização e `indicatif` para o spinner exibido
//! enquanto o worker roda em modo contínuo.

use std::time::Duration;

use chrono::{DateTime, Utc};
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use fleetq::service::JobInspection;
use fleetq::state_machine::{FailReason, Job, JobStatus, JobTransition};
use fleetq::worker::RunSummary;

// Cor associada a cada status.
fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Completed => Style::new().green().bold(),
        JobStatus::Failed => Style::new().red().bold(),
        JobStatus::Canceled => Style::new().dim(),
        JobStatus::Running => Style::new().cyan(),
        JobStatus::RetryWait => Style::new().yellow(),
        JobStatus::Pending => Style::new(),
    }
}

fn styled_status(status: JobStatus) -> String {
    status_style(status).apply_to(status.as_str()).to_string()
}

// Preenchido antes de estilizar para que os códigos ANSI não desalinhem as colunas.
fn padded_status(status: JobStatus) -> String {
    status_style(status)
        .apply_to(format!("{:<10}", status.as_str()))
        .to_string()
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn optional(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

fn header(text: &str) -> String {
    Style::new().bold().apply_to(text).to_string()
}

pub fn job_row(job: &Job) -> String {
    format!(
        "{}  {}  {:<20}  {:>3}/{:<3}  {}  {}",
        job.id,
        padded_status(job.status),
        job.job_type.as_str(),
        job.attempt_count,
        job.max_attempts,
        timestamp(job.next_run_at),
        optional(job.last_error_code.as_deref()),
    )
}

pub fn transition_row(transition: &JobTransition) -> String {
    format!(
        "{}  {:<10} -> {}  {:<22}  {:<16}  {}",
        timestamp(transition.created_at),
        transition.from_status.as_str(),
        padded_status(transition.to_status),
        optional(transition.reason_code.as_deref()),
        transition.actor,
        optional(transition.reason_message.as_deref()),
    )
}

pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("{}", Style::new().dim().apply_to("no jobs"));
        return;
    }
    println!(
        "{}",
        header(&format!(
            "{:<36}  {:<10}  {:<20}  {:>7}  {:<19}  {}",
            "ID", "STATUS", "TYPE", "ATTEMPT", "NEXT RUN", "LAST ERROR"
        ))
    );
    for job in jobs {
        println!("{}", job_row(job));
    }
}

/// Resultado de enqueue, retry e cancel.
pub fn print_job(action: &str, job: &Job) {
    println!(
        "  {} {action} {} ({})",
        Style::new().green().apply_to("✓"),
        job.id,
        styled_status(job.status),
    );
}

pub fn print_inspection(inspection: &JobInspection) {
    let job = &inspection.job;
    println!("{}", header("─── Job ───"));
    println!("id            {}", job.id);
    println!("type          {}", job.job_type);
    println!("status        {}", styled_status(job.status));
    println!("attempts      {}/{}", job.attempt_count, job.max_attempts);
    println!("next run      {}", timestamp(job.next_run_at));
    println!("claimed by    {}", optional(job.claimed_by.as_deref()));
    if let Some(expires) = job.claim_expires_at {
        println!("lease until   {}", timestamp(expires));
    }
    println!("last error    {}", optional(job.last_error_message.as_deref()));
    println!(
        "payload       {}",
        serde_json::to_string(&job.payload).unwrap_or_default()
    );
    println!();
    println!("{}", header("─── Transitions ───"));
    if inspection.transitions.is_empty() {
        println!("{}", Style::new().dim().apply_to("none"));
    }
    for transition in &inspection.transitions {
        println!("{}", transition_row(transition));
    }
}

pub fn print_fail_reason(reason: &FailReason) {
    println!("job           {}", reason.job_id);
    println!("status        {}", styled_status(reason.status));
    println!("error code    {}", optional(reason.last_error_code.as_deref()));
    println!("error         {}", optional(reason.last_error_message.as_deref()));
    println!("attempts      {}/{}", reason.attempt_count, reason.max_attempts);
    println!("updated at    {}", timestamp(reason.updated_at));
}

pub fn summary_line(summary: &RunSummary) -> String {
    format!(
        "recovered={} claimed={} completed={} retried={} failed={} lease_lost={}",
        summary.recovered,
        summary.claimed,
        summary.completed,
        summary.retried,
        summary.failed,
        summary.lease_lost
    )
}

pub fn print_summary(summary: &RunSummary) {
    let style = if summary.failed > 0 || summary.lease_lost > 0 {
        Style::new().red()
    } else if summary.retried > 0 {
        Style::new().yellow()
    } else {
        Style::new().green()
    };
    println!("{}", style.apply_to(summary_line(summary)));
}

/// Spinner exibido enquanto o worker roda em modo contínuo.
pub struct WorkerProgress {
    pb: ProgressBar,
}

impl WorkerProgress {
    pub fn start(worker_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{worker_id}: waiting for jobs (Ctrl-C to stop)"));
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    /// Imprime o resumo acima do spinner quando a iteração fez algo.
    pub fn iteration(&self, summary: &RunSummary) {
        if !summary.is_idle() {
            self.pb.println(format!(
                "  {} {}",
                Style::new().cyan().apply_to("↻"),
                summary_line(summary)
            ));
        }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}
