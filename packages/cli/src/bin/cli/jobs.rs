use super::RunArgs;
use colored::*;
use foreman_config::ProcessSettings;
use foreman_jobs::{Job, JobOptions, JobRunner, JobStatus, LogEntry};
use foreman_process::LogStream;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Fallback wake-up in case the update channel lags or closes.
const REFRESH_INTERVAL: Duration = Duration::from_millis(500);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(args: RunArgs, settings: &ProcessSettings) -> anyhow::Result<i32> {
    let runner = JobRunner::system(settings);

    let mut command = args.command.into_iter();
    let program = command
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing command to run"))?;
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir()?,
    };

    let options = JobOptions {
        project_id: args.project,
        cwd,
        command: program,
        args: command.collect(),
        display_name: args.name,
        free_ports: args.free_ports,
        ..JobOptions::default()
    };

    let job = runner
        .start_job(&args.job_type, options)
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", e.user_message(), e))?;
    println!(
        "{} {} ({})",
        "▶".cyan(),
        job.display_name.bold(),
        job.id.dimmed()
    );

    let mut updates = runner
        .subscribe(&job.id)
        .await
        .ok_or_else(|| anyhow::anyhow!("job {} disappeared", job.id))?;
    let mut printed = 0;
    let mut cancel_requested = false;

    // Logs are append-only, so printing by index never duplicates or skips lines
    let finished = loop {
        let snapshot = runner
            .get_job(&job.id)
            .await
            .ok_or_else(|| anyhow::anyhow!("job {} disappeared", job.id))?;
        for entry in &snapshot.logs[printed..] {
            print_log(entry);
        }
        printed = snapshot.logs.len();

        if snapshot.status.is_terminal() {
            break snapshot;
        }

        tokio::select! {
            update = updates.recv() => {
                if let Err(RecvError::Closed) = update {
                    tokio::time::sleep(REFRESH_INTERVAL).await;
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                eprintln!("{}", "Cancelling job...".yellow());
                runner.cancel_job(&job.id).await;
            }
            _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
        }
    };

    // The driver tears down a cancelled tree after the status flips; let it finish
    if !runner.wait_for_process_exit(&job.id, TEARDOWN_TIMEOUT).await {
        eprintln!(
            "{}",
            format!("Process of job {} is still shutting down", job.id).yellow()
        );
    }

    print_outcome(&finished);
    Ok(exit_code_for(&finished))
}

fn print_log(entry: &LogEntry) {
    let time = entry.timestamp.format("%H:%M:%S").to_string();
    match entry.stream {
        LogStream::Stdout => println!("{} {}", time.dimmed(), entry.message),
        LogStream::Stderr => eprintln!("{} {}", time.dimmed(), entry.message.red()),
        LogStream::System => println!("{} {}", time.dimmed(), entry.message.dimmed()),
    }
}

fn print_outcome(job: &Job) {
    let duration = match (job.started_at, job.completed_at) {
        (Some(start), Some(end)) => format!(
            " in {:.1}s",
            (end - start).num_milliseconds() as f64 / 1000.0
        ),
        _ => String::new(),
    };
    match job.status {
        JobStatus::Succeeded => println!(
            "{}",
            format!("✓ {} succeeded{}", job.display_name, duration)
                .green()
                .bold()
        ),
        JobStatus::Cancelled => println!(
            "{}",
            format!("⊘ {} cancelled", job.display_name).yellow().bold()
        ),
        _ => println!(
            "{}",
            format!("✗ {} failed{}", job.display_name, duration)
                .red()
                .bold()
        ),
    }
}

/// Exit status for the CLI: the job's own code, 130 for cancellation.
fn exit_code_for(job: &Job) -> i32 {
    match job.status {
        JobStatus::Succeeded => 0,
        JobStatus::Cancelled => 130,
        _ => match job.exit_code {
            Some(code) if code != 0 => code,
            _ => 1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;
    use std::path::PathBuf;

    fn job(status: JobStatus, exit_code: Option<i32>) -> Job {
        Job {
            id: "job-1".to_string(),
            project_id: "web".to_string(),
            job_type: "frontend:test".to_string(),
            display_name: "Frontend Test".to_string(),
            command: "npm".to_string(),
            args: Vec::new(),
            cwd: PathBuf::from("/tmp"),
            status,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code,
            signal: None,
            pid: None,
            error: None,
            logs: Vec::new(),
            summary: None,
        }
    }

    #[rstest]
    #[case(JobStatus::Succeeded, Some(0), 0)]
    #[case(JobStatus::Failed, Some(3), 3)]
    #[case(JobStatus::Failed, None, 1)]
    #[case(JobStatus::Cancelled, None, 130)]
    fn test_exit_code_for(
        #[case] status: JobStatus,
        #[case] exit_code: Option<i32>,
        #[case] expected: i32,
    ) {
        assert_eq!(exit_code_for(&job(status, exit_code)), expected);
    }
}
