use super::PortsCommands;
use colored::*;
use foreman_config::ProcessSettings;
use foreman_process::{ProcessError, ProcessManager, WaitForPortsOptions};
use std::time::Duration;

pub async fn handle(command: PortsCommands, settings: &ProcessSettings) -> anyhow::Result<i32> {
    let manager = ProcessManager::system(settings);

    match command {
        PortsCommands::List { ports } => {
            for port in ports {
                let pids = manager.list_pids_on_port(port).await;
                let label = if manager.is_reserved_port(port) {
                    format!("{} (reserved)", port).yellow()
                } else {
                    port.to_string().cyan()
                };

                if pids.is_empty() {
                    println!("{} {}", label, "free".green());
                } else {
                    let pids: Vec<String> = pids
                        .iter()
                        .map(|pid| {
                            if manager.is_protected_pid(*pid) {
                                format!("{} (this process)", pid)
                            } else {
                                pid.to_string()
                            }
                        })
                        .collect();
                    println!("{} {}", label, pids.join(", "));
                }
            }
            Ok(0)
        }
        PortsCommands::Free { ports, timeout_ms } => {
            let report = manager.ensure_ports_freed(&ports).await;

            for port in &report.skipped_reserved {
                println!("{} {}", port.to_string().yellow(), "reserved, skipped".yellow());
            }
            for port in &report.freed {
                println!("{} {}", port.to_string().cyan(), "free".green());
            }
            if report.all_freed() {
                return Ok(0);
            }

            let mut options = manager.port_wait_options();
            if let Some(timeout_ms) = timeout_ms {
                options = WaitForPortsOptions {
                    timeout: Duration::from_millis(timeout_ms),
                    ..options
                };
            }

            if manager
                .wait_for_ports_to_free(&report.still_busy, Some(options))
                .await
            {
                for port in &report.still_busy {
                    println!("{} {}", port.to_string().cyan(), "free".green());
                }
                Ok(0)
            } else {
                for port in &report.still_busy {
                    println!("{} {}", port.to_string().cyan(), "still in use".red().bold());
                }
                Ok(1)
            }
        }
    }
}

pub async fn kill_tree(pid: u32, settings: &ProcessSettings) -> anyhow::Result<i32> {
    let manager = ProcessManager::system(settings);

    if manager.is_protected_pid(pid) {
        return Err(ProcessError::ProtectedPid { pid }.into());
    }
    if !manager.is_process_running(pid) {
        println!("{}", format!("No process with PID {}", pid).yellow());
        return Ok(0);
    }

    if manager.kill_process_tree(pid).await {
        println!("{}", format!("Process tree of {} terminated", pid).green());
        Ok(0)
    } else {
        println!(
            "{}",
            format!("Some processes in the tree of {} are still running", pid).red()
        );
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kill_tree_refuses_host_process() {
        let host = std::process::id();

        let err = kill_tree(host, &ProcessSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::ProtectedPid { pid }) if *pid == host
        ));
    }

    #[tokio::test]
    async fn test_kill_tree_of_missing_pid_is_ok() {
        // Valid but far above any default pid_max
        let code = kill_tree(i32::MAX as u32, &ProcessSettings::default())
            .await
            .unwrap();
        assert_eq!(code, 0);
    }
}
