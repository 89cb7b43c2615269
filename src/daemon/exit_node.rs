//! Exit-node bootstrap: OS forwarding, address translation and the subnet route.
//!
//! Forwarding and NAT are required and their failure aborts startup. The subnet route is
//! advisory.

use std::{future::Future, pin::Pin};

use ipnet::Ipv4Net;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BootstrapError>> + Send + 'a>>;

/// Runs OS configuration commands.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> CommandFuture<'a>;
}

/// Runs commands as child processes.
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> CommandFuture<'a> {
        Box::pin(async move {
            let command = format!("{} {}", program, args.join(" "));
            debug!("Running: {}", command);
            let output = tokio::process::Command::new(program)
                .args(args)
                .output()
                .await
                .map_err(|source| BootstrapError::Spawn {
                    command: command.clone(),
                    source,
                })?;
            if !output.status.success() {
                return Err(BootstrapError::Failed {
                    command,
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            Ok(())
        })
    }
}

fn args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

async fn enable_ip_forwarding(runner: &dyn CommandRunner) -> Result<(), BootstrapError> {
    let setting = if cfg!(target_os = "macos") {
        "net.inet.ip.forwarding=1"
    } else {
        "net.ipv4.ip_forward=1"
    };
    runner.run("sysctl", &args(&["-w", setting])).await
}

async fn setup_nat(
    runner: &dyn CommandRunner,
    subnet: Ipv4Net,
    interface: &str,
) -> Result<(), BootstrapError> {
    if !cfg!(target_os = "linux") {
        return Err(BootstrapError::Unsupported("NAT setup"));
    }
    let subnet = subnet.to_string();
    let rules = [
        args(&["-t", "nat", "-A", "POSTROUTING", "-s", &subnet, "-j", "MASQUERADE"]),
        args(&["-A", "FORWARD", "-i", interface, "-j", "ACCEPT"]),
        args(&["-A", "FORWARD", "-o", interface, "-j", "ACCEPT"]),
    ];
    for rule in &rules {
        runner.run("iptables", rule).await?;
    }
    Ok(())
}

async fn setup_subnet_route(
    runner: &dyn CommandRunner,
    subnet: Ipv4Net,
    interface: &str,
) -> Result<(), BootstrapError> {
    let subnet = subnet.to_string();
    if cfg!(target_os = "macos") {
        runner
            .run("route", &args(&["add", "-net", &subnet, "-interface", interface]))
            .await
    } else if cfg!(target_os = "linux") {
        runner
            .run("ip", &args(&["route", "add", &subnet, "dev", interface]))
            .await
    } else {
        Err(BootstrapError::Unsupported("route setup"))
    }
}

/// Configures this host to bridge `subnet` to the Internet through `interface`.
pub async fn bootstrap(
    runner: &dyn CommandRunner,
    subnet: Ipv4Net,
    interface: &str,
) -> Result<(), BootstrapError> {
    info!("Setting up exit node forwarding for {}", subnet);
    enable_ip_forwarding(runner).await?;
    setup_nat(runner, subnet, interface).await?;
    if let Err(error) = setup_subnet_route(runner, subnet, interface).await {
        warn!("Failed to set up subnet route: {}", error);
    }
    info!("Configured as exit node, forwarding traffic to the Internet");
    Ok(())
}
