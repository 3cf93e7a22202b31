//! Docker / docker-compose command construction, output parsing and the
//! compose lifecycle flow shared by the local and SSH-remote drivers.

use regex::Regex;
use tracing::{info, warn};

use wd_config::{ComposeFile, EffectiveConfig};
use wd_workspace::{PortBinding, WorkspaceDescriptor};

use crate::driver::SubstrateStatus;
use crate::runner::{shell_quote, CommandRunner};
use crate::{Result, SubstrateError};

/// Idempotent network creation: `docker network create` only when absent.
pub fn network_create_commands(compose: &ComposeFile) -> Vec<String> {
    compose
        .networks
        .keys()
        .map(|network| {
            format!(
                "docker network ls --format '{{{{.Name}}}}' | grep -wq {net} || docker network create {net}",
                net = shell_quote(network)
            )
        })
        .collect()
}

pub fn compose_up_command(manifest_path: &str, project_dir: &str) -> String {
    format!(
        "docker-compose -f {} --project-directory {} up -d",
        shell_quote(manifest_path),
        shell_quote(project_dir)
    )
}

pub fn compose_stop_command(manifest_path: &str, project_dir: &str) -> String {
    format!(
        "docker-compose -f {} --project-directory {} stop",
        shell_quote(manifest_path),
        shell_quote(project_dir)
    )
}

pub fn compose_down_command(manifest_path: &str, project_dir: &str) -> String {
    format!(
        "docker-compose -f {} --project-directory {} down",
        shell_quote(manifest_path),
        shell_quote(project_dir)
    )
}

pub fn compose_ps_command(manifest_path: &str, project_dir: &str) -> String {
    format!(
        "docker-compose -f {} --project-directory {} ps",
        shell_quote(manifest_path),
        shell_quote(project_dir)
    )
}

/// `docker ps` port column for the named containers.
pub fn docker_ps_ports_command(project: &str) -> String {
    format!(
        "docker ps --filter name={} --format '{{{{.Names}}}} {{{{.Ports}}}}'",
        shell_quote(project)
    )
}

/// Parse `host->container` pairs out of a `docker ps` ports column, e.g.
/// `0.0.0.0:3001->3000/tcp, :::3001->3000/tcp`.
pub fn parse_docker_ps_ports(output: &str) -> Vec<(u16, u16)> {
    let re = Regex::new(r"(?:\d{1,3}(?:\.\d{1,3}){3}|\[?::\]?):(\d+)->(\d+)/tcp")
        .expect("static regex");
    let mut pairs: Vec<(u16, u16)> = re
        .captures_iter(output)
        .filter_map(|cap| {
            let host = cap[1].parse().ok()?;
            let container = cap[2].parse().ok()?;
            Some((host, container))
        })
        .collect();
    pairs.sort_unstable();
    pairs.dedup();
    pairs
}

/// Port bindings as planned by the resolver; client side still unset.
pub fn bindings_from_effective(effective: &EffectiveConfig) -> Vec<PortBinding> {
    effective
        .labeled_ports()
        .map(|p| PortBinding {
            service: p.service.clone(),
            container_port: p.container_port,
            current_host_port: p.host_port,
            client_port: 0,
            label: p.label.clone(),
        })
        .collect()
}

/// Cross-check planned bindings against what the engine actually published.
/// A live `(host, container)` pair confirms the plan; anything the daemon
/// reports differently is corrected in place.
pub fn reconcile_bindings(planned: &mut [PortBinding], live: &[(u16, u16)]) {
    for binding in planned.iter_mut() {
        if let Some((host, _)) = live
            .iter()
            .find(|(_, container)| *container == binding.container_port)
        {
            binding.current_host_port = *host;
        }
    }
}

/// `docker-compose up -d` with networks created first; returns the port
/// bindings the substrate actually published.
pub async fn up_flow(
    runner: &dyn CommandRunner,
    desc: &WorkspaceDescriptor,
    effective: &EffectiveConfig,
) -> Result<Vec<PortBinding>> {
    let compose = ComposeFile::parse(&desc.manifest_content)
        .map_err(|e| SubstrateError::Validation(format!("bad manifest: {}", e)))?;

    for command in network_create_commands(&compose) {
        runner.run(&command).await?.ensure_success(&command)?;
    }

    let manifest_path = desc.manifest_path();
    let command = compose_up_command(&manifest_path, &desc.working_dir);
    let output = runner
        .run_streaming(&command, &mut |line: &str| {
            let lower = line.to_lowercase();
            if lower.contains(":error") || lower.contains(":fatal") {
                warn!(line, "compose");
            } else {
                info!(line, "compose");
            }
        })
        .await?;
    output.ensure_success(&command)?;

    let mut bindings = bindings_from_effective(effective);
    // cross-check against the engine; plan stays authoritative when the
    // daemon cannot be queried
    let ps = docker_ps_ports_command(&desc.project_name());
    match runner.run(&ps).await {
        Ok(output) if output.success() => {
            reconcile_bindings(&mut bindings, &parse_docker_ps_ports(&output.stdout));
        }
        Ok(_) | Err(SubstrateError::Cancelled) => {}
        Err(e) => warn!(error = %e, "docker ps cross-check failed"),
    }
    Ok(bindings)
}

pub async fn down_flow(runner: &dyn CommandRunner, desc: &WorkspaceDescriptor) -> Result<()> {
    let command = compose_stop_command(&desc.manifest_path(), &desc.working_dir);
    runner.run(&command).await?.ensure_success(&command)?;
    Ok(())
}

pub async fn remove_flow(
    runner: &dyn CommandRunner,
    desc: &WorkspaceDescriptor,
    purge: bool,
) -> Result<()> {
    let command = compose_down_command(&desc.manifest_path(), &desc.working_dir);
    runner.run(&command).await?.ensure_success(&command)?;
    if purge {
        let command = format!("rm -rf {}", shell_quote(&desc.working_dir));
        runner.run(&command).await?.ensure_success(&command)?;
    }
    Ok(())
}

pub async fn status_flow(
    runner: &dyn CommandRunner,
    desc: &WorkspaceDescriptor,
) -> Result<SubstrateStatus> {
    let command = compose_ps_command(&desc.manifest_path(), &desc.working_dir);
    let output = runner.run(&command).await?;
    let running = output.success() && output.stdout.contains("Up");
    Ok(SubstrateStatus {
        running,
        detail: output.stdout.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_ports_parse_ipv4_and_ipv6() {
        let output = "wd1-web 0.0.0.0:3001->3000/tcp, :::3001->3000/tcp\n\
                      wd1-db 0.0.0.0:5432->5432/tcp\n";
        let pairs = parse_docker_ps_ports(output);
        assert_eq!(pairs, vec![(3001, 3000), (5432, 5432)]);
    }

    #[test]
    fn ps_ports_ignore_unpublished() {
        let output = "wd1-cache 6379/tcp\n";
        assert!(parse_docker_ps_ports(output).is_empty());
    }

    #[test]
    fn reconcile_updates_host_side_only() {
        let mut planned = vec![PortBinding {
            service: "web".into(),
            container_port: 3000,
            current_host_port: 3000,
            client_port: 0,
            label: "web".into(),
        }];
        reconcile_bindings(&mut planned, &[(3001, 3000)]);
        assert_eq!(planned[0].current_host_port, 3001);
        assert_eq!(planned[0].label, "web");
    }

    #[test]
    fn network_commands_are_guarded() {
        let compose = ComposeFile::parse("networks:\n  wd1-network: {}\n").unwrap();
        let commands = network_create_commands(&compose);
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("|| docker network create"));
    }
}
