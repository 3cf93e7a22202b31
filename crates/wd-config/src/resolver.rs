//! Merges declarative config with a linked Compose file and lowers the
//! result into a runtime manifest with restart-stable host ports.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::compose::{ComposeFile, ComposeService, NetworkSpec};
use crate::ide::{split_port_pair, IdeConfig, IdeType, IngressSection};
use crate::k8s::{
    Container, ContainerPort, Deployment, DeploymentSpec, EnvVar, Ingress, IngressBackend,
    IngressBackendPort, IngressBackendService, IngressHttp, IngressPath, IngressRule, IngressSpec,
    K8sManifest, LabelSelector, Metadata, PodSpec, PodTemplate, Service, ServicePort, ServiceSpec,
};
use crate::ports::{alloc_port, PortProbe};
use crate::{ConfigError, RuntimeManifest};

/// Label of the dev container's browser IDE port.
pub const WEB_IDE_LABEL: &str = "webide";

/// Which substrate the manifest is lowered for.
#[derive(Debug, Clone)]
pub enum ManifestTarget {
    /// Local or SSH-remote Docker Compose. `project` names the network.
    Compose { project: String },
    /// Kubernetes namespace.
    K8s { namespace: String },
}

/// A port with its stable label and negotiated substrate-side host port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledPort {
    pub service: String,
    pub label: String,
    pub container_port: u16,
    pub host_port: u16,
}

/// One service of the merged, normalized plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicePlan {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub ports: Vec<LabeledPort>,
}

/// The merged, normalized description of a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub dev_service: String,
    pub ide_type: IdeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<String>,
    pub services: BTreeMap<String, ServicePlan>,
}

impl EffectiveConfig {
    /// All labeled ports, service-major order.
    pub fn labeled_ports(&self) -> impl Iterator<Item = &LabeledPort> {
        self.services.values().flat_map(|s| s.ports.iter())
    }

    /// `label -> host port`, the join map used across restarts.
    pub fn label_map(&self) -> BTreeMap<String, u16> {
        self.labeled_ports()
            .map(|p| (p.label.clone(), p.host_port))
            .collect()
    }

    /// The port the browser IDE is reached on: the `webide` label when one
    /// is declared, otherwise the dev container's lowest labeled port.
    /// SDK-only containers have no IDE endpoint.
    pub fn web_ide_binding(&self) -> Option<&LabeledPort> {
        if self.ide_type == IdeType::SdkOnly {
            return None;
        }
        if let Some(port) = self.labeled_ports().find(|p| p.label == WEB_IDE_LABEL) {
            return Some(port);
        }
        self.services
            .get(&self.dev_service)?
            .ports
            .iter()
            .min_by_key(|p| p.container_port)
    }

    /// Host port of the web IDE, if this workspace has one.
    pub fn web_ide_port(&self) -> Option<u16> {
        self.web_ide_binding().map(|p| p.host_port)
    }
}

/// Resolver input; prior ports keep labels on their old host numbers.
#[derive(Debug)]
pub struct ResolveInput<'a> {
    pub config_text: &'a str,
    pub link_compose_text: Option<&'a str>,
    pub working_dir: &'a str,
    pub user_name: &'a str,
    pub prior_ports: &'a BTreeMap<String, u16>,
    pub target: ManifestTarget,
}

/// Resolver output.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub effective: EffectiveConfig,
    pub manifest: RuntimeManifest,
    pub web_ide_port: Option<u16>,
}

/// In-container mount point of the cloned sources.
const CONTAINER_SOURCE_DIR: &str = "/home/project";

pub fn resolve(input: &ResolveInput<'_>, probe: &dyn PortProbe) -> crate::Result<Resolved> {
    let config = IdeConfig::parse(input.config_text)?;
    let linked = input
        .link_compose_text
        .filter(|t| !t.trim().is_empty())
        .map(ComposeFile::parse)
        .transpose()?;

    let effective = merge(&config, linked.as_ref(), input, probe)?;
    let web_ide_port = effective.web_ide_port();
    let manifest = lower(&effective, &config.workspace.ingress, input)?;

    Ok(Resolved {
        effective,
        manifest,
        web_ide_port,
    })
}

/// A port request before host allocation.
struct PortRequest {
    service: String,
    label: String,
    container_port: u16,
    desired_host: u16,
}

fn merge(
    config: &IdeConfig,
    linked: Option<&ComposeFile>,
    input: &ResolveInput<'_>,
    probe: &dyn PortProbe,
) -> crate::Result<EffectiveConfig> {
    let ws = &config.workspace;
    let dev_name = ws.dev_container.service_name.trim();
    if dev_name.is_empty() {
        return Err(ConfigError::NoDevContainer(
            "dev-container.service-name is empty".into(),
        ));
    }

    // Service names must stay unique once the linked file is overlaid.
    // The same name in both files is an overlay; names differing only in
    // case would collide as container names and are rejected.
    let mut seen_folded: BTreeMap<String, &str> = BTreeMap::new();
    for name in ws
        .services
        .keys()
        .chain(linked.iter().flat_map(|c| c.services.keys()))
    {
        match seen_folded.get(&name.to_lowercase()) {
            None => {
                seen_folded.insert(name.to_lowercase(), name);
            }
            Some(first) if *first == name => {}
            Some(_) => return Err(ConfigError::DuplicateService(name.clone())),
        }
    }

    // Skeleton plans: declarative services first, linked-only services after.
    let mut services: BTreeMap<String, ServicePlan> = BTreeMap::new();
    for (name, spec) in &ws.services {
        services.insert(
            name.clone(),
            ServicePlan {
                image: spec.image.clone().unwrap_or_default(),
                command: spec.command.clone(),
                environment: spec.environment.clone(),
                volumes: spec.volumes.clone(),
                ports: Vec::new(),
            },
        );
    }
    if let Some(compose) = linked {
        for (name, service) in &compose.services {
            let plan = services.entry(name.clone()).or_default();
            // linked wins on image and command
            if let Some(image) = &service.image {
                plan.image = image.clone();
            }
            if let Some(command) = &service.command {
                plan.command = Some(command.clone());
            }
            for entry in &service.environment {
                if let Some((k, v)) = entry.split_once('=') {
                    plan.environment
                        .entry(k.to_string())
                        .or_insert_with(|| v.to_string());
                }
            }
            for volume in &service.volumes {
                if !plan.volumes.contains(volume) {
                    plan.volumes.push(volume.clone());
                }
            }
        }
    }

    if !services.contains_key(dev_name) {
        return Err(ConfigError::NoDevContainer(format!(
            "service {:?} is not declared",
            dev_name
        )));
    }

    // Gather port requests. Declarative labels win over synthesized ones.
    let mut requests: Vec<PortRequest> = Vec::new();
    let mut claimed_pairs: HashSet<(String, u16)> = HashSet::new();

    for (label, &container_port) in &ws.dev_container.ports {
        claimed_pairs.insert((dev_name.to_string(), container_port));
        requests.push(PortRequest {
            service: dev_name.to_string(),
            label: label.clone(),
            container_port,
            desired_host: container_port,
        });
    }
    let mut push_synthesized =
        |requests: &mut Vec<PortRequest>, service: &str, host: u16, container: u16| {
            if claimed_pairs.insert((service.to_string(), container)) {
                requests.push(PortRequest {
                    service: service.to_string(),
                    label: format!("{}:{}", service, container),
                    container_port: container,
                    desired_host: host,
                });
            }
        };
    for (name, spec) in &ws.services {
        for entry in &spec.ports {
            let (host, container) = split_port_pair(entry)?;
            push_synthesized(&mut requests, name, host, container);
        }
    }
    if let Some(compose) = linked {
        for (name, host, container) in compose.host_ports()? {
            push_synthesized(&mut requests, &name, host, container);
        }
    }

    // A dev container with no ports at all still gets its editor port,
    // unless it is SDK-only. When ports exist, the lowest one doubles as
    // the IDE endpoint (see `web_ide_binding`).
    let dev_has_ports = requests.iter().any(|r| r.service == dev_name);
    if !dev_has_ports {
        if let Some(port) = ws.dev_container.ide_type.default_web_port() {
            requests.push(PortRequest {
                service: dev_name.to_string(),
                label: WEB_IDE_LABEL.to_string(),
                container_port: port,
                desired_host: port,
            });
        }
    }
    // Allocate host ports: a known label keeps its old host number, a new
    // label starts from its declared preference. Ports claimed in this
    // resolution are unavailable to later requests even if the substrate
    // still reports them free.
    requests.sort_by(|a, b| {
        (a.service.as_str(), a.container_port).cmp(&(b.service.as_str(), b.container_port))
    });
    let mut claimed_hosts: HashSet<u16> = HashSet::new();
    for request in &requests {
        let desired = input
            .prior_ports
            .get(&request.label)
            .copied()
            .unwrap_or(request.desired_host);
        let combined = |port: u16| !claimed_hosts.contains(&port) && probe.is_free(port);
        let host = alloc_port(&combined, desired)?;
        claimed_hosts.insert(host);
        services
            .get_mut(&request.service)
            .expect("request references a merged service")
            .ports
            .push(LabeledPort {
                service: request.service.clone(),
                label: request.label.clone(),
                container_port: request.container_port,
                host_port: host,
            });
    }

    Ok(EffectiveConfig {
        dev_service: dev_name.to_string(),
        ide_type: ws.dev_container.ide_type,
        run_as_user: ws.dev_container.run_as_user.clone(),
        services,
    })
}

fn lower(
    effective: &EffectiveConfig,
    ingress: &Option<IngressSection>,
    input: &ResolveInput<'_>,
) -> crate::Result<RuntimeManifest> {
    match &input.target {
        ManifestTarget::Compose { project } => {
            Ok(RuntimeManifest::Compose(lower_compose(effective, project, input)))
        }
        ManifestTarget::K8s { namespace } => Ok(RuntimeManifest::K8s(lower_k8s(
            effective, ingress, namespace,
        )?)),
    }
}

fn lower_compose(effective: &EffectiveConfig, project: &str, input: &ResolveInput<'_>) -> ComposeFile {
    let network = format!("{}-network", project);
    let mut services = BTreeMap::new();
    for (name, plan) in &effective.services {
        let mut volumes = plan.volumes.clone();
        if name == &effective.dev_service && !input.working_dir.is_empty() {
            volumes.insert(0, format!("{}:{}", input.working_dir, CONTAINER_SOURCE_DIR));
        }
        services.insert(
            name.clone(),
            ComposeService {
                image: Some(plan.image.clone()),
                command: plan.command.clone(),
                container_name: Some(format!("{}-{}", project, name)),
                environment: plan
                    .environment
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
                volumes,
                ports: plan
                    .ports
                    .iter()
                    .map(|p| format!("{}:{}", p.host_port, p.container_port))
                    .collect(),
                networks: vec![network.clone()],
                restart: Some("always".to_string()),
            },
        );
    }
    let mut networks = BTreeMap::new();
    networks.insert(network, NetworkSpec::default());
    ComposeFile {
        version: Some("3".to_string()),
        services,
        networks,
    }
}

fn lower_k8s(
    effective: &EffectiveConfig,
    ingress: &Option<IngressSection>,
    namespace: &str,
) -> crate::Result<K8sManifest> {
    let mut deployments = Vec::new();
    let mut k8s_services = Vec::new();
    for (name, plan) in &effective.services {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), name.clone());

        deployments.push(Deployment {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            metadata: Metadata {
                name: name.clone(),
                namespace: Some(namespace.to_string()),
                labels: labels.clone(),
            },
            spec: DeploymentSpec {
                replicas: 1,
                selector: LabelSelector {
                    match_labels: labels.clone(),
                },
                template: PodTemplate {
                    metadata: Metadata {
                        name: name.clone(),
                        namespace: None,
                        labels: labels.clone(),
                    },
                    spec: PodSpec {
                        containers: vec![Container {
                            name: name.clone(),
                            image: plan.image.clone(),
                            command: plan
                                .command
                                .as_ref()
                                .map(|c| {
                                    vec!["sh".to_string(), "-c".to_string(), c.clone()]
                                })
                                .unwrap_or_default(),
                            env: plan
                                .environment
                                .iter()
                                .map(|(k, v)| EnvVar {
                                    name: k.clone(),
                                    value: v.clone(),
                                })
                                .collect(),
                            ports: plan
                                .ports
                                .iter()
                                .map(|p| ContainerPort {
                                    container_port: p.container_port,
                                })
                                .collect(),
                        }],
                    },
                },
            },
        });

        if !plan.ports.is_empty() {
            k8s_services.push(Service {
                api_version: "v1".to_string(),
                kind: "Service".to_string(),
                metadata: Metadata {
                    name: name.clone(),
                    namespace: Some(namespace.to_string()),
                    labels: labels.clone(),
                },
                spec: ServiceSpec {
                    service_type: "ClusterIP".to_string(),
                    selector: labels.clone(),
                    ports: plan
                        .ports
                        .iter()
                        .map(|p| ServicePort {
                            name: sanitize_port_name(&p.label),
                            port: p.host_port,
                            target_port: p.container_port,
                        })
                        .collect(),
                },
            });
        }
    }

    let ingress = match ingress {
        Some(section) => {
            let web_port = effective.web_ide_port().ok_or_else(|| {
                ConfigError::Validation("ingress configured but no web IDE port exists".into())
            })?;
            Some(Ingress {
                api_version: "networking.k8s.io/v1".to_string(),
                kind: "Ingress".to_string(),
                metadata: Metadata {
                    name: format!("{}-ide", effective.dev_service),
                    namespace: Some(namespace.to_string()),
                    labels: BTreeMap::new(),
                },
                spec: IngressSpec {
                    rules: vec![IngressRule {
                        host: section.host.clone(),
                        http: IngressHttp {
                            paths: vec![IngressPath {
                                path: "/".to_string(),
                                path_type: "Prefix".to_string(),
                                backend: IngressBackend {
                                    service: IngressBackendService {
                                        name: effective.dev_service.clone(),
                                        port: IngressBackendPort { number: web_port },
                                    },
                                },
                            }],
                        },
                    }],
                },
            })
        }
        None => None,
    };

    Ok(K8sManifest {
        deployments,
        services: k8s_services,
        ingress,
    })
}

/// Service port names must be DNS-1123 labels.
fn sanitize_port_name(label: &str) -> String {
    let name: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    name.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
version: "1.0"
workspace:
  dev-container:
    service-name: web
    ports:
      webide: 6800
      web: 3000
    ide-type: vscode
  services:
    web:
      image: registry.example.com/web:latest
"#;

    fn all_free(_: u16) -> bool {
        true
    }

    fn input<'a>(
        config: &'a str,
        linked: Option<&'a str>,
        prior: &'a BTreeMap<String, u16>,
    ) -> ResolveInput<'a> {
        ResolveInput {
            config_text: config,
            link_compose_text: linked,
            working_dir: "/home/dev/workspaces/1",
            user_name: "dev",
            prior_ports: prior,
            target: ManifestTarget::Compose {
                project: "ws1".into(),
            },
        }
    }

    #[test]
    fn fresh_resolution_uses_container_ports() {
        let prior = BTreeMap::new();
        let resolved = resolve(&input(CONFIG, None, &prior), &all_free).unwrap();
        let map = resolved.effective.label_map();
        assert_eq!(map.get("web").copied(), Some(3000));
        assert_eq!(map.get(WEB_IDE_LABEL).copied(), Some(6800));
        assert_eq!(resolved.web_ide_port, Some(6800));
    }

    #[test]
    fn prior_label_keeps_its_host_port() {
        let mut prior = BTreeMap::new();
        prior.insert("web".to_string(), 3007u16);
        let resolved = resolve(&input(CONFIG, None, &prior), &all_free).unwrap();
        assert_eq!(resolved.effective.label_map().get("web").copied(), Some(3007));
    }

    #[test]
    fn occupied_port_probes_upward_and_keeps_label() {
        let prior = BTreeMap::new();
        let probe = |port: u16| port != 3000;
        let resolved = resolve(&input(CONFIG, None, &prior), &probe).unwrap();
        let web = resolved
            .effective
            .labeled_ports()
            .find(|p| p.label == "web")
            .unwrap()
            .clone();
        assert_eq!(web.host_port, 3001);
        assert_eq!(web.container_port, 3000);
    }

    #[test]
    fn renegotiation_is_deterministic_when_ports_stay_free() {
        let prior = BTreeMap::new();
        let first = resolve(&input(CONFIG, None, &prior), &all_free).unwrap();
        let prior = first.effective.label_map();
        let second = resolve(&input(CONFIG, None, &prior), &all_free).unwrap();
        assert_eq!(first.effective.label_map(), second.effective.label_map());
    }

    #[test]
    fn linked_compose_wins_image_and_adds_services() {
        let linked = r#"
services:
  web:
    image: node:18
    command: npm run dev
  db:
    image: postgres:15
    ports:
      - "5432:5432"
"#;
        let prior = BTreeMap::new();
        let resolved = resolve(&input(CONFIG, Some(linked), &prior), &all_free).unwrap();
        let web = &resolved.effective.services["web"];
        assert_eq!(web.image, "node:18");
        assert_eq!(web.command.as_deref(), Some("npm run dev"));
        // synthesized label for the linked-only service
        let db = &resolved.effective.services["db"];
        assert_eq!(db.ports[0].label, "db:5432");
    }

    #[test]
    fn missing_dev_service_is_rejected() {
        let config = r#"
workspace:
  dev-container:
    service-name: ghost
  services:
    web:
      image: img
"#;
        let prior = BTreeMap::new();
        assert!(matches!(
            resolve(&input(config, None, &prior), &all_free),
            Err(ConfigError::NoDevContainer(_))
        ));
    }

    #[test]
    fn case_folded_service_collision_is_rejected() {
        let linked = "services:\n  WEB:\n    image: node:18\n";
        let prior = BTreeMap::new();
        assert!(matches!(
            resolve(&input(CONFIG, Some(linked), &prior), &all_free),
            Err(ConfigError::DuplicateService(_))
        ));
    }

    #[test]
    fn web_ide_label_stays_on_dev_container() {
        // another service exposing the same container port gets a
        // synthesized label, never the webide role
        let config = r#"
workspace:
  dev-container:
    service-name: web
    ports:
      webide: 6800
  services:
    web:
      image: img
    other:
      image: img2
      ports:
        - "6801:6800"
"#;
        let prior = BTreeMap::new();
        let resolved = resolve(&input(config, None, &prior), &all_free).unwrap();
        let carriers: Vec<&str> = resolved
            .effective
            .labeled_ports()
            .filter(|p| p.label == WEB_IDE_LABEL)
            .map(|p| p.service.as_str())
            .collect();
        assert_eq!(carriers, vec!["web"]);
    }

    #[test]
    fn single_labeled_port_doubles_as_ide_endpoint() {
        let config = r#"
workspace:
  dev-container:
    service-name: web
    ports:
      web: 3000
  services:
    web:
      image: img
"#;
        let prior = BTreeMap::new();
        let resolved = resolve(&input(config, None, &prior), &all_free).unwrap();
        assert_eq!(resolved.web_ide_port, Some(3000));
        assert_eq!(
            resolved.effective.web_ide_binding().unwrap().label,
            "web"
        );
    }

    #[test]
    fn portless_dev_container_gets_default_editor_port() {
        let config = r#"
workspace:
  dev-container:
    service-name: app
  services:
    app:
      image: img
"#;
        let prior = BTreeMap::new();
        let resolved = resolve(&input(config, None, &prior), &all_free).unwrap();
        assert_eq!(resolved.web_ide_port, Some(6800));
        assert_eq!(
            resolved.effective.web_ide_binding().unwrap().label,
            WEB_IDE_LABEL
        );
    }

    #[test]
    fn sdk_only_has_no_web_ide_port() {
        let config = r#"
workspace:
  dev-container:
    service-name: app
    ide-type: sdk-only
  services:
    app:
      image: img
"#;
        let prior = BTreeMap::new();
        let resolved = resolve(&input(config, None, &prior), &all_free).unwrap();
        assert_eq!(resolved.web_ide_port, None);
    }

    #[test]
    fn window_exhaustion_surfaces() {
        let prior = BTreeMap::new();
        let probe = |port: u16| !(3000..3100).contains(&port);
        assert!(matches!(
            resolve(&input(CONFIG, None, &prior), &probe),
            Err(ConfigError::PortExhausted(_))
        ));
    }

    #[test]
    fn compose_lowering_mounts_sources_into_dev_container() {
        let prior = BTreeMap::new();
        let resolved = resolve(&input(CONFIG, None, &prior), &all_free).unwrap();
        let compose = resolved.manifest.as_compose().unwrap();
        let web = &compose.services["web"];
        assert!(web.volumes[0].starts_with("/home/dev/workspaces/1:"));
        assert!(web.ports.contains(&"3000:3000".to_string()));
        assert!(compose.networks.contains_key("ws1-network"));
    }

    #[test]
    fn k8s_lowering_emits_deployment_and_service() {
        let prior = BTreeMap::new();
        let mut inp = input(CONFIG, None, &prior);
        inp.target = ManifestTarget::K8s {
            namespace: "abcdef".into(),
        };
        let resolved = resolve(&inp, &all_free).unwrap();
        let manifest = resolved.manifest.as_k8s().unwrap();
        assert_eq!(manifest.deployments.len(), 1);
        assert_eq!(manifest.services.len(), 1);
        let yaml = manifest.to_yaml().unwrap();
        assert!(yaml.contains("kind: Deployment"));
        assert!(yaml.contains("namespace: abcdef"));

        let exposed = manifest.exposed_ports();
        assert!(exposed.iter().any(|(_, _, target, name)| *target == 6800 && name == "webide"));
    }
}
