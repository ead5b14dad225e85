//! Bootstrap plan parsing.
//!
//! A bootstrap plan prepares bare-metal hosts before any stack runs:
//!
//! ```kdl
//! host "node1" address="10.0.0.5" user="ubuntu"
//!
//! shell "Install tailscale" sudo=#true {
//!     run "curl -fsSL https://tailscale.com/install.sh | sh"
//!     run "tailscale up --auth-key ${secret.TAILSCALE_AUTH_KEY} --ssh"
//! }
//! shell "Link resolv.conf" sudo=#true unless="test -L /etc/resolv.conf" {
//!     run "ln -sf /run/systemd/resolve/stub-resolv.conf /etc/resolv.conf"
//! }
//! ppa "Add PPA for fastfetch" src="ppa:zhangsongcui3371/fastfetch" sudo=#true
//! packages "Install apt packages" update=#true sudo=#true {
//!     package "vim" "htop" "fastfetch"
//! }
//! fact "eth0_ip" command="ip -4 -o addr show eth0 | awk '{print $4}' | cut -d/ -f1"
//! file "Copy Cilium helm config" dest="cilium-config.yaml" {
//!     content "k8sServiceHost: ${fact.eth0_ip}"
//! }
//! ```

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::nodes::{
    get_all_string_args, get_bool_prop, get_first_string_arg, get_string_list_prop,
    get_string_prop, get_u64_prop,
};
use crate::{ConfigError, ConfigResult};

/// A host to bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    pub address: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
}

impl HostSpec {
    /// `user@address` or `address`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.address),
            None => self.address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Shell { commands: Vec<String> },
    Packages { packages: Vec<String>, update: bool },
    Ppa { source: String },
    File { dest: String, content: String, mode: Option<String> },
    /// Capture trimmed command output as `${fact.<name>}`.
    Fact { command: String },
}

/// One ordered step of a bootstrap plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapStep {
    pub name: String,
    pub action: StepAction,
    /// Fact check: the step is skipped when this command exits 0.
    pub unless: Option<String>,
    pub sudo: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapPlan {
    pub hosts: Vec<HostSpec>,
    pub steps: Vec<BootstrapStep>,
}

/// Parse a bootstrap plan from KDL text.
pub fn parse_bootstrap_plan(kdl: &str) -> ConfigResult<BootstrapPlan> {
    let doc: KdlDocument = kdl.parse()?;

    let mut hosts = Vec::new();
    let mut steps = Vec::new();

    for node in doc.nodes() {
        let action = match node.name().value() {
            "host" => {
                hosts.push(parse_host(node)?);
                continue;
            }
            "shell" => parse_shell(node)?,
            "packages" => {
                let packages = get_string_list_prop(node, "package");
                if packages.is_empty() {
                    return Err(ConfigError::MissingField("packages package".to_string()));
                }
                StepAction::Packages {
                    packages,
                    update: get_bool_prop(node, "update").unwrap_or(false),
                }
            }
            "ppa" => StepAction::Ppa {
                source: get_string_prop(node, "src")
                    .ok_or_else(|| ConfigError::MissingField("ppa src".to_string()))?,
            },
            "file" => parse_file(node)?,
            "fact" => StepAction::Fact {
                command: get_string_prop(node, "command")
                    .ok_or_else(|| ConfigError::MissingField("fact command".to_string()))?,
            },
            _ => continue, // Ignore unknown nodes
        };

        steps.push(BootstrapStep {
            name: get_first_string_arg(node).unwrap_or_default(),
            action,
            unless: get_string_prop(node, "unless"),
            sudo: get_bool_prop(node, "sudo").unwrap_or(false),
        });
    }

    let mut names = HashSet::new();
    for host in &hosts {
        if !names.insert(host.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("host '{}'", host.name)));
        }
    }

    Ok(BootstrapPlan { hosts, steps })
}

/// Read and parse a bootstrap plan file.
pub fn load_bootstrap_plan(path: &Path) -> ConfigResult<BootstrapPlan> {
    let text = std::fs::read_to_string(path)?;
    parse_bootstrap_plan(&text)
}

fn parse_host(node: &KdlNode) -> ConfigResult<HostSpec> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("host name".to_string()))?;
    let port = get_u64_prop(node, "port")?
        .map(|p| {
            u16::try_from(p).map_err(|_| ConfigError::InvalidValue {
                field: "port".to_string(),
                message: format!("{p} is not a valid port"),
            })
        })
        .transpose()?;
    Ok(HostSpec {
        address: get_string_prop(node, "address").unwrap_or_else(|| name.clone()),
        name,
        user: get_string_prop(node, "user"),
        port,
        identity_file: get_string_prop(node, "identity"),
    })
}

fn parse_shell(node: &KdlNode) -> ConfigResult<StepAction> {
    let mut commands = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "run" {
                commands.extend(get_all_string_args(child));
            }
        }
    }
    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "shell '{}' run",
            get_first_string_arg(node).unwrap_or_default()
        )));
    }
    Ok(StepAction::Shell { commands })
}

fn parse_file(node: &KdlNode) -> ConfigResult<StepAction> {
    let dest =
        get_string_prop(node, "dest").ok_or_else(|| ConfigError::MissingField("file dest".to_string()))?;
    let content = node
        .children()
        .and_then(|c| c.nodes().iter().find(|n| n.name().value() == "content"))
        .and_then(get_first_string_arg)
        .ok_or_else(|| ConfigError::MissingField("file content".to_string()))?;
    Ok(StepAction::File {
        dest,
        content,
        mode: get_string_prop(node, "mode"),
    })
}
