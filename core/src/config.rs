//! Typed configuration schema (spec §6): the `default` / `auth "<name>"` /
//! `resource "<name>"` HCL blocks the engine reads at startup, loaded
//! through `gc3_common::config::ConfigEngine`'s two-layer merge and
//! validated into the structs this module defines. The teacher's
//! `fetiche-common::Config` plays the same role on top of its
//! `ConfigEngine<T>`: a generic loader, and a crate-specific schema it's
//! instantiated over.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use gc3_common::{ConfigEngine, ConfigError, Quantity, Versioned};

use crate::resource::batch::flavour::{GridEngine, Lsf, Pbs, ScriptHooks, Slurm};
use crate::resource::batch::{BatchAdapter, GridEngineAdapter, LsfAdapter, PbsAdapter, SlurmAdapter};
use crate::resource::cloud::CloudPoolConfig;
use crate::resource::shell::ShellAdapter;
use crate::resource::transport::{SshCredentials, Transport};
use crate::resource::{Capabilities, Resource};

/// `default { ... }`: untyped fallbacks other sections may be layered over
/// (spec §6: "keys: any configuration key"). Kept as a string bag rather
/// than a fixed struct since the set of fallback-able keys grows with every
/// resource/auth key that chooses to support one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlobalDefaults {
    #[serde(flatten)]
    pub values: BTreeMap<String, String>,
}

/// `auth "<name>" { type = ... }` (spec §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthDescriptor {
    None,
    Ssh {
        username: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        keyfile: Option<PathBuf>,
        #[serde(default)]
        ssh_config: Option<PathBuf>,
        /// Humantime duration string (e.g. `"30s"`); defaults to 30s.
        #[serde(default)]
        timeout: Option<String>,
    },
    Ec2 {
        #[serde(default)]
        access_key: Option<String>,
        #[serde(default)]
        secret_key: Option<String>,
    },
}

impl AuthDescriptor {
    /// Resolve to [`SshCredentials`], applying §6's timeout parsing.
    /// Fails on anything but an `ssh` descriptor.
    pub fn ssh_credentials(&self) -> Result<SshCredentials, ConfigError> {
        match self {
            AuthDescriptor::Ssh { username, port, keyfile, ssh_config, timeout } => {
                let connect_timeout = match timeout {
                    Some(t) => humantime::parse_duration(t)
                        .map_err(|e| ConfigError::Validation(format!("invalid auth timeout {t:?}: {e}")))?,
                    None => Duration::from_secs(30),
                };
                Ok(SshCredentials {
                    username: username.clone(),
                    port: port.unwrap_or(22),
                    keyfile: keyfile.clone(),
                    ssh_config: ssh_config.clone(),
                    connect_timeout,
                })
            }
            other => Err(ConfigError::Validation(format!("auth descriptor is not ssh: {other:?}"))),
        }
    }

    /// Resolve EC2 credentials, falling back to `EC2_ACCESS_KEY`/
    /// `EC2_SECRET_KEY` per spec §6.
    pub fn ec2_credentials(&self) -> Result<(String, String), ConfigError> {
        match self {
            AuthDescriptor::Ec2 { access_key, secret_key } => {
                let access = access_key
                    .clone()
                    .or_else(|| std::env::var("EC2_ACCESS_KEY").ok())
                    .ok_or_else(|| ConfigError::Validation("ec2 auth missing access_key (and EC2_ACCESS_KEY unset)".into()))?;
                let secret = secret_key
                    .clone()
                    .or_else(|| std::env::var("EC2_SECRET_KEY").ok())
                    .ok_or_else(|| ConfigError::Validation("ec2 auth missing secret_key (and EC2_SECRET_KEY unset)".into()))?;
                Ok((access, secret))
            }
            other => Err(ConfigError::Validation(format!("auth descriptor is not ec2: {other:?}"))),
        }
    }
}

/// `resource "<name>" { type = ... }` (spec §6, common keys shared by every
/// back-end type; per-type keys beyond these live in `extra` until a
/// concrete deployment needs to promote one to a first-class field, the
/// same openness `default` has).
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auth: Option<String>,
    pub max_cores: u32,
    #[serde(default)]
    pub max_cores_per_job: Option<u32>,
    pub max_memory_per_core: String,
    pub max_walltime: String,
    #[serde(default)]
    pub architecture: Vec<String>,
    #[serde(default)]
    pub working_root: Option<String>,
    #[serde(default)]
    pub prologue: Option<String>,
    #[serde(default)]
    pub prologue_per_tag: BTreeMap<String, String>,
    #[serde(default)]
    pub epilogue: Option<String>,
    #[serde(default)]
    pub epilogue_per_tag: BTreeMap<String, String>,
    /// Batch flavours only: §4.2/§9's live-queue-vs-accounting grace
    /// window, as a humantime string. Defaults to 60s.
    #[serde(default)]
    pub grace_window: Option<String>,
    /// Anything this struct doesn't promote to a field yet (cloud-specific
    /// keys: `endpoint`, `region`, `image_id`, `flavour`, `keypair`,
    /// `security_group`, `user_data`, `pool_max_size`, `idle_window`, and
    /// their per-tag variants), kept verbatim per §6's forward-compatible
    /// "any configuration key" stance.
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Shellcmd,
    Sge,
    Pbs,
    Lsf,
    Slurm,
    #[serde(rename = "ec2+shellcmd")]
    Ec2ShellCmd,
}

impl ResourceDescriptor {
    pub fn capabilities(&self) -> Result<Capabilities, ConfigError> {
        let max_memory_per_core = Quantity::parse(&self.max_memory_per_core)
            .map_err(|e| ConfigError::Validation(format!("resource max_memory_per_core: {e}")))?;
        let max_walltime = Quantity::parse(&self.max_walltime)
            .map_err(|e| ConfigError::Validation(format!("resource max_walltime: {e}")))?;
        Ok(Capabilities {
            max_cores_total: self.max_cores,
            max_cores_per_task: self.max_cores_per_job.unwrap_or(self.max_cores),
            max_memory_per_core,
            max_walltime,
            architecture: self.architecture.clone(),
        })
    }

    fn hooks(&self) -> ScriptHooks {
        ScriptHooks {
            prologue_global: self.prologue.clone(),
            prologue_per_tag: self.prologue_per_tag.clone(),
            epilogue_global: self.epilogue.clone(),
            epilogue_per_tag: self.epilogue_per_tag.clone(),
        }
    }

    fn grace_window(&self) -> Result<Duration, ConfigError> {
        match &self.grace_window {
            Some(s) => humantime::parse_duration(s)
                .map_err(|e| ConfigError::Validation(format!("invalid grace_window {s:?}: {e}"))),
            None => Ok(Duration::from_secs(60)),
        }
    }

    fn working_root(&self) -> String {
        self.working_root.clone().unwrap_or_else(|| "/tmp/gc3pie".to_string())
    }

    /// Build the `Resource` for every back-end type this crate can
    /// construct without an externally-supplied dependency: the shell
    /// adapter and the four batch flavours. `ec2+shellcmd` needs a
    /// `CloudApi` implementation the caller supplies (spec §4.6; no real
    /// EC2/OpenStack SDK lives in this crate's dependency stack, see
    /// DESIGN.md), so it is built via [`ResourceDescriptor::cloud_pool_config`]
    /// instead.
    pub fn build(&self, name: &str, transport: std::sync::Arc<dyn Transport>) -> Result<Resource, ConfigError> {
        let capabilities = self.capabilities()?;
        let adapter: Box<dyn crate::resource::ResourceAdapter> = match self.kind {
            ResourceKind::Shellcmd => {
                let detected = num_cpus_best_effort();
                Box::new(ShellAdapter::new(transport, PathBuf::from(self.working_root()), detected, Some(self.max_cores)))
            }
            ResourceKind::Sge => {
                let a: GridEngineAdapter = BatchAdapter::new(GridEngine, transport, self.working_root(), self.hooks(), self.grace_window()?);
                Box::new(a)
            }
            ResourceKind::Pbs => {
                let a: PbsAdapter = BatchAdapter::new(Pbs, transport, self.working_root(), self.hooks(), self.grace_window()?);
                Box::new(a)
            }
            ResourceKind::Lsf => {
                let a: LsfAdapter = BatchAdapter::new(Lsf::default(), transport, self.working_root(), self.hooks(), self.grace_window()?);
                Box::new(a)
            }
            ResourceKind::Slurm => {
                let a: SlurmAdapter = BatchAdapter::new(Slurm, transport, self.working_root(), self.hooks(), self.grace_window()?);
                Box::new(a)
            }
            ResourceKind::Ec2ShellCmd => {
                return Err(ConfigError::Validation(format!(
                    "resource {name:?} is ec2+shellcmd: build via cloud_pool_config() with a CloudApi, not build()"
                )))
            }
        };
        Ok(Resource::new(name, self.enabled, capabilities, vec![], adapter))
    }

    /// Resolve the cloud-specific subset of `extra` into a [`CloudPoolConfig`]
    /// for `ec2+shellcmd` resources; the caller pairs this with an
    /// `Arc<dyn CloudApi>` (a real EC2/OpenStack client, or a test double)
    /// to finish constructing the pool.
    pub fn cloud_pool_config(&self, ssh_credentials: SshCredentials) -> Result<CloudPoolConfig, ConfigError> {
        if self.kind != ResourceKind::Ec2ShellCmd {
            return Err(ConfigError::Validation("cloud_pool_config() called on a non-ec2+shellcmd resource".into()));
        }
        let get = |key: &str| -> Result<String, ConfigError> {
            self.extra
                .get(key)
                .cloned()
                .ok_or_else(|| ConfigError::Validation(format!("ec2+shellcmd resource missing required key {key:?}")))
        };
        let per_tag = |prefix: &str| -> std::collections::HashMap<String, String> {
            self.extra
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(prefix).map(|tag| (tag.to_string(), v.clone())))
                .collect()
        };
        let pool_max_size: usize = self
            .extra
            .get("pool_max_size")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| ConfigError::Validation("pool_max_size must be an integer".into()))?
            .unwrap_or(1);
        let idle_window = match self.extra.get("idle_window") {
            Some(s) => humantime::parse_duration(s).map_err(|e| ConfigError::Validation(format!("invalid idle_window: {e}")))?,
            None => Duration::from_secs(600),
        };

        Ok(CloudPoolConfig {
            endpoint: get("endpoint")?,
            region: get("region")?,
            image_id: get("image_id")?,
            image_id_per_tag: per_tag("image_id_per_tag."),
            flavour: get("flavour")?,
            flavour_per_tag: per_tag("flavour_per_tag."),
            keypair: get("keypair")?,
            expected_keypair_fingerprint: self.extra.get("keypair_fingerprint").cloned(),
            security_group: get("security_group")?,
            required_rules: vec![],
            user_data: self.extra.get("user_data").cloned().unwrap_or_default(),
            user_data_per_tag: per_tag("user_data_per_tag."),
            pool_max_size,
            idle_window,
            ssh_credentials,
        })
    }
}

fn num_cpus_best_effort() -> u32 {
    std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
}

/// Top-level configuration schema: every recognized HCL block (spec §6).
///
/// Unlike `Task`/`TaskGroup`, this schema isn't round-tripped through the
/// Store, so it doesn't carry a `schema_version` field the way
/// `#[gc3_macros::add_version]` adds one — nothing writes a config file back
/// out, and forcing hand-authored HCL to declare a `schema_version` key
/// would be user-hostile. `Versioned` is still implemented (a constant `1`)
/// because `ConfigEngine<T>` is generic over it against a future schema
/// migration.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub default: GlobalDefaults,
    #[serde(default)]
    pub auth: BTreeMap<String, AuthDescriptor>,
    #[serde(default)]
    pub resource: BTreeMap<String, ResourceDescriptor>,
}

impl Versioned for RawConfig {
    fn schema_version(&self) -> usize {
        1
    }

    fn current_version() -> usize {
        1
    }
}

impl RawConfig {
    /// Load the layered system/user configuration (spec §6).
    pub fn load(explicit: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let config = ConfigEngine::<RawConfig>::load(explicit)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-section checks ConfigEngine's section-by-section merge can't
    /// enforce on its own: every `resource.auth` reference must name a
    /// declared `auth` block.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, res) in &self.resource {
            if let Some(auth_name) = &res.auth {
                if !self.auth.contains_key(auth_name) {
                    return Err(ConfigError::Validation(format!(
                        "resource {name:?} references undeclared auth {auth_name:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_resource_blocks_deserialize_from_hcl() {
        let hcl = r#"
            auth "cluster" {
                type = "ssh"
                username = "gc3user"
                port = 2222
            }
            resource "cluster" {
                type = "slurm"
                auth = "cluster"
                max_cores = 64
                max_memory_per_core = "4GiB"
                max_walltime = "8h"
                grace_window = "45s"
            }
        "#;
        let value: serde_json::Value = hcl::from_str(hcl).unwrap();
        let config: RawConfig = serde_json::from_value(value).unwrap();

        assert!(config.validate().is_ok());
        let res = &config.resource["cluster"];
        assert_eq!(res.kind, ResourceKind::Slurm);
        let caps = res.capabilities().unwrap();
        assert_eq!(caps.max_cores_total, 64);

        let auth = &config.auth["cluster"];
        let creds = auth.ssh_credentials().unwrap();
        assert_eq!(creds.username, "gc3user");
        assert_eq!(creds.port, 2222);
    }

    #[test]
    fn resource_referencing_unknown_auth_fails_validation() {
        let hcl = r#"
            resource "cluster" {
                type = "shellcmd"
                auth = "nonexistent"
                max_cores = 4
                max_memory_per_core = "1GiB"
                max_walltime = "1h"
            }
        "#;
        let value: serde_json::Value = hcl::from_str(hcl).unwrap();
        let config: RawConfig = serde_json::from_value(value).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn ec2_shellcmd_resource_resolves_cloud_pool_config_from_extra_keys() {
        let hcl = r#"
            resource "burst" {
                type = "ec2+shellcmd"
                max_cores = 8
                max_memory_per_core = "2GiB"
                max_walltime = "4h"
                endpoint = "https://ec2.eu-west-1.amazonaws.com"
                region = "eu-west-1"
                image_id = "ami-xyz"
                flavour = "m5.large"
                keypair = "gc3-key"
                security_group = "gc3-sg"
                pool_max_size = "3"
            }
        "#;
        let value: serde_json::Value = hcl::from_str(hcl).unwrap();
        let config: RawConfig = serde_json::from_value(value).unwrap();
        let res = &config.resource["burst"];

        let creds = SshCredentials {
            username: "ec2-user".into(),
            port: 22,
            keyfile: None,
            ssh_config: None,
            connect_timeout: Duration::from_secs(30),
        };
        let pool_config = res.cloud_pool_config(creds).unwrap();
        assert_eq!(pool_config.pool_max_size, 3);
        assert_eq!(pool_config.image_id, "ami-xyz");
    }
}
