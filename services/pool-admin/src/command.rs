//! Admin commands and their JSON output

use std::path::PathBuf;

use identity_pool::{Error, Pool};
use serde_json::{Value, json};

pub const USAGE: &str = "usage: identity-pool-admin [--config <path>] <command>

commands:
  stats                          pool counters
  identities                     one summary row per identity
  health                         healthy / degraded / unhealthy report
  import <file> <format>         add identities from delimited lines, e.g. handle:auth_token:ct0:proxy
  delete <handle>...             remove identities
  purge-inactive                 remove every inactive identity
  reset-locks                    clear every operation lock
  deactivate <handle> <reason>   take an identity out of rotation
  reactivate <handle>            put it back
  reset-counters <handle>        zero its usage counters
  set-group <handle> <group>     move it to another selector group";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stats,
    Identities,
    Health,
    Import { file: PathBuf, format: String },
    Delete { handles: Vec<String> },
    PurgeInactive,
    ResetLocks,
    Deactivate { handle: String, reason: String },
    Reactivate { handle: String },
    ResetCounters { handle: String },
    SetGroup { handle: String, group: i64 },
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let (name, rest) = args.split_first().ok_or("missing command")?;
        let command = match (name.as_str(), rest) {
            ("stats", []) => Command::Stats,
            ("identities", []) => Command::Identities,
            ("health", []) => Command::Health,
            ("import", [file, format]) => Command::Import {
                file: PathBuf::from(file),
                format: format.clone(),
            },
            ("delete", handles) if !handles.is_empty() => Command::Delete {
                handles: handles.to_vec(),
            },
            ("purge-inactive", []) => Command::PurgeInactive,
            ("reset-locks", []) => Command::ResetLocks,
            ("deactivate", [handle, reason @ ..]) if !reason.is_empty() => Command::Deactivate {
                handle: handle.clone(),
                reason: reason.join(" "),
            },
            ("reactivate", [handle]) => Command::Reactivate {
                handle: handle.clone(),
            },
            ("reset-counters", [handle]) => Command::ResetCounters {
                handle: handle.clone(),
            },
            ("set-group", [handle, group]) => Command::SetGroup {
                handle: handle.clone(),
                group: group
                    .parse()
                    .map_err(|_| format!("group must be an integer, got {group:?}"))?,
            },
            (name, _) => return Err(format!("unknown command or wrong arguments: {name}")),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Stats => "stats",
            Command::Identities => "identities",
            Command::Health => "health",
            Command::Import { .. } => "import",
            Command::Delete { .. } => "delete",
            Command::PurgeInactive => "purge-inactive",
            Command::ResetLocks => "reset-locks",
            Command::Deactivate { .. } => "deactivate",
            Command::Reactivate { .. } => "reactivate",
            Command::ResetCounters { .. } => "reset-counters",
            Command::SetGroup { .. } => "set-group",
        }
    }

    pub async fn run(&self, pool: &Pool) -> anyhow::Result<Value> {
        let output = match self {
            Command::Stats => serde_json::to_value(pool.stats().await?)?,
            Command::Identities => serde_json::to_value(pool.identities_info().await?)?,
            Command::Health => pool.health().await?,
            Command::Import { file, format } => {
                let text = std::fs::read_to_string(file)?;
                serde_json::to_value(pool.import_lines(&text, format).await?)?
            }
            Command::Delete { handles } => json!({ "deleted": pool.delete(handles).await? }),
            Command::PurgeInactive => json!({ "deleted": pool.purge_inactive().await? }),
            Command::ResetLocks => json!({ "reset": pool.reset_locks().await? }),
            Command::Deactivate { handle, reason } => {
                pool.deactivate(handle, reason).await?;
                json!({ "deactivated": handle })
            }
            Command::Reactivate { handle } => {
                pool.reactivate(handle).await?;
                json!({ "reactivated": handle })
            }
            Command::ResetCounters { handle } => {
                if !pool.store().reset_counters(handle).await? {
                    return Err(Error::NotFound(handle.clone()).into());
                }
                json!({ "reset": handle })
            }
            Command::SetGroup { handle, group } => {
                if !pool.store().set_group(handle, *group).await? {
                    return Err(Error::NotFound(handle.clone()).into());
                }
                json!({ "handle": handle, "group": group })
            }
        };
        Ok(output)
    }
}
