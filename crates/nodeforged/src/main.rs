//! nodeforged: operator front end for the nodeforge composition core.
//!
//! Every subcommand opens the redb store, performs one operation and exits.
//! Remote side effects go through a dry-run service that only logs.
//!
//! # Usage
//!
//! ```text
//! nodeforged --db /var/lib/nodeforge/state.redb import catalog.json
//! nodeforged compose request.json
//! nodeforged set-state <node-id> failed
//! nodeforged decompose <node-id>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nodeforge_allocation::{
    AssemblyContext, DryRunRemote, FailNodeHandler, NodeAllocator, run_assembly_tasks,
};
use nodeforge_coordination::LockCoordinator;
use nodeforge_core::ForgeConfig;
use nodeforge_matcher::RequestedNode;
use nodeforge_state::{Catalog, NodeState, ResourceClass, ResourceRef, StateStore};

const DEFAULT_FILTER: &str = "info,nodeforged=debug,nodeforge=debug";

#[derive(Parser)]
#[command(name = "nodeforged", about = "Compose nodes out of pooled hardware")]
struct Cli {
    /// Path of the state database.
    #[arg(long, global = true, default_value = "nodeforge.redb")]
    db: PathBuf,

    /// Path of a nodeforge.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a discovered catalog (JSON) into the store.
    Import { catalog: PathBuf },

    /// Compose a node from a requested-node JSON file and assemble it.
    Compose {
        request: PathBuf,

        /// Stop after allocation; leave the node in `allocated`.
        #[arg(long)]
        no_assemble: bool,
    },

    /// Run the assembly steps of an allocated node.
    Assemble { node_id: String },

    /// List composed nodes.
    Nodes,

    /// Show one composed node.
    Show { node_id: String },

    /// Force a node into a new lifecycle state.
    SetState { node_id: String, state: NodeState },

    /// Detach one resource from a node.
    Detach {
        node_id: String,
        class: ResourceClass,
        resource_id: String,
    },

    /// Tear down an assembled or failed node.
    Decompose { node_id: String },

    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    run(cli).await
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ForgeConfig> {
    match path {
        Some(path) => ForgeConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(ForgeConfig::default()),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;

    if let Command::Config = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let store = StateStore::open(&cli.db).with_context(|| format!("opening {}", cli.db.display()))?;
    info!(path = ?cli.db, "state store opened");

    let context = Arc::new(AssemblyContext::new(
        Arc::new(store.clone()),
        Arc::new(DryRunRemote::new()),
        Arc::new(LockCoordinator::new()),
        &config,
    ));
    let allocator = NodeAllocator::new(Arc::clone(&context), &config);

    match cli.command {
        Command::Import { catalog } => {
            let catalog: Catalog = read_json(&catalog)?;
            let count = store.import_catalog(&catalog)?;
            println!("imported {count} records");
        }
        Command::Compose {
            request,
            no_assemble,
        } => {
            let requested: RequestedNode = read_json(&request)?;
            let outcome = allocator.compose(&requested).await?;
            let node_id = outcome.node.id.clone();
            if !no_assemble {
                let handler = FailNodeHandler::new(&node_id, context.state_changer().clone());
                run_assembly_tasks(&outcome.tasks, &handler).await?;
            }
            print_json(&allocator.get_node(&node_id)?)?;
        }
        Command::Assemble { node_id } => {
            let node = allocator.get_node(&node_id)?;
            let tasks = context.tasks_for(&node)?;
            let handler = FailNodeHandler::new(&node_id, context.state_changer().clone());
            run_assembly_tasks(&tasks, &handler).await?;
            print_json(&allocator.get_node(&node_id)?)?;
        }
        Command::Nodes => {
            for node in allocator.list_nodes()? {
                println!("{}\t{}\t{}\t{}", node.id, node.name, node.state, node.system_id);
            }
        }
        Command::Show { node_id } => print_json(&allocator.get_node(&node_id)?)?,
        Command::SetState { node_id, state } => {
            let node = context.state_changer().change_state(&node_id, state).await?;
            print_json(&node)?;
        }
        Command::Detach {
            node_id,
            class,
            resource_id,
        } => {
            let node = allocator
                .detach(&node_id, &ResourceRef::new(class, resource_id))
                .await?;
            print_json(&node)?;
        }
        Command::Decompose { node_id } => {
            let node = allocator.decompose(&node_id).await?;
            println!("decomposed {} ({} resources released)", node.id, node.resources.len());
        }
        Command::Config => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("nodeforged").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn parses_detach_arguments() {
        let parsed = cli(&["--db", "/tmp/x.redb", "detach", "n-1", "remote-drive", "vol-1"]);
        assert_eq!(parsed.db, PathBuf::from("/tmp/x.redb"));
        match parsed.command {
            Command::Detach {
                node_id,
                class,
                resource_id,
            } => {
                assert_eq!(node_id, "n-1");
                assert_eq!(class, ResourceClass::RemoteDrive);
                assert_eq!(resource_id, "vol-1");
            }
            _ => panic!("expected detach"),
        }
    }

    #[test]
    fn rejects_unknown_state() {
        let result = Cli::try_parse_from(["nodeforged", "set-state", "n-1", "exploded"]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn import_compose_and_decompose_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.redb");
        let catalog = dir.path().join("catalog.json");
        let request = dir.path().join("request.json");
        std::fs::write(
            &catalog,
            r#"{
                "systems": [{ "id": "sys-1", "service_id": "chassis-1", "name": "sled 1", "health": "ok" }],
                "processors": [{ "id": "cpu-0", "system_id": "sys-1", "total_cores": 8 }]
            }"#,
        )
        .unwrap();
        std::fs::write(&request, r#"{ "name": "web-1", "processors": [{}] }"#).unwrap();
        let db_arg = db.to_str().unwrap();

        run(cli(&["--db", db_arg, "import", catalog.to_str().unwrap()])).await.unwrap();
        run(cli(&["--db", db_arg, "compose", request.to_str().unwrap()])).await.unwrap();

        let store = StateStore::open(&db).unwrap();
        let nodes = store.list_nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].state, NodeState::Assembled);
        let node_id = nodes[0].id.clone();
        drop(store);

        run(cli(&["--db", db_arg, "decompose", &node_id])).await.unwrap();
        let store = StateStore::open(&db).unwrap();
        assert!(store.list_nodes().unwrap().is_empty());
    }
}
