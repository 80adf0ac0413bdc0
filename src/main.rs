//! durable-inspect - read-only view of a durable runtime database.
//!
//! Commands:
//! - namespaces: namespaces owning keys or alarms
//! - instances: instances of a namespace with their key counts
//! - keys: stored keys (and values) of one instance
//! - alarms: pending alarms, earliest first
//! - id-from-name: the deterministic id a name maps to

use clap::{Parser, Subcommand};
use durable_core::storage::{ListOptions, Partition, StorageEngine};
use durable_core::types::InstanceId;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "durable-inspect", about = "Inspect a durable runtime database")]
struct Cli {
    /// Database file written by the runtime.
    #[arg(long, env = "DURABLE_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List namespaces.
    Namespaces,

    /// List instances of a namespace.
    Instances { namespace: String },

    /// List keys of one instance.
    Keys {
        namespace: String,

        /// Instance id (64 hex chars for named instances).
        #[arg(long, conflicts_with = "name")]
        id: Option<String>,

        /// Instance name; the id is derived from it.
        #[arg(long)]
        name: Option<String>,

        /// Only keys starting with this prefix.
        #[arg(long)]
        prefix: Option<String>,

        /// Also print values.
        #[arg(long)]
        values: bool,
    },

    /// List pending alarms.
    Alarms {
        /// Only alarms of this namespace.
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Print the id a name maps to within a namespace.
    IdFromName { namespace: String, name: String },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    durable_core::observability::init_tracing();
    let cli = Cli::parse();

    if let Command::IdFromName { namespace, name } = &cli.command {
        println!("{}", InstanceId::from_name(namespace, name));
        return Ok(());
    }

    let db = cli.db.ok_or("--db (or DURABLE_DB) is required")?;
    let engine = StorageEngine::open(&db)?;

    match cli.command {
        Command::Namespaces => {
            for namespace in engine.namespaces()? {
                println!("{}", namespace);
            }
        }
        Command::Instances { namespace } => {
            for summary in engine.instances(&namespace)? {
                println!("{}\t{} keys", summary.instance_id, summary.keys);
            }
        }
        Command::Keys {
            namespace,
            id,
            name,
            prefix,
            values,
        } => {
            let instance = match (id, name) {
                (Some(id), _) => InstanceId::from_string(id)?,
                (None, Some(name)) => InstanceId::from_name(&namespace, &name),
                (None, None) => return Err("one of --id or --name is required".into()),
            };
            let partition = Partition::new(namespace, instance);
            let options = prefix.map(ListOptions::prefix).unwrap_or_default();
            for (key, value) in engine.list_raw(&partition, &options)? {
                if values {
                    println!("{}\t{}", key, value);
                } else {
                    println!("{}", key);
                }
            }
        }
        Command::Alarms { namespace } => {
            for row in engine.list_alarms(namespace.as_deref())? {
                println!("{}\t{}", row.partition, row.fire_time.to_rfc3339());
            }
        }
        Command::IdFromName { .. } => {}
    }

    Ok(())
}
