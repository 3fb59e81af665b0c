use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dicom_gateway::config::config::Config;
use dimse::config::RemoteNode;
use dimse::scu::DimseScu;

#[derive(Parser)]
#[command(name = "dicom_gateway", about = "Hospital-side DICOM imaging gateway")]
struct Cli {
    /// Print resolved configuration (secrets masked) and exit.
    #[arg(long, global = true)]
    show_config: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the SCP plus the Quiescence Monitor and Auto-Forwarder workers.
    Receive,
    /// Fetch the central API metadata catalogue, de-anonymise it, and print it.
    Query,
    /// Offline restoration of a single anonymised DICOM file.
    RestoreFile {
        infile: PathBuf,
        outfile: PathBuf,
        #[arg(long)]
        map_file: Option<PathBuf>,
    },
    /// Downstream node management.
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },
    /// Manual one-shot packaging and upload of a study directory.
    UploadStudy { path: PathBuf },
    /// Print resolved configuration and exit.
    ShowConfig,
}

#[derive(Subcommand)]
enum NodeAction {
    List,
    Add {
        id: String,
        name: String,
        ip: String,
        port: u16,
        aet: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    Remove {
        id: String,
    },
    Enable {
        id: String,
    },
    Disable {
        id: String,
    },
    /// Send a C-ECHO to a configured node to verify connectivity.
    Test {
        id: String,
    },
    /// Clear forwarding-ledger entries for one node, or for all nodes.
    ClearTracking {
        #[arg(long)]
        node: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();

    if cli.show_config {
        print_config(&config);
        return Ok(());
    }

    match cli.command {
        None | Some(Commands::Receive) => {
            dicom_gateway::init_logging(&config);
            dicom_gateway::receive(config).await?;
        }
        Some(Commands::ShowConfig) => print_config(&config),
        Some(Commands::Query) => {
            let catalogue = dicom_gateway::query_catalogue(&config).await?;
            println!("{}", serde_json::to_string_pretty(&catalogue)?);
        }
        Some(Commands::RestoreFile {
            infile,
            outfile,
            map_file,
        }) => {
            dicom_gateway::restore_file(&config, &infile, &outfile, map_file.as_deref())?;
            println!("restored {} -> {}", infile.display(), outfile.display());
        }
        Some(Commands::UploadStudy { path }) => {
            dicom_gateway::upload_study(&config, &path).await?;
            println!("uploaded {}", path.display());
        }
        Some(Commands::Node { action }) => run_node_action(&config, action).await?,
    }

    Ok(())
}

fn print_config(config: &Config) {
    for line in config.as_display_lines() {
        println!("{line}");
    }
}

async fn run_node_action(config: &Config, action: NodeAction) -> anyhow::Result<()> {
    use dicom_gateway::node_manager::{NodeConfig, NodeManager};

    let nodes = NodeManager::load(config.nodes_file_path(), config.ledger_file_path())?;

    match action {
        NodeAction::List => {
            let stats = nodes.stats();
            println!(
                "{} node(s) configured, {} enabled",
                stats.total_nodes, stats.enabled_nodes
            );
            for (id, node) in stats.nodes {
                println!(
                    "  {id}: {} (enabled={}, series_sent={})",
                    node.name, node.enabled, node.series_sent
                );
            }
        }
        NodeAction::Add {
            id,
            name,
            ip,
            port,
            aet,
            description,
        } => {
            nodes.add_node(
                &id,
                NodeConfig {
                    name,
                    ip,
                    port,
                    aet,
                    enabled: true,
                    description,
                },
            )?;
            println!("added node {id}");
        }
        NodeAction::Remove { id } => {
            nodes.remove_node(&id)?;
            println!("removed node {id}");
        }
        NodeAction::Enable { id } => {
            nodes.set_enabled(&id, true)?;
            println!("enabled node {id}");
        }
        NodeAction::Disable { id } => {
            nodes.set_enabled(&id, false)?;
            println!("disabled node {id}");
        }
        NodeAction::Test { id } => {
            let node_config = nodes
                .get_node(&id)
                .ok_or_else(|| anyhow::anyhow!("no node named '{id}' is configured"))?;
            let dimse_config = dimse::config::DimseConfig {
                local_aet: config.ae_title.clone(),
                ..dimse::config::DimseConfig::default()
            };
            let scu = DimseScu::new(dimse_config);
            let remote = RemoteNode::new(node_config.aet, node_config.ip, node_config.port);
            scu.echo(&remote).await?;
            println!("C-ECHO to node {id} succeeded");
        }
        NodeAction::ClearTracking { node } => match node {
            Some(id) => {
                nodes.clear_tracking_for_node(&id)?;
                println!("cleared tracking for node {id}");
            }
            None => {
                nodes.clear_all_tracking()?;
                println!("cleared tracking for all nodes");
            }
        },
    }

    Ok(())
}
