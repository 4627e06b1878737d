use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{info, warn};

use shardkeep::{
    open_bundle, prepare_bundle, Bundle, Gateway, GatewayConfig, PeerCandidate, SealProfile,
};

#[derive(Parser)]
#[command(name = "shardkeep")]
#[command(about = "Client-side sealing and proof-of-residency for erasure-coded shard storage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal a file into an encrypted, erasure-coded bundle
    Seal {
        /// Path to the plaintext file
        #[arg(short, long)]
        file: PathBuf,
        /// Output path for the bundle (JSON)
        #[arg(short, long)]
        output: PathBuf,
        /// Sealing passphrase
        #[arg(short, long)]
        passphrase: String,
        /// Peer directory file (YAML list of candidates)
        #[arg(long)]
        peers: PathBuf,
        /// Replicas per shard
        #[arg(long, default_value_t = 3)]
        replicas: usize,
        /// Chunk size in bytes
        #[arg(long, default_value_t = 1024 * 1024)]
        chunk_size: usize,
        /// Data shards per chunk
        #[arg(long, default_value_t = 4)]
        data_shards: usize,
        /// Parity shards per chunk
        #[arg(long, default_value_t = 2)]
        parity_shards: usize,
    },
    /// Recover the plaintext from a bundle
    Open {
        /// Path to the bundle (JSON)
        #[arg(short, long)]
        bundle: PathBuf,
        /// Output path for the recovered file
        #[arg(short, long)]
        output: PathBuf,
        /// Sealing passphrase
        #[arg(short, long)]
        passphrase: String,
    },
    /// Verify a bundle's manifest and record its assignments
    Ingest {
        /// Path to the bundle (JSON)
        #[arg(short, long)]
        bundle: PathBuf,
        /// Configuration file path
        #[arg(short, long, default_value = "config/gateway.yaml")]
        config: String,
    },
    /// Expire overdue residency challenges
    Sweep {
        /// Configuration file path
        #[arg(short, long, default_value = "config/gateway.yaml")]
        config: String,
    },
    /// Print the residency evidence feed
    Evidence {
        /// Maximum rows to print
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
        /// Configuration file path
        #[arg(short, long, default_value = "config/gateway.yaml")]
        config: String,
    },
    /// Get registry statistics
    Stats {
        /// Configuration file path
        #[arg(short, long, default_value = "config/gateway.yaml")]
        config: String,
    },
    /// Health check for the service
    HealthCheck,
    /// Show version information
    Version,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Seal {
            file,
            output,
            passphrase,
            peers,
            replicas,
            chunk_size,
            data_shards,
            parity_shards,
        } => {
            info!("Sealing file: {:?} -> {:?}", file, output);

            let plaintext = std::fs::read(&file)?;
            let candidates: Vec<PeerCandidate> =
                serde_yaml::from_str(&std::fs::read_to_string(&peers)?)?;
            let profile = SealProfile::new(chunk_size, data_shards, parity_shards)?;

            let bundle = prepare_bundle(&plaintext, &passphrase, &profile, &candidates, replicas)?;
            std::fs::write(&output, serde_json::to_vec_pretty(&bundle)?)?;

            println!("Bundle prepared successfully!");
            println!("Object CID: {}", bundle.object_cid);
            println!("Manifest root: {}", bundle.manifest_root);
            println!(
                "Chunks: {}, shards: {}, replicas per shard: {}",
                bundle.chunk_count,
                bundle.shards.len(),
                replicas
            );

            Ok(())
        }
        Commands::Open {
            bundle,
            output,
            passphrase,
        } => {
            info!("Opening bundle: {:?} -> {:?}", bundle, output);

            let bundle: Bundle = serde_json::from_slice(&std::fs::read(&bundle)?)?;
            let plaintext = open_bundle(&bundle, &passphrase)?;
            std::fs::write(&output, &plaintext)?;

            println!("Bundle opened successfully!");
            println!("Recovered {} to {:?}", format_bytes(plaintext.len() as u64), output);

            Ok(())
        }
        Commands::Ingest { bundle, config } => {
            info!("Ingesting bundle: {:?}", bundle);

            let gateway = open_gateway(&config)?;
            let bundle: Bundle = serde_json::from_slice(&std::fs::read(&bundle)?)?;
            gateway.ingest_bundle(&bundle, SystemTime::now())?;

            println!("Bundle ingested successfully!");
            println!("Object CID: {}", bundle.object_cid);

            Ok(())
        }
        Commands::Sweep { config } => {
            let gateway = open_gateway(&config)?;
            let expired = gateway.sweep_expired(SystemTime::now())?;

            println!("Expired {} overdue challenges", expired);

            Ok(())
        }
        Commands::Evidence { limit, config } => {
            let gateway = open_gateway(&config)?;
            let feed = gateway.evidence_feed(limit)?;

            if feed.is_empty() {
                println!("No evidence recorded.");
            } else {
                println!("{:<36} {:<66}", "Challenge ID", "Response hash");
                println!("{}", "-".repeat(102));
                for evidence in feed {
                    println!(
                        "{:<36} {:<66}",
                        evidence.challenge_id,
                        hex::encode(&evidence.response_hash)
                    );
                }
            }

            Ok(())
        }
        Commands::Stats { config } => {
            let gateway = open_gateway(&config)?;
            let stats = gateway.stats()?;

            println!("Registry Statistics:");
            println!("  Gateway ID: {}", gateway.config().node_id);
            println!("  Registered nodes: {}", stats.node_count);
            println!("  Objects: {}", stats.object_count);
            println!("  Replica assignments: {}", stats.assignment_count);
            println!("  Pending challenges: {}", stats.pending_challenges);
            println!("  Verified challenges: {}", stats.verified_challenges);
            println!("  Evidence rows: {}", stats.evidence_count);

            Ok(())
        }
        Commands::HealthCheck => {
            info!("shardkeep health check");
            println!("OK");
            Ok(())
        }
        Commands::Version => {
            println!("shardkeep v{}", env!("CARGO_PKG_VERSION"));
            println!("Client-side sealing and proof-of-residency for shard storage");
            Ok(())
        }
    }
}

/// Load the gateway config, creating a default one on first run
fn open_gateway(config_path: &str) -> anyhow::Result<Gateway> {
    let config = if std::path::Path::new(config_path).exists() {
        GatewayConfig::from_file(config_path)?
    } else {
        warn!("Configuration file not found, creating default configuration");
        let default_config = GatewayConfig::default();

        if let Some(parent) = std::path::Path::new(config_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        default_config.save_to_file(config_path)?;
        info!("Default configuration saved to: {}", config_path);
        default_config
    };

    Ok(Gateway::new(config)?)
}

/// Format bytes in a human-readable format
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["shardkeep", "health-check"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_version_command() {
        let cli = Cli::try_parse_from(["shardkeep", "version"]);
        assert!(cli.is_ok());

        if let Ok(cli) = cli {
            match cli.command {
                Commands::Version => {}
                _ => panic!("Expected Version command"),
            }
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.0 MB");
    }
}
