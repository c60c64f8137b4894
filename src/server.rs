use std::{env, path::PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::fs::create_dir_all;

use crate::{error::Error, tools::log::{log_info, LogServiceType}, Result};

const ENV_PORT: &str = "FACEGROUP_PORT";
const ENV_DIR: &str = "FACEGROUP_DIR";
const ENV_WORKERS: &str = "FACEGROUP_WORKERS";
const ENV_LINK: &str = "FACEGROUP_LINK_ORIGINALS";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Where reassembled uploads land, one directory per job.
    pub input_root: PathBuf,
    /// Where grouped originals, thumbs and the ledger land, one dir per job.
    pub output_root: PathBuf,
    pub topk: usize,
    pub min_cluster_size: usize,
    pub min_samples: Option<usize>,
    /// Symlink grouped originals instead of copying them.
    pub link_originals: bool,
    /// Worker pool bound for concurrent pipeline executions.
    pub workers: usize,
}

impl ServerConfig {
    /// Config rooted at an explicit directory; used by tests and by the
    /// `--dir` flag.
    pub fn for_root(root: PathBuf) -> Self {
        Self {
            port: 8080,
            input_root: root.join("data").join("input"),
            output_root: root.join("data").join("output"),
            topk: 3,
            min_cluster_size: 5,
            min_samples: None,
            link_originals: false,
            workers: 2,
        }
    }

    pub fn job_input_dir(&self, job_id: &str) -> PathBuf {
        self.input_root.join(job_id)
    }

    pub fn job_output_dir(&self, job_id: &str) -> PathBuf {
        self.output_root.join(job_id)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory (defaults to the platform config dir)
    #[arg(short, long)]
    dir: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Symlink grouped originals instead of copying
    #[arg(short, long)]
    link: bool,

    #[arg(short, long)]
    workers: Option<usize>,
}

pub async fn initialize_config() -> Result<ServerConfig> {
    let root = get_server_local_path().await?;
    log_info(LogServiceType::Register, format!("LocalPath: {:?}", root));

    let args = Args::parse();
    let mut config = ServerConfig::for_root(root);
    if let Some(port) = env::var(ENV_PORT).ok().and_then(|p| p.parse::<u16>().ok()).or(args.port) {
        config.port = port;
    }
    if let Some(workers) = env::var(ENV_WORKERS).ok().and_then(|w| w.parse::<usize>().ok()).or(args.workers) {
        config.workers = workers.max(1);
    }
    if args.link || env::var(ENV_LINK).map(|v| v == "1" || v.to_lowercase() == "true").unwrap_or(false) {
        config.link_originals = true;
    }

    create_dir_all(&config.input_root).await.map_err(|_| Error::ServerUnableToAccessLocalFolder)?;
    create_dir_all(&config.output_root).await.map_err(|_| Error::ServerUnableToAccessLocalFolder)?;

    Ok(config)
}

async fn get_server_local_path() -> Result<PathBuf> {
    let args = Args::parse();

    let dir_path = if let Some(argdir) = args.dir {
        PathBuf::from(&argdir)
    } else if let Ok(val) = env::var(ENV_DIR) {
        PathBuf::from(&val)
    } else {
        let Some(mut dir_path) = dirs::config_local_dir() else { return Err(Error::ServerUnableToAccessLocalFolder); };
        dir_path.push("facegroup");
        dir_path
    };

    let Ok(_) = create_dir_all(&dir_path).await else { return Err(Error::ServerUnableToAccessLocalFolder); };

    Ok(dir_path)
}
