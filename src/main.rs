use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use haul_config::{CallerClass, HaulConfig, StorageConfig};
use haul_reaper::Reaper;
use haul_storage::{LocalStorage, ObjectStorage, Storage, bytes_stream};
use haul_store::SqliteRepository;
use haul_transfer::{
  Assembler, ChunkUploadManager, DownloadStreamer, GuardedStream, TransferContext, TransferManager,
};

/// Haul - resumable chunked file transfer
#[derive(Parser)]
#[command(name = "haul")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the configuration file (default: ~/.haul/config.json if present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Owner id to act as (default: the nil id)
  #[arg(long, global = true)]
  owner: Option<Uuid>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Upload a file or directory as a new transfer
  Push {
    path: PathBuf,

    /// Lifetime of the transfer: 5m, 3h, 12h, 1d, 3d, 1w or never
    #[arg(long, default_value = "1d")]
    expiry: String,

    #[arg(long, default_value = "")]
    message: String,

    /// Upload with the guest size ceiling
    #[arg(long)]
    guest: bool,

    /// Continue an interrupted upload session instead of opening a new one
    #[arg(long)]
    resume: Option<Uuid>,
  },

  /// Download a transfer, or one of its files
  Pull {
    transfer_id: Uuid,

    /// Download only this file of the transfer
    #[arg(long)]
    file: Option<Uuid>,

    /// Directory to write into
    #[arg(long, default_value = ".")]
    out: PathBuf,
  },

  /// List your transfers
  List,

  /// Show a transfer and its files
  Info { transfer_id: Uuid },

  /// Change a transfer's message or restart its expiry
  Update {
    transfer_id: Uuid,

    #[arg(long, default_value = "")]
    message: String,

    #[arg(long)]
    expiry: Option<String>,
  },

  /// Delete a transfer
  Delete { transfer_id: Uuid },

  /// Abandon an upload session
  Cancel { session_id: Uuid },

  /// Reclaim stale sessions and expired transfers
  Reap {
    /// Sweep once and exit instead of running until interrupted
    #[arg(long)]
    once: bool,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();
  let config = load_config(cli.config.as_deref())?;
  let owner = cli.owner.unwrap_or_else(Uuid::nil);

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run(cli.command, config, owner).await })
}

fn load_config(path: Option<&Path>) -> Result<HaulConfig> {
  let path = match path {
    Some(path) => path.to_path_buf(),
    None => match dirs::home_dir().map(|home| home.join(".haul").join("config.json")) {
      Some(path) if path.exists() => path,
      _ => return Ok(HaulConfig::default()),
    },
  };
  let config = HaulConfig::load(&path)
    .with_context(|| format!("failed to load config: {}", path.display()))?;
  info!(path = %path.display(), "configuration loaded");
  Ok(config)
}

async fn open(config: &HaulConfig) -> Result<TransferContext> {
  let repo = SqliteRepository::connect(&config.database_url)
    .await
    .with_context(|| format!("failed to open database: {}", config.database_url))?;
  repo.migrate().await.context("failed to apply migrations")?;

  let storage: Arc<dyn Storage> = match &config.storage {
    StorageConfig::Local { root } => Arc::new(LocalStorage::new(root)),
    StorageConfig::Memory => {
      tracing::warn!("using in-memory storage; data is lost on exit");
      Arc::new(ObjectStorage::in_memory())
    }
    StorageConfig::S3 {
      bucket,
      region,
      endpoint,
    } => {
      let storage = ObjectStorage::s3(bucket, region.as_deref(), endpoint.as_deref())
        .with_context(|| format!("failed to configure S3 bucket: {bucket}"))?;
      info!(bucket = %bucket, "using S3 storage");
      Arc::new(storage)
    }
  };

  Ok(TransferContext::new(Arc::new(repo), storage, config.layout.clone()))
}

async fn run(command: Commands, config: HaulConfig, owner: Uuid) -> Result<()> {
  let ctx = open(&config).await?;

  match command {
    Commands::Push {
      path,
      expiry,
      message,
      guest,
      resume,
    } => {
      let class = if guest {
        CallerClass::Guest
      } else {
        CallerClass::Registered
      };
      let transfer_id =
        push(&ctx, &config, owner, class, &path, &expiry, &message, resume).await?;
      println!("{transfer_id}");
    }
    Commands::Pull {
      transfer_id,
      file,
      out,
    } => {
      let dest = pull(&ctx, transfer_id, file, &out).await?;
      println!("{}", dest.display());
    }
    Commands::List => {
      let transfers = TransferManager::new(ctx).list_transfers(owner).await?;
      for t in transfers {
        let expires = t
          .expires_at
          .map(|at| at.to_rfc3339())
          .unwrap_or_else(|| "never".to_string());
        println!(
          "{}\t{}\t{}\t{}\t{}",
          t.id,
          t.created_at.to_rfc3339(),
          expires,
          t.total_size,
          t.message
        );
      }
    }
    Commands::Info { transfer_id } => {
      let info = TransferManager::new(ctx).transfer_info(transfer_id).await?;
      println!("{}\t{}", info.transfer.id, info.transfer.message);
      for f in info.files {
        println!("  {}\t{}\t{}", f.id, f.size, f.name);
      }
    }
    Commands::Update {
      transfer_id,
      message,
      expiry,
    } => {
      let transfer = TransferManager::new(ctx)
        .update_transfer(transfer_id, owner, &message, expiry.as_deref())
        .await?;
      match transfer.expires_at {
        Some(at) => println!("expires {}", at.to_rfc3339()),
        None => println!("never expires"),
      }
    }
    Commands::Delete { transfer_id } => {
      TransferManager::new(ctx)
        .delete_transfer(transfer_id, owner)
        .await?;
    }
    Commands::Cancel { session_id } => {
      ChunkUploadManager::new(ctx, config.limits)
        .cancel_session(session_id, owner)
        .await?;
    }
    Commands::Reap { once } => {
      let reaper = Reaper::new(ctx, config.reaper);
      if once {
        let summary = reaper.sweep(Utc::now()).await;
        println!("sessions: {:?}", summary.sessions);
        println!("transfers: {:?}", summary.transfers);
        println!("scratch: {:?}", summary.scratch);
      } else {
        let handle = reaper.spawn();
        tokio::signal::ctrl_c()
          .await
          .context("failed to listen for interrupt")?;
        handle.stop().await;
      }
    }
  }

  Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn push(
  ctx: &TransferContext,
  config: &HaulConfig,
  owner: Uuid,
  class: CallerClass,
  path: &Path,
  expiry: &str,
  message: &str,
  resume: Option<Uuid>,
) -> Result<Uuid> {
  let source = path.to_path_buf();
  let spool = tokio::task::spawn_blocking(move || package_local(&source))
    .await
    .context("packaging task failed")??;
  let size = spool.metadata()?.len();
  let mut spool = tokio::fs::File::from_std(spool);

  let uploads = ChunkUploadManager::new(ctx.clone(), config.limits.clone());
  let (session_id, accepted) = match resume {
    Some(session_id) => {
      let accepted = uploads.list_accepted_indices(session_id, owner).await?;
      (session_id, accepted)
    }
    None => {
      let session_id = uploads
        .begin_session(owner, class, size, message, expiry)
        .await?;
      (session_id, Vec::new())
    }
  };
  eprintln!("Session: {session_id}");

  let chunk_bytes = config.limits.chunk_bytes;
  let count = size.div_ceil(chunk_bytes).max(1);
  for index in 0..count {
    let index = u32::try_from(index).context("too many chunks")?;
    if accepted.binary_search(&index).is_ok() {
      continue;
    }
    let offset = u64::from(index) * chunk_bytes;
    let len = chunk_bytes.min(size - offset);
    let mut buf = vec![0u8; len as usize];
    spool.seek(SeekFrom::Start(offset)).await?;
    spool.read_exact(&mut buf).await?;

    uploads
      .accept_chunk(session_id, index, owner, bytes_stream(Bytes::from(buf)))
      .await
      .with_context(|| format!("failed to upload chunk {index}"))?;
    eprintln!("Uploaded chunk {}/{count}", index + 1);
  }

  let transfer_id = Assembler::new(ctx.clone())
    .finalize(session_id, owner)
    .await
    .context("failed to finalize upload")?;
  Ok(transfer_id)
}

/// Zip a file or directory into an anonymous spool file, rewound to the start.
///
/// Entries carry no timestamps, so the same input always packages to the same
/// bytes and an interrupted upload can be resumed from a fresh package.
fn package_local(path: &Path) -> Result<File> {
  let options = SimpleFileOptions::default()
    .compression_method(CompressionMethod::Deflated)
    .large_file(true);
  let spool = tempfile::tempfile().context("failed to create spool file")?;
  let mut zip = ZipWriter::new(spool);

  let meta = std::fs::metadata(path).with_context(|| format!("cannot read {}", path.display()))?;
  if meta.is_dir() {
    add_dir(&mut zip, path, "", options)?;
  } else {
    let name = path
      .file_name()
      .with_context(|| format!("{} has no file name", path.display()))?
      .to_string_lossy();
    zip.start_file(name, options)?;
    io::copy(&mut File::open(path)?, &mut zip)?;
  }

  let mut spool = zip.finish()?;
  spool.rewind()?;
  Ok(spool)
}

fn add_dir(
  zip: &mut ZipWriter<File>,
  dir: &Path,
  prefix: &str,
  options: SimpleFileOptions,
) -> Result<()> {
  let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
  entries.sort_by_key(|e| e.file_name());

  for entry in entries {
    let name = format!("{prefix}{}", entry.file_name().to_string_lossy());
    if entry.file_type()?.is_dir() {
      let folder = format!("{name}/");
      zip.add_directory(folder.as_str(), options)?;
      add_dir(zip, &entry.path(), &folder, options)?;
    } else {
      zip.start_file(name.as_str(), options)?;
      io::copy(&mut File::open(entry.path())?, zip)?;
    }
  }
  Ok(())
}

async fn pull(
  ctx: &TransferContext,
  transfer_id: Uuid,
  file: Option<Uuid>,
  out: &Path,
) -> Result<PathBuf> {
  let streamer = DownloadStreamer::new(ctx.clone());
  let download = match file {
    Some(file_id) => {
      let info = TransferManager::new(ctx.clone())
        .transfer_info(transfer_id)
        .await?;
      if !info.files.iter().any(|f| f.id == file_id) {
        bail!("file {file_id} is not part of transfer {transfer_id}");
      }
      streamer.stream_file(file_id).await?
    }
    None => streamer.stream_transfer(transfer_id).await?,
  };

  // Only the last segment of the suggested name is trusted.
  let name = Path::new(&download.filename)
    .file_name()
    .map(|n| n.to_os_string())
    .unwrap_or_else(|| format!("{transfer_id}").into());
  let dest = out.join(name);

  let mut stream = download.stream;
  let copied = save(&mut stream, &dest).await;
  stream.close().await;
  copied.with_context(|| format!("failed to write {}", dest.display()))?;
  Ok(dest)
}

async fn save(stream: &mut GuardedStream, dest: &Path) -> Result<()> {
  let mut file = tokio::fs::File::create(dest).await?;
  while let Some(chunk) = stream.next().await {
    file.write_all(&chunk?).await?;
  }
  file.flush().await?;
  Ok(())
}
