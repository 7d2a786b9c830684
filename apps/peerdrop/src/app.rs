//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use peerdrop_chunk_cache::{CacheRegistry, ChunkCache, MaterializedFile, MemoryStore, SqliteStore};
use peerdrop_protocol::{ChunkMetadata, Progress};
use peerdrop_session::mock::{LoopbackSignaling, MockPeerConnection};
use peerdrop_session::{PeerSession, Role, SessionEvent};
use peerdrop_transfer::{FileTransmitter, Mode, TransferEvent, TransferRegistry};
use tracing::{debug, info, warn};

use crate::config::Config;

/// One row of `peerdrop list`.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedTransfer {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub cached: u64,
    /// Merged or attached file, if any.
    pub path: Option<PathBuf>,
}

impl CachedTransfer {
    fn percent(&self) -> f64 {
        Progress {
            total: self.size,
            transferred: self.cached,
            bytes_per_second: 0.0,
        }
        .fraction()
            * 100.0
    }
}

fn open_registry(config: &Config) -> anyhow::Result<CacheRegistry> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let store = SqliteStore::open(config.db_path())
        .with_context(|| format!("opening {}", config.db_path().display()))?;
    Ok(CacheRegistry::new(Arc::new(store), config.cache_config()))
}

pub async fn list(config: &Config) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    let transfers = cached_transfers(&registry).await?;
    if transfers.is_empty() {
        println!("no cached transfers");
        return Ok(());
    }
    for t in transfers {
        let location = t
            .path
            .as_ref()
            .map_or_else(|| "-".to_string(), |p| p.display().to_string());
        println!(
            "{}  {:>6.1}%  {}/{} bytes  {}  {}",
            t.id,
            t.percent(),
            t.cached,
            t.size,
            t.name,
            location
        );
    }
    Ok(())
}

pub async fn evict(config: &Config, id: &str) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    evict_from(&registry, id).await?;
    println!("evicted {id}");
    Ok(())
}

pub async fn loopback(config: &Config, file: &Path) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    let (_, received) = transfer_loopback(config, &registry, file).await?;
    println!("{}", received.path.display());
    Ok(())
}

async fn cached_transfers(registry: &CacheRegistry) -> anyhow::Result<Vec<CachedTransfer>> {
    let mut out = Vec::new();
    for id in registry.ids().await? {
        let cache = registry.open(&id).await?;
        let Some(record) = cache.info() else {
            continue;
        };
        out.push(CachedTransfer {
            name: record.meta.file_name.clone(),
            size: record.meta.file_size,
            cached: cache.calc_cached_bytes().unwrap_or(0),
            path: record.materialized().map(|f| f.path),
            id,
        });
    }
    Ok(out)
}

async fn evict_from(registry: &CacheRegistry, id: &str) -> anyhow::Result<()> {
    let known = registry.ids().await?;
    anyhow::ensure!(known.iter().any(|k| k == id), "no cached transfer {id}");
    registry.evict(id).await?;
    Ok(())
}

/// Sends `file` between two in-process sessions and returns the transfer
/// id with the file materialized in `registry`.
async fn transfer_loopback(
    config: &Config,
    registry: &CacheRegistry,
    file: &Path,
) -> anyhow::Result<(String, MaterializedFile)> {
    let meta = describe(file, config.chunk_size)?;
    let transfer_config = config.transfer_config();
    transfer_config.validate_for(&meta)?;
    info!(
        transfer = %meta.id,
        file = %meta.file_name,
        size = meta.file_size,
        channels = config.channels,
        "starting loopback transfer"
    );

    // The sending end keeps its own volatile cache; the receive cache is the
    // persistent one.
    let source = ChunkCache::open(
        meta.id.clone(),
        Arc::new(MemoryStore::new()),
        config.cache_config(),
    )
    .await?;
    source.attach_file(meta.clone(), file).await?;
    let sender = FileTransmitter::new(Mode::Send, source, transfer_config.clone())?;

    let transfers = TransferRegistry::new();
    let receiver = transfers.insert(FileTransmitter::new(
        Mode::Receive,
        registry.open(&meta.id).await?,
        transfer_config,
    )?);
    let mut transfer_events = receiver.subscribe();

    let (local, remote) = session_pair(config);
    let mut remote_events = remote.subscribe();
    let (a, b) = tokio::join!(local.connect(), remote.connect());
    a?;
    b?;
    info!(session = %local.id(), "session connected");

    for channel in local.open_transfer_channels(&meta.id, config.channels)? {
        sender.attach_channel(channel);
    }

    let mut reported = 0;
    let outcome = loop {
        tokio::select! {
            Some(event) = remote_events.recv() => route(&transfers, event),
            event = transfer_events.recv() => match event {
                Some(TransferEvent::Complete) => break Ok(()),
                Some(TransferEvent::Error(e)) => break Err(anyhow!("transfer failed: {e}")),
                Some(TransferEvent::Progress(p)) => {
                    let decile = (p.fraction() * 10.0) as u32;
                    if decile > reported {
                        reported = decile;
                        info!(
                            transfer = %meta.id,
                            percent = decile * 10,
                            bytes_per_second = p.bytes_per_second as u64,
                            "progress"
                        );
                    }
                }
                Some(_) => {}
                None => break Err(anyhow!("transfer ended before completion")),
            },
            _ = tokio::signal::ctrl_c() => break Err(anyhow!("interrupted")),
        }
    };

    transfers.cancel_all();
    sender.cancel();
    local.destroy();
    remote.destroy();
    outcome?;

    let received = receiver
        .cache()
        .get_file()
        .await?
        .context("received file is incomplete")?;
    info!(transfer = %meta.id, path = %received.path.display(), "loopback transfer complete");
    Ok((meta.id, received))
}

/// Hands remote transfer channels to the matching transmitter.
fn route(transfers: &TransferRegistry, event: SessionEvent) {
    match event {
        SessionEvent::TransferChannel {
            transfer_id,
            channel,
        } => match transfers.get(&transfer_id) {
            Some(transmitter) => {
                debug!(transfer = %transfer_id, label = channel.label(), "channel attached");
                transmitter.attach_channel(channel);
            }
            None => warn!(transfer = %transfer_id, "channel for unknown transfer"),
        },
        SessionEvent::Error(e) => warn!(error = %e, "session error"),
        _ => {}
    }
}

/// Two connected sessions over mock primitives. The sending side is the
/// older one and therefore impolite.
fn session_pair(config: &Config) -> (PeerSession, PeerSession) {
    let (pc_local, pc_remote) = MockPeerConnection::pair();
    let (sig_local, sig_remote) = LoopbackSignaling::pair("sender", "receiver");
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);

    let local = PeerSession::new(
        Arc::new(pc_local),
        Arc::new(sig_local),
        Role::from_timestamps(now, now + 1, "sender", "receiver"),
        config.session_config(),
    );
    let remote = PeerSession::new(
        Arc::new(pc_remote),
        Arc::new(sig_remote),
        Role::from_timestamps(now + 1, now, "receiver", "sender"),
        config.session_config(),
    );
    (local, remote)
}

/// Builds transfer metadata for a local file under a fresh id.
fn describe(path: &Path, chunk_size: u64) -> anyhow::Result<ChunkMetadata> {
    let fs_meta =
        std::fs::metadata(path).with_context(|| format!("reading {}", path.display()))?;
    anyhow::ensure!(fs_meta.is_file(), "{} is not a regular file", path.display());
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("file name is not valid UTF-8")?
        .to_string();
    let last_modified = fs_meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64);

    Ok(ChunkMetadata {
        id: uuid::Uuid::new_v4().to_string(),
        file_name,
        file_size: fs_meta.len(),
        chunk_size,
        mime_type: None,
        last_modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(dir: &Path) -> Config {
        Config {
            data_dir: dir.join("data"),
            chunk_size: 8192,
            block_size: 1024,
            channels: 3,
            ..Config::default()
        }
    }

    #[test]
    fn describe_reads_file_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();

        let meta = describe(&path, 4).unwrap();
        assert_eq!(meta.file_name, "notes.txt");
        assert_eq!(meta.file_size, 5);
        assert_eq!(meta.chunk_count(), 2);
        assert!(meta.last_modified.is_some());
        assert!(describe(dir.path(), 4).is_err());
    }

    #[tokio::test]
    async fn loopback_round_trip_then_list_and_evict() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let source = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 251) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let registry = open_registry(&config).unwrap();
        let (id, received) = tokio::time::timeout(
            Duration::from_secs(30),
            transfer_loopback(&config, &registry, &source),
        )
        .await
        .expect("loopback timed out")
        .unwrap();

        assert_eq!(received.name, "payload.bin");
        assert_eq!(std::fs::read(&received.path).unwrap(), data);

        let listed = cached_transfers(&registry).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].cached, data.len() as u64);
        assert_eq!(listed[0].path.as_deref(), Some(received.path.as_path()));
        assert_eq!(listed[0].percent(), 100.0);

        evict_from(&registry, &id).await.unwrap();
        assert!(cached_transfers(&registry).await.unwrap().is_empty());
        assert!(!received.path.exists());
        assert!(evict_from(&registry, &id).await.is_err());
    }

    #[tokio::test]
    async fn empty_registry_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open_registry(&test_config(dir.path())).unwrap();
        assert!(cached_transfers(&registry).await.unwrap().is_empty());
    }
}
