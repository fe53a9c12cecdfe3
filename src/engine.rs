//! The library's single public entry point: wires a torrent descriptor, a
//! peer list and an output path into a running download.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::fs::File;

use crate::conf::CoordinatorConf;
use crate::error::{Error, Result};
use crate::metainfo::{Descriptor, Metainfo};
use crate::Coordinator;

/// Everything needed to start a single download.
pub struct Engine {
    descriptor: Descriptor,
    conf: CoordinatorConf,
    output_path: PathBuf,
}

impl Engine {
    /// Builds an engine from raw, already-fetched metainfo bytes and the
    /// path the payload should be written to.
    pub fn new(metainfo: &[u8], output_path: impl Into<PathBuf>, conf: CoordinatorConf) -> Result<Self> {
        let metainfo = Metainfo::from_bytes(metainfo).map_err(Error::Bencode)?;
        let descriptor = Descriptor::from_metainfo(&metainfo)?;
        Ok(Self {
            descriptor,
            conf,
            output_path: output_path.into(),
        })
    }

    /// The validated descriptor this engine will download.
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Creates the output file and runs the download to completion against
    /// the given peer addresses.
    ///
    /// Peer discovery (tracker/DHT) is an external concern: the caller
    /// supplies the address list, as the design's external-interfaces
    /// section describes.
    pub async fn run(self, peers: impl IntoIterator<Item = SocketAddr>) -> Result<()> {
        log::info!(
            "starting download of '{}' (infohash {}, {} pieces) to {}",
            self.descriptor.name,
            hex::encode(self.descriptor.infohash),
            self.descriptor.piece_count(),
            self.output_path.display()
        );
        let output = File::create(&self.output_path).await?;
        let coordinator = Coordinator::new(self.descriptor, self.conf);
        coordinator.run(peers, output).await
    }

    /// Convenience constructor that reads the metainfo from disk.
    pub async fn from_metainfo_file(
        path: impl AsRef<Path>,
        output_path: impl Into<PathBuf>,
        conf: CoordinatorConf,
    ) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Self::new(&bytes, output_path, conf)
    }
}
