//! Stream transforms: gzip compression and age encryption
//!
//! The codecs are synchronous, so each stage runs on the blocking pool and
//! talks to its async neighbours through [`SyncIoBridge`]. A stage owns its
//! output and shuts it down once the codec has been finished, which is what
//! lets the next stage observe end-of-stream.

use std::io::{self, Write};
use std::str::FromStr;

use age::x25519;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::AsyncWrite;
use tokio_util::io::SyncIoBridge;

use stowage_storage::BoxReader;

/// Byte sink handed between pipeline stages
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A single transform in a pipeline
pub enum Stage {
    /// gzip at the given level
    Compress {
        /// -2..=9, see [`gzip_level`]
        level: i8,
    },
    /// gunzip
    Decompress,
    /// age encryption to every recipient
    Encrypt {
        /// Parsed X25519 recipients
        recipients: Vec<x25519::Recipient>,
    },
    /// age decryption
    Decrypt {
        /// Parsed X25519 identity
        identity: x25519::Identity,
    },
}

impl Stage {
    /// Short name used in errors and logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Compress { .. } => "compress",
            Self::Decompress => "decompress",
            Self::Encrypt { .. } => "encrypt",
            Self::Decrypt { .. } => "decrypt",
        }
    }

    /// Transform everything read from `input` into `output`, then shut `output` down
    pub async fn run(self, input: BoxReader, output: BoxWriter) -> io::Result<()> {
        let input = SyncIoBridge::new(input);
        let output = SyncIoBridge::new(output);
        tokio::task::spawn_blocking(move || self.run_blocking(input, output))
            .await
            .map_err(io::Error::other)?
    }

    fn run_blocking(
        self,
        mut input: SyncIoBridge<BoxReader>,
        output: SyncIoBridge<BoxWriter>,
    ) -> io::Result<()> {
        let mut output = match self {
            Self::Compress { level } => {
                let mut encoder = GzEncoder::new(output, gzip_level(level));
                io::copy(&mut input, &mut encoder)?;
                encoder.finish()?
            }
            Self::Decompress => {
                let mut decoder = MultiGzDecoder::new(input);
                let mut output = output;
                io::copy(&mut decoder, &mut output)?;
                output
            }
            Self::Encrypt { recipients } => {
                let encryptor = age::Encryptor::with_recipients(
                    recipients.iter().map(|r| r as &dyn age::Recipient),
                )
                .map_err(io::Error::other)?;
                let mut writer = encryptor.wrap_output(output)?;
                io::copy(&mut input, &mut writer)?;
                writer.finish()?
            }
            Self::Decrypt { identity } => {
                let decryptor = age::Decryptor::new(input).map_err(io::Error::other)?;
                let mut reader = decryptor
                    .decrypt(std::iter::once(&identity as &dyn age::Identity))
                    .map_err(io::Error::other)?;
                let mut output = output;
                io::copy(&mut reader, &mut output)?;
                output
            }
        };
        output.flush()?;
        output.shutdown()
    }
}

/// Map a gzip level to flate2.
///
/// -1 selects the default level. -2 (huffman-only) has no flate2
/// counterpart and falls back to the fastest level.
pub fn gzip_level(level: i8) -> Compression {
    match level {
        -1 => Compression::default(),
        -2 => Compression::fast(),
        n => Compression::new(n.clamp(0, 9) as u32),
    }
}

/// Parse `age1...` recipients
pub fn parse_recipients(recipients: &[String]) -> Result<Vec<x25519::Recipient>, String> {
    recipients
        .iter()
        .map(|r| {
            x25519::Recipient::from_str(r.trim())
                .map_err(|e| format!("failed to parse recipient {:?}: {}", r, e))
        })
        .collect()
}

/// Parse an age identity from key file contents.
///
/// Comment lines written by `age-keygen` are skipped.
pub fn parse_identity(key: &[u8]) -> Result<x25519::Identity, String> {
    let text = std::str::from_utf8(key).map_err(|_| "identity is not valid UTF-8".to_string())?;
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .ok_or_else(|| "identity is empty".to_string())?;
    x25519::Identity::from_str(line).map_err(|e| format!("failed to parse identity: {}", e))
}
