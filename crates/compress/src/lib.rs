//! Compression and decompression for stored blobs.
//!
//! Snapshots are stored gzipped at the highest level; readers do not trust
//! the key they read from and detect the format from magic bytes instead
//! ([`Compression::from_magic_bytes`], [`Compression::decompress_detected`]),
//! so plain JSON written by hand or by an older writer still loads.
//!
//! - **In-memory** compression/decompression ([`Compression::compress`],
//!   [`Compression::decompress`])
//! - **Streaming** reads through [`Compression::wrap_reader`], used to feed
//!   gzipped tarballs straight into an archive reader

mod construct;
pub mod error;
mod ops;
mod util;

/// A supported compression format. Defaults to [`None`](Self::None)
/// (uncompressed).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Uncompressed
    #[default]
    None,
    /// Gzip compression (.gz)
    Gzip,
}
