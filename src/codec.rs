//! Tar and gzip encoding of a payload map, used for the image manifest
//! fallback.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, EntryType, Header};

use crate::digest::Digest;

/// Logical file name to text content.
pub type Payload = BTreeMap<String, String>;

const ENTRY_MODE: u32 = 0o600;

/// A gzip compressed tar archive together with the digest of the
/// uncompressed tar stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub compressed: Vec<u8>,
    /// Digest of the tar bytes before compression, the layer's diff id.
    pub diff_id:    Digest,
}

/// Writes one regular file entry per key, in key order, so equal payloads
/// always produce the same archive.
///
/// # Errors
///
/// Fails with [`io::ErrorKind::InvalidInput`] naming the key if a key cannot
/// be stored as a relative tar path: empty, absolute or with a `..` component.
pub fn encode(payload: &Payload) -> io::Result<EncodedPayload> {
    if let Some(name) = payload.keys().find(|name| !is_archive_path(name)) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("key `{name}` is not a relative file path"),
        ));
    }
    let mut builder = Builder::new(Vec::new());
    for (name, content) in payload {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(ENTRY_MODE);
        header.set_size(content.len() as u64);
        header.set_mtime(0);
        builder.append_data(&mut header, name, content.as_bytes())?;
    }
    let tar_bytes = builder.into_inner()?;
    let diff_id = Digest::sha256(&tar_bytes);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    let compressed = encoder.finish()?;
    Ok(EncodedPayload { compressed, diff_id })
}

fn is_archive_path(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('/') && !name.split('/').any(|component| component == "..")
}

/// Reads every regular file entry of a tar stream. Other entry types are
/// skipped. Entry names are returned as stored, unchecked.
///
/// # Errors
///
/// Fails on a truncated or corrupt archive, or on non UTF-8 content.
pub fn decode<R: Read>(reader: R) -> io::Result<Payload> {
    let mut payload = Payload::new();
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let mut content = String::new();
        entry.read_to_string(&mut content)?;
        payload.insert(name, content);
    }
    Ok(payload)
}

/// [`decode`] for a gzip compressed archive held in memory.
///
/// # Errors
///
/// See [`decode`]; a corrupt gzip stream fails the same way.
pub fn decode_gzip(compressed: &[u8]) -> io::Result<Payload> {
    decode(GzDecoder::new(compressed))
}
