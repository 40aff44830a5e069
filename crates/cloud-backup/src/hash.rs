//! Content fingerprints.
//!
//! SHA-256, hex encoded. Used for the identity fingerprint of a configured
//! path (hash of its normalized string) and for the content fingerprint of an
//! archive stream. Streams are hashed incrementally, never buffered whole.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

pub fn fingerprint_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    fingerprint_reader(File::open(path)?)
}

/// Identity fingerprint of a normalized path string.
pub fn path_identity(normalized: &Path) -> String {
    fingerprint_bytes(normalized.to_string_lossy().as_bytes())
}

/// Writer adapter that hashes everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Returns the inner writer, the hex digest and the number of bytes seen.
    pub fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn reader_and_bytes_agree() {
        let data = vec![7u8; 200_000];
        let a = fingerprint_bytes(&data);
        let b = fingerprint_reader(&data[..]).expect("hash reader");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn hashing_writer_matches_and_counts() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"hello ").expect("write");
        w.write_all(b"world").expect("write");
        let (inner, digest, n) = w.finish();
        assert_eq!(inner, b"hello world");
        assert_eq!(n, 11);
        assert_eq!(digest, fingerprint_bytes(b"hello world"));
    }

    #[test]
    fn identity_is_stable_per_path() {
        let p = PathBuf::from("/home/user/docs");
        assert_eq!(path_identity(&p), path_identity(&p.clone()));
        assert_ne!(path_identity(&p), path_identity(&PathBuf::from("/home/user/doc")));
    }
}
