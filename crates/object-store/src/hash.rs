//! Single-pass dual hashing for uploads.
//!
//! Objects are keyed by the hex SHA-384 of their content, while the backing
//! storage verifies uploads with a base64 SHA-256. Input streams cannot be
//! replayed, so both digests are accumulated by a tee writer while the
//! bytes are spooled to a temporary file.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256, Sha384};
use tokio::io::AsyncWrite;

/// Digests computed over one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHashes {
    /// Hex SHA-384, the canonical content hash and storage key.
    pub file: String,
    /// Base64 SHA-256, the integrity token handed to the backend.
    pub backend: String,
}

impl ContentHashes {
    pub fn of(data: &[u8]) -> Self {
        Self {
            file: hex::encode(Sha384::digest(data)),
            backend: backend_digest(data),
        }
    }
}

/// Base64 SHA-256 of `data`, as expected for backend integrity checks.
pub fn backend_digest(data: &[u8]) -> String {
    BASE64.encode(Sha256::digest(data))
}

/// Hash validation applied to a put before anything is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashPolicy {
    AcceptAny,
    MustEqual(String),
}

impl HashPolicy {
    /// Checks the computed hash, returning the expected value on mismatch.
    pub fn check(&self, computed: &str) -> Result<(), String> {
        match self {
            HashPolicy::AcceptAny => Ok(()),
            HashPolicy::MustEqual(expected) if expected.eq_ignore_ascii_case(computed) => Ok(()),
            HashPolicy::MustEqual(expected) => Err(expected.clone()),
        }
    }
}

/// Writer that forwards bytes to `inner` while feeding both digests.
///
/// Only bytes accepted by the inner writer are hashed, so the digests always
/// describe exactly what landed in the file.
#[derive(Debug)]
pub struct HashingWriter<W> {
    inner: W,
    file_hash: Sha384,
    backend_hash: Sha256,
    written: u64,
}

impl<W> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            file_hash: Sha384::new(),
            backend_hash: Sha256::new(),
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Consumes the writer, returning the inner writer, digests and byte count.
    pub fn finish(self) -> (W, ContentHashes, u64) {
        let hashes = ContentHashes {
            file: hex::encode(self.file_hash.finalize()),
            backend: BASE64.encode(self.backend_hash.finalize()),
        };
        (self.inner, hashes, self.written)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for HashingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.file_hash.update(&buf[..n]);
        this.backend_hash.update(&buf[..n]);
        this.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const HELLO_SHA384: &str = "fdbd8e75a67f29f701a4e040385e2e23986303ea10239211af907fcbb83578b3e417cb71ce646efd0819dd8c088de1bd";
    const HELLO_SHA256_B64: &str = "uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek=";

    #[tokio::test]
    async fn test_hashing_writer_computes_both_digests() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        writer.flush().await.unwrap();

        let (inner, hashes, written) = writer.finish();
        assert_eq!(inner, b"hello world");
        assert_eq!(written, 11);
        assert_eq!(hashes.file, HELLO_SHA384);
        assert_eq!(hashes.backend, HELLO_SHA256_B64);
        assert_eq!(hashes, ContentHashes::of(b"hello world"));
    }

    #[tokio::test]
    async fn test_copy_through_hashing_writer() {
        let data = vec![7u8; 256 * 1024];
        let mut writer = HashingWriter::new(Vec::new());
        let copied = tokio::io::copy(&mut data.as_slice(), &mut writer).await.unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(writer.written(), copied);

        let (_, hashes, _) = writer.finish();
        assert_eq!(hashes, ContentHashes::of(&data));
    }

    #[test]
    fn test_hash_policy() {
        assert!(HashPolicy::AcceptAny.check("abc").is_ok());
        assert!(HashPolicy::MustEqual(HELLO_SHA384.to_uppercase())
            .check(HELLO_SHA384)
            .is_ok());
        assert_eq!(
            HashPolicy::MustEqual("deadbeef".into()).check(HELLO_SHA384),
            Err("deadbeef".to_string())
        );
    }
}
