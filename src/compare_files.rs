use std::io;
use std::path::Path;
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

use crate::storage::{ByteStream, StorageError};

/// Compares a local file against a remote object's bytes without buffering either whole.
pub async fn contents_equal(local: &Path, mut remote: ByteStream) -> Result<bool, StorageError> {
    debug!("Comparing {:?} with its remote copy", local);
    let mut file = BufReader::new(File::open(local).await?);
    let mut buf = Vec::new();
    let mut compared = 0u64;

    while let Some(chunk) = remote.next().await {
        let chunk = chunk?;
        buf.resize(chunk.len(), 0);
        match file.read_exact(&mut buf).await {
            Ok(_) => {}
            // the local file is shorter
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        if buf[..] != chunk[..] {
            return Ok(false);
        }
        compared += chunk.len() as u64;
    }

    // the remote is exhausted, so the local file must be too
    let mut probe = [0u8; 1];
    let trailing = file.read(&mut probe).await?;
    trace!("Compared {} bytes of {:?}", compared, local);
    Ok(trailing == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;

    fn remote(chunks: &[&'static [u8]]) -> ByteStream {
        let chunks: Vec<Result<Bytes, StorageError>> = chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
        stream::iter(chunks).boxed()
    }

    #[tokio::test]
    async fn equal_across_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello world").unwrap();

        assert!(contents_equal(&path, remote(&[b"hello", b" ", b"world"])).await.unwrap());
        assert!(!contents_equal(&path, remote(&[b"hello", b" ", b"there"])).await.unwrap());
    }

    #[tokio::test]
    async fn length_mismatch_is_unequal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();

        assert!(!contents_equal(&path, remote(&[b"hell"])).await.unwrap());
        assert!(!contents_equal(&path, remote(&[b"hello!"])).await.unwrap());
    }
}
