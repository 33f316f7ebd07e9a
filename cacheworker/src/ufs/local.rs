//! 本地目录后端：把持久化存储路径映射到本地根目录下（实现 UnderFileSystem）。

use super::{UfsWriter, UnderFileSystem};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct LocalUnderFileSystem {
    root: PathBuf,
}

impl LocalUnderFileSystem {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl UnderFileSystem for LocalUnderFileSystem {
    async fn mkdirs(&self, path: &str) -> io::Result<()> {
        fs::create_dir_all(self.path_for(path)).await
    }

    async fn create(&self, path: &str) -> io::Result<UfsWriter> {
        let path = self.path_for(path);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let f = fs::File::create(path).await?;
        Ok(Box::new(f))
    }

    async fn rename(&self, src: &str, dst: &str) -> io::Result<()> {
        let dst = self.path_for(dst);
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::rename(self.path_for(src), dst).await
    }

    async fn delete(&self, path: &str, recursive: bool) -> io::Result<()> {
        let path = self.path_for(path);
        let meta = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(path).await
            } else {
                fs::remove_dir(path).await
            }
        } else {
            fs::remove_file(path).await
        }
    }

    async fn exists(&self, path: &str) -> io::Result<bool> {
        fs::try_exists(self.path_for(path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_create_rename_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let ufs = LocalUnderFileSystem::new(tmp.path());

        let mut w = ufs.create("/tmp/a/obj").await.unwrap();
        w.write_all(b"hello").await.unwrap();
        w.shutdown().await.unwrap();

        ufs.rename("/tmp/a/obj", "/data/obj").await.unwrap();
        assert!(!ufs.exists("/tmp/a/obj").await.unwrap());
        assert!(ufs.exists("/data/obj").await.unwrap());
        assert_eq!(
            std::fs::read(tmp.path().join("data/obj")).unwrap(),
            b"hello"
        );

        ufs.delete("/tmp", true).await.unwrap();
        assert!(!ufs.exists("/tmp").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let ufs = LocalUnderFileSystem::new(tmp.path());
        ufs.delete("/nothing/here", true).await.unwrap();
    }
}
