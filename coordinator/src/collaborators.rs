//! Acceso a disco y validación de salidas, detrás de traits para poder
//! reemplazarlos en tests.

use async_trait::async_trait;
use std::io;
use std::path::Path;
use tracing::debug;

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Mueve `from` a `to`, creando el directorio destino si hace falta.
    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn remove_file(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // rename falla entre dispositivos; en ese caso copiamos y borramos
        if tokio::fs::rename(from, to).await.is_err() {
            debug!("rename {} falló, copiando", from.display());
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await?;
        }
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Decide si una salida ya existente sirve y el trabajo se puede saltear.
#[async_trait]
pub trait OutputVerifier: Send + Sync {
    async fn is_valid(&self, source: &Path, output: &Path) -> bool;
}

/// Válida si existe, no está vacía y es al menos tan nueva como la fuente.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExistingOutput;

#[async_trait]
impl OutputVerifier for ExistingOutput {
    async fn is_valid(&self, source: &Path, output: &Path) -> bool {
        let Ok(out) = tokio::fs::metadata(output).await else {
            return false;
        };
        if !out.is_file() || out.len() == 0 {
            return false;
        }
        match (
            tokio::fs::metadata(source).await.and_then(|m| m.modified()),
            out.modified(),
        ) {
            (Ok(src), Ok(dst)) => dst >= src,
            // sin fuente para comparar, alcanza con que exista
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn move_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("upload.bin");
        let to = dir.path().join("a").join("b").join("final.cbz");
        tokio::fs::write(&from, b"data").await.unwrap();

        let fs = LocalFileSystem;
        fs.move_file(&from, &to).await.unwrap();

        assert!(!fs.exists(&from).await);
        assert_eq!(tokio::fs::read(&to).await.unwrap(), b"data");
        fs.remove_file(&from).await.unwrap();
    }

    #[tokio::test]
    async fn verifier_rejects_missing_and_empty_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.cbz");
        let out = dir.path().join("out.cbz");
        tokio::fs::write(&src, b"src").await.unwrap();

        let v = ExistingOutput;
        assert!(!v.is_valid(&src, &out).await);

        tokio::fs::write(&out, b"").await.unwrap();
        assert!(!v.is_valid(&src, &out).await);

        tokio::fs::write(&out, b"upscaled").await.unwrap();
        assert!(v.is_valid(&src, &out).await);
    }
}
