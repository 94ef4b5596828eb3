//! Host-side staging of user source before it is copied into a container.

use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::language::SupportedLanguage;

/// A source file written to a private temp directory. The directory and the
/// file go away when this value is dropped, whichever way execution ends.
#[derive(Debug)]
pub struct StagedSource {
    _dir: TempDir,
    path: PathBuf,
    file_name: String,
}

impl StagedSource {
    pub async fn write(
        base_dir: Option<&Path>,
        language: SupportedLanguage,
        code: &str,
    ) -> std::io::Result<Self> {
        let mut builder = Builder::new();
        builder.prefix("lambda-stage-");
        let dir = match base_dir {
            Some(base) => builder.tempdir_in(base)?,
            None => builder.tempdir()?,
        };

        let file_name = format!("{}.{}", Uuid::new_v4(), language.extension());
        let path = dir.path().join(&file_name);

        let mut file = fs::File::create(&path).await?;
        file.write_all(code.as_bytes()).await?;
        file.flush().await?;

        Ok(Self {
            _dir: dir,
            path,
            file_name,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Location of this file once copied under `work_dir` in the container.
    pub fn remote_path(&self, work_dir: &str) -> String {
        format!("{}/{}", work_dir.trim_end_matches('/'), self.file_name)
    }
}
