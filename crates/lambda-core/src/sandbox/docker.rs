// src/sandbox/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput; // For LogOutput::StdOut, LogOutput::StdErr
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ExecConfig, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    RemoveContainerOptionsBuilder, StartContainerOptions as BollardStartContainerOptionsQuery,
    UploadToContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use super::{ContainerHandle, ExecOutput, SandboxRuntime};
use crate::config::ImageConfig;
use crate::errors::SandboxError;
use crate::language::SupportedLanguage;

pub const MANAGED_LABEL: &str = "lambda.managed";
pub const LANGUAGE_LABEL: &str = "lambda.language";

/// Container backend speaking to the local Docker daemon. With an OCI runtime
/// override (e.g. `runsc`) the same backend runs containers under gVisor.
pub struct DockerSandbox {
    docker: Docker,
    images: ImageConfig,
    oci_runtime: Option<String>,
    name: &'static str,
}

impl DockerSandbox {
    /// Backend using the daemon's default runtime.
    pub fn docker(images: ImageConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            images,
            oci_runtime: None,
            name: "docker",
        })
    }

    /// Backend that starts every container under the given gVisor runtime.
    pub fn gvisor(images: ImageConfig, runtime: impl Into<String>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            images,
            oci_runtime: Some(runtime.into()),
            name: "gvisor",
        })
    }

    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn create_body(&self, language: SupportedLanguage) -> ContainerCreateBody {
        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (LANGUAGE_LABEL.to_string(), language.to_string()),
        ]);

        ContainerCreateBody {
            image: Some(self.images.image_for(language).to_string()),
            // Keep the container alive and idle so it can be reused.
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            labels: Some(labels),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                runtime: self.oci_runtime.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn create_container(&self, name: &str, language: SupportedLanguage) -> Result<String, SandboxError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(name.to_string()),
            ..Default::default()
        });
        let response = self
            .docker
            .create_container(options, self.create_body(language))
            .await?;
        Ok(response.id)
    }

    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        log::info!("Pulling image {}", image);
        let pull_options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(image.to_string()),
            ..Default::default()
        });

        let mut pull_stream = self.docker.create_image(pull_options, None, None);
        while let Some(result) = pull_stream.next().await {
            result?;
        }
        Ok(())
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

/// Tar up `contents` as a single entry named `file_name`.
fn single_file_archive(file_name: &str, contents: &[u8]) -> Result<Vec<u8>, SandboxError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, file_name, contents)?;
    Ok(builder.into_inner()?)
}

/// Drain an attached exec stream into (stdout, stderr). Frames break at
/// arbitrary byte offsets, so bytes are joined per stream before decoding.
async fn collect_output<S>(mut output: S) -> Result<(String, String), SandboxError>
where
    S: Stream<Item = Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(frame) = output.next().await {
        match frame? {
            LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
            LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
            _ => {}
        }
    }
    Ok((
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    ))
}

/// Split an in-container path into its directory and file name.
fn split_remote_path(remote_path: &str) -> Result<(String, String), SandboxError> {
    let path = Path::new(remote_path);
    let dir = path
        .parent()
        .and_then(|p| p.to_str())
        .filter(|p| !p.is_empty());
    let file = path.file_name().and_then(|f| f.to_str());
    match (dir, file) {
        (Some(dir), Some(file)) => Ok((dir.to_string(), file.to_string())),
        _ => Err(SandboxError::Backend(format!(
            "Invalid in-container path: {}",
            remote_path
        ))),
    }
}

#[async_trait]
impl SandboxRuntime for DockerSandbox {
    fn backend_name(&self) -> &'static str {
        self.name
    }

    async fn spawn(&self, language: SupportedLanguage) -> Result<ContainerHandle, SandboxError> {
        let name = format!("lambda-{}-{}", language, Uuid::new_v4());

        let id = match self.create_container(&name, language).await {
            Ok(id) => id,
            Err(SandboxError::Bollard(e)) if is_not_found(&e) => {
                self.pull_image(self.images.image_for(language)).await?;
                self.create_container(&name, language).await?
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self
            .docker
            .start_container(&id, None::<BollardStartContainerOptionsQuery>)
            .await
        {
            // Don't leave a created-but-dead container behind.
            let _ = self
                .docker
                .remove_container(&id, Some(RemoveContainerOptionsBuilder::default().force(true).build()))
                .await;
            return Err(e.into());
        }

        log::info!("Spawned {} container {} ({})", language, name, self.name);
        Ok(ContainerHandle::new(id, language))
    }

    async fn copy_in(
        &self,
        handle: &ContainerHandle,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SandboxError> {
        let (remote_dir, file_name) = split_remote_path(remote_path)?;
        let contents = tokio::fs::read(local_path).await?;
        let archive = single_file_archive(&file_name, &contents)?;

        let options = UploadToContainerOptionsBuilder::default()
            .path(&remote_dir)
            .build();
        self.docker
            .upload_to_container(
                handle.id(),
                Some(options),
                bollard::body_full(archive.into()),
            )
            .await?;
        Ok(())
    }

    async fn exec_in(
        &self,
        handle: &ContainerHandle,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                handle.id(),
                ExecConfig {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let run = async {
            let (stdout, stderr) = match self
                .docker
                .start_exec(
                    &exec.id,
                    Some(StartExecOptions {
                        detach: false,
                        ..Default::default()
                    }),
                )
                .await?
            {
                StartExecResults::Attached { output, .. } => collect_output(output).await?,
                StartExecResults::Detached => {
                    return Err(SandboxError::Backend(
                        "exec started detached, output unavailable".to_string(),
                    ))
                }
            };

            let inspect = self.docker.inspect_exec(&exec.id).await?;
            Ok(ExecOutput {
                stdout,
                stderr,
                exit_code: inspect.exit_code.unwrap_or(-1),
            })
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("Execution timed out for container {}", handle.id());
                Err(SandboxError::Timeout(timeout))
            }
        }
    }

    async fn destroy(&self, handle: ContainerHandle) -> Result<(), SandboxError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self.docker.remove_container(handle.id(), Some(options)).await {
            Ok(()) => {
                log::debug!("Destroyed container {}", handle.id());
                Ok(())
            }
            Err(e) if is_not_found(&e) => Err(SandboxError::UnknownContainer(handle.id().to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
