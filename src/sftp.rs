//! 文件传输
//!
//! Transfers go through the SFTP subsystem of the session's connection and
//! copy raw bytes in both directions. With `use_sudo`, data is staged in a
//! random `/tmp` file and moved into place (or copied out) by a command
//! running as the sudo user, since SFTP itself cannot elevate privileges.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

use crate::command::{RunOptions, Silent};
use crate::error::{JumpSshError, Result};
use crate::session::Session;
use crate::transport::FileChannel;
use crate::utils::{remote_temp_path, shell_quote};

/// Options shared by `put`, `get` and `file`.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// 通过 /tmp 中转，以 sudo 用户身份移动文件
    pub use_sudo: bool,
    pub sudo_user: String,
    /// `user` or `user:group`
    pub owner: Option<String>,
    /// Mode bits, e.g. `0o600`.
    pub permissions: Option<u32>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            use_sudo: false,
            sudo_user: "root".to_string(),
            owner: None,
            permissions: None,
        }
    }
}

impl TransferOptions {
    pub fn sudo(mut self) -> Self {
        self.use_sudo = true;
        self
    }

    pub fn sudo_as(mut self, user: impl Into<String>) -> Self {
        self.use_sudo = true;
        self.sudo_user = user.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn permissions(mut self, mode: u32) -> Self {
        self.permissions = Some(mode);
        self
    }
}

/// `user` becomes `user:user`.
pub fn full_owner(owner: &str) -> String {
    if owner.contains(':') {
        owner.to_string()
    } else {
        format!("{0}:{0}", owner)
    }
}

impl Session {
    fn transfer_err(&self, path: &str, reason: impl std::fmt::Display) -> JumpSshError {
        JumpSshError::Transfer {
            host: self.identity(),
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn file_channel(&self) -> Result<Box<dyn FileChannel>> {
        self.connection().await?.open_file_channel().await
    }

    // 以 sudo 用户执行辅助命令，失败时报告为传输错误
    async fn sudo_step(&self, command: String, options: &TransferOptions, path: &str) -> Result<()> {
        let run = RunOptions::default()
            .as_user(options.sudo_user.clone())
            .silent(Silent::All);
        match self.run_cmd(&command, run).await {
            Ok(_) => Ok(()),
            Err(JumpSshError::CommandFailed(result)) => Err(self.transfer_err(path, result.error_text())),
            Err(e) => Err(e),
        }
    }

    async fn apply_attributes(&self, remote_path: &str, options: &TransferOptions) -> Result<()> {
        let quoted = shell_quote(remote_path);
        if let Some(mode) = options.permissions.filter(|_| options.use_sudo) {
            self.sudo_step(format!("chmod {:o} {}", mode, quoted), options, remote_path)
                .await?;
        }
        if let Some(owner) = &options.owner {
            let command = format!("sudo chown {} {}", full_owner(owner), quoted);
            let run = RunOptions::default().silent(Silent::All);
            if let Err(e) = self.run_cmd(&command, run).await {
                return Err(match e {
                    JumpSshError::CommandFailed(result) => self.transfer_err(remote_path, result.error_text()),
                    other => other,
                });
            }
        }
        Ok(())
    }

    async fn upload<R>(&self, source: &mut R, remote_path: &str, options: &TransferOptions) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let staging = if options.use_sudo {
            remote_temp_path()
        } else {
            remote_path.to_string()
        };

        let channel = self.file_channel().await?;
        let written = async {
            let mut writer = channel.open_write(&staging).await?;
            let bytes = tokio::io::copy(source, &mut writer)
                .await
                .map_err(|e| self.transfer_err(&staging, e))?;
            writer.shutdown().await.map_err(|e| self.transfer_err(&staging, e))?;
            if let Some(mode) = options.permissions.filter(|_| !options.use_sudo) {
                channel.set_permissions(&staging, mode).await?;
            }
            Ok::<u64, JumpSshError>(bytes)
        }
        .await;
        if let Err(e) = channel.close().await {
            debug!("关闭 SFTP 通道失败: {}", e);
        }
        let bytes = written?;

        if options.use_sudo {
            let command = format!("mv {} {}", shell_quote(&staging), shell_quote(remote_path));
            self.sudo_step(command, options, remote_path).await?;
        }
        self.apply_attributes(remote_path, options).await?;
        Ok(bytes)
    }

    /// Uploads `local_path` to `remote_path`.
    ///
    /// Fails with `Io(NotFound)` before touching the network when the local
    /// file does not exist.
    pub async fn put(&self, local_path: impl AsRef<Path>, remote_path: &str, options: TransferOptions) -> Result<()> {
        let local_path = local_path.as_ref();
        let is_file = tokio::fs::metadata(local_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(JumpSshError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("本地文件 '{}' 不存在", local_path.display()),
            )));
        }

        debug!(
            "复制本地文件 '{}' 到 '{}' 的 '{}' (用户 {})",
            local_path.display(),
            self.host(),
            remote_path,
            self.user()
        );
        let mut source = File::open(local_path).await?;
        let bytes = self.upload(&mut source, remote_path, &options).await?;
        debug!("已上传 {} 字节到 '{}'", bytes, remote_path);
        Ok(())
    }

    /// Creates or overwrites `remote_path` with `content`.
    pub async fn file(&self, remote_path: &str, content: impl AsRef<[u8]>, options: TransferOptions) -> Result<()> {
        debug!("在 '{}' 上创建文件 '{}' (用户 {})", self.host(), remote_path, self.user());
        let mut source: &[u8] = content.as_ref();
        self.upload(&mut source, remote_path, &options).await?;
        Ok(())
    }

    /// Downloads `remote_path`. When `local_path` is an existing directory the
    /// remote file name is appended. Returns the local file written.
    pub async fn get(&self, remote_path: &str, local_path: impl AsRef<Path>, options: TransferOptions) -> Result<PathBuf> {
        let file_name = Path::new(remote_path)
            .file_name()
            .ok_or_else(|| JumpSshError::InvalidInput(format!("远程路径 '{}' 没有文件名", remote_path)))?;
        let local_path = local_path.as_ref();
        let is_dir = tokio::fs::metadata(local_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let destination = if is_dir {
            local_path.join(file_name)
        } else {
            local_path.to_path_buf()
        };

        let source = if options.use_sudo {
            let staging = remote_temp_path();
            let quoted = shell_quote(&staging);
            self.sudo_step(format!("cp {} {}", shell_quote(remote_path), quoted), &options, remote_path)
                .await?;
            self.sudo_step(format!("chmod a+r {}", quoted), &options, remote_path)
                .await?;
            staging
        } else {
            remote_path.to_string()
        };

        let downloaded = self.download(&source, &destination).await;

        if options.use_sudo {
            let cleanup = format!("rm -f {}", shell_quote(&source));
            if let Err(e) = self.sudo_step(cleanup, &options, &source).await {
                warn!("无法清理临时文件 '{}': {}", source, e);
            }
        }

        let bytes = downloaded?;
        debug!(
            "已从 '{}' 下载 '{}' 到 '{}' ({} 字节)",
            self.host(),
            remote_path,
            destination.display(),
            bytes
        );
        Ok(destination)
    }

    async fn download(&self, remote_path: &str, destination: &Path) -> Result<u64> {
        let channel = self.file_channel().await?;
        let copied = async {
            let mut reader = channel.open_read(remote_path).await?;
            let mut file = File::create(destination).await?;
            let bytes = tokio::io::copy(&mut reader, &mut file)
                .await
                .map_err(|e| self.transfer_err(remote_path, e))?;
            file.flush().await?;
            Ok::<u64, JumpSshError>(bytes)
        }
        .await;
        if let Err(e) = channel.close().await {
            debug!("关闭 SFTP 通道失败: {}", e);
        }
        copied
    }

    /// `Ok(false)` only when the path does not exist; transport and
    /// permission failures are returned as errors.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let channel = self.file_channel().await?;
        let found = channel.exists(path).await;
        if let Err(e) = channel.close().await {
            debug!("关闭 SFTP 通道失败: {}", e);
        }
        found
    }

    /// Existence check through `sudo ls`, for paths the user cannot stat.
    pub async fn sudo_exists(&self, path: &str) -> Result<bool> {
        let command = format!("sudo ls {}", shell_quote(path));
        let code = self
            .get_exit_code(&command, RunOptions::default().silent(Silent::All))
            .await?;
        Ok(code == 0)
    }
}
