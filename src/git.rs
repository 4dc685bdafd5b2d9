//! Cloning through the `git` command line.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

use crate::traits::{CloneError, Cloner};

/// [`Cloner`] that shells out to `git clone`.
#[derive(Debug, Clone, Default)]
pub struct GitCli {
    shallow: bool,
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone only the latest commit (`--depth 1`).
    pub fn shallow(mut self, shallow: bool) -> Self {
        self.shallow = shallow;
        self
    }

    fn command(&self, url: &str, dest: &Path) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(["clone", "--quiet"]);
        if self.shallow {
            cmd.args(["--depth", "1"]);
        }
        cmd.arg("--").arg(url).arg(dest);
        // Never block on a credential prompt for private or vanished repositories.
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Cloner for GitCli {
    async fn clone_repository(&self, url: &str, dest: &Path) -> Result<(), CloneError> {
        let output = self.command(url, dest).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CloneError::Failed {
                url: url.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}
