//! SSH to worker nodes through the system `ssh` and `scp` clients.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::abort::StopSignal;
use crate::command::run;
use crate::{Error, Result};

const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "ConnectTimeout=15",
    "-o",
    "LogLevel=ERROR",
];

/// One SSH target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    /// Login user
    pub user: String,
    /// Public DNS name or IP
    pub host: String,
    /// Private key file
    pub key_path: PathBuf,
}

impl SshTarget {
    /// Target for `user@host` authenticated with `key_path`
    pub fn new(user: impl Into<String>, host: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            key_path: key_path.into(),
        }
    }

    fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// The command line an operator would type
    pub fn command_line(&self) -> String {
        format!(
            "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -i {} {}",
            self.key_path.display(),
            self.login()
        )
    }

    /// Run `remote` on the node and return its stdout
    pub async fn exec(&self, stop: &StopSignal, remote: &str, timeout: Duration) -> Result<String> {
        let key = self.key_path.display().to_string();
        let login = self.login();
        let mut args: Vec<&str> = SSH_OPTIONS.to_vec();
        args.extend(["-i", key.as_str(), login.as_str(), remote]);
        debug!(host = %self.host, command = %remote, "ssh exec");

        let out = run(stop, "ssh", &args, timeout).await?;
        if !out.success {
            return Err(Error::command(format!(
                "ssh {} {remote:?}: {}",
                self.host,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    /// Copy a remote file to `local`
    pub async fn download(
        &self,
        stop: &StopSignal,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> Result<()> {
        let key = self.key_path.display().to_string();
        let source = format!("{}:{remote}", self.login());
        let dest = local.display().to_string();
        let mut args: Vec<&str> = SSH_OPTIONS.to_vec();
        args.extend(["-i", key.as_str(), source.as_str(), dest.as_str()]);

        let out = run(stop, "scp", &args, timeout).await?;
        if !out.success {
            return Err(Error::command(format!(
                "scp {source}: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_is_copy_pasteable() {
        let t = SshTarget::new("ec2-user", "ec2-1-2-3-4.compute.amazonaws.com", "/tmp/test-001.ssh.pem");
        assert_eq!(
            t.command_line(),
            "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -i /tmp/test-001.ssh.pem ec2-user@ec2-1-2-3-4.compute.amazonaws.com"
        );
    }
}
