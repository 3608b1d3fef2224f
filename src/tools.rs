//! Helper binary bootstrap: the provider CLI and kubectl.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::abort::StopSignal;
use crate::command::run;
use crate::config::Store;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Probe both helper binaries, downloading kubectl when it is missing
pub async fn ensure_tools(store: &Store, stop: &StopSignal) -> Result<()> {
    let (aws, kubectl, url) = store.read(|c| {
        (
            c.aws_cli_path.clone(),
            c.kubectl_path.clone(),
            c.kubectl_download_url.clone(),
        )
    });

    let version = probe(stop, &aws, &["--version"]).await.map_err(|e| {
        if e.is_aborted() {
            e
        } else {
            Error::validation(format!("provider CLI {aws:?} is not usable: {e}"))
        }
    })?;
    info!(path = %aws, version = %version.trim(), "provider CLI found");

    if !kubectl.is_empty() {
        match probe(stop, &kubectl, &["version", "--client"]).await {
            Ok(version) => info!(path = %kubectl, version = %first_line(&version), "kubectl found"),
            Err(e) if !e.is_aborted() && !url.is_empty() => {
                warn!(path = %kubectl, error = %e, "kubectl missing, downloading");
                download(&url, Path::new(&kubectl)).await?;
                let version = probe(stop, &kubectl, &["version", "--client"]).await?;
                info!(path = %kubectl, version = %first_line(&version), "kubectl installed");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn probe(stop: &StopSignal, binary: &str, args: &[&str]) -> Result<String> {
    let out = run(stop, binary, args, PROBE_TIMEOUT).await?;
    if !out.success {
        return Err(Error::command(format!("{binary} {}: {}", args.join(" "), out.stderr.trim())));
    }
    Ok(out.combined())
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default().trim()
}

/// Download `url` to `dest` and make it executable
pub async fn download(url: &str, dest: &Path) -> Result<()> {
    let retry = RetryConfig::with_max_attempts(3);
    let bytes = retry_with_backoff(&retry, "download", || async {
        let resp = reqwest::get(url).await?.error_for_status()?;
        Ok::<_, Error>(resp.bytes().await?)
    })
    .await?;

    if let Some(dir) = dest.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    std::fs::write(dest, &bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o755))?;
    }
    info!(url = %url, path = %dest.display(), bytes = bytes.len(), "downloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn store(aws: &str, kubectl: &str) -> Store {
        Store::new(Config {
            aws_cli_path: aws.into(),
            kubectl_path: kubectl.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn missing_provider_cli_is_a_validation_error() {
        let s = store("/nonexistent/aws-cli", "");
        let err = ensure_tools(&s, &StopSignal::new()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn missing_kubectl_without_url_fails() {
        // `true` stands in for a working provider CLI
        let s = store("true", "/nonexistent/kubectl");
        assert!(ensure_tools(&s, &StopSignal::new()).await.is_err());
    }

    #[test]
    fn first_line_trims() {
        assert_eq!(first_line("Client Version: v1.30.0\nKustomize Version: v5\n"), "Client Version: v1.30.0");
        assert_eq!(first_line(""), "");
    }
}
