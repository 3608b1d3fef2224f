//! kubeconfig rendering.
//!
//! The file uses exec auth through the provider CLI, so both `kubectl` and
//! the in-process client fetch their own tokens.

use std::path::Path;

use serde_json::json;

use crate::Result;

/// Inputs for one kubeconfig
#[derive(Clone, Debug)]
pub struct KubeconfigParams<'a> {
    /// Cluster name
    pub cluster_name: &'a str,
    /// Cluster ARN, used as the context name
    pub cluster_arn: &'a str,
    /// API server endpoint
    pub endpoint: &'a str,
    /// Base64 CA bundle as reported by the provider
    pub ca_base64: &'a str,
    /// Region
    pub region: &'a str,
    /// Provider CLI binary
    pub aws_cli_path: &'a str,
}

/// Render the kubeconfig document
pub fn render(p: &KubeconfigParams<'_>) -> Result<String> {
    let context = if p.cluster_arn.is_empty() {
        p.cluster_name
    } else {
        p.cluster_arn
    };
    let doc = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": context,
            "cluster": {
                "server": p.endpoint,
                "certificate-authority-data": p.ca_base64,
            },
        }],
        "contexts": [{
            "name": context,
            "context": { "cluster": context, "user": context },
        }],
        "current-context": context,
        "preferences": {},
        "users": [{
            "name": context,
            "user": {
                "exec": {
                    "apiVersion": "client.authentication.k8s.io/v1beta1",
                    "command": p.aws_cli_path,
                    "args": [
                        "--region", p.region,
                        "eks", "get-token",
                        "--cluster-name", p.cluster_name,
                    ],
                    "interactiveMode": "Never",
                },
            },
        }],
    });
    Ok(serde_yaml::to_string(&doc)?)
}

/// Write the kubeconfig with owner-only permissions
pub fn write(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
