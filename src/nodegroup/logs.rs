//! Node log collection over SSH.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use super::{NodeGroupDriver, Variant};
use crate::abort::StopSignal;
use crate::config::Config;
use crate::ssh::SshTarget;
use crate::{Error, Result};

const CONCURRENCY: usize = 10;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const REMOTE_TARBALL: &str = "/tmp/var-log.tar.gz";

/// Where the logs of one instance go
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogTarget {
    /// Pool variant
    pub variant: Variant,
    /// ASG or managed node group name
    pub group: String,
    /// Instance ID
    pub instance_id: String,
    /// SSH target
    pub ssh: SshTarget,
    /// Local directory for this instance
    pub dir: PathBuf,
}

/// Every instance with a public address in pools that fetch logs
pub fn log_targets(cfg: &Config) -> Vec<LogTarget> {
    let key = PathBuf::from(&cfg.remote_access_private_key_path);
    let mut out = Vec::new();

    let ngs = &cfg.add_on_node_groups;
    if ngs.enable && ngs.fetch_logs {
        for asg in ngs.asgs.values() {
            for inst in asg.instances.values() {
                if let Some(host) = public_host(&inst.public_dns, &inst.public_ip) {
                    out.push(LogTarget {
                        variant: Variant::SelfManaged,
                        group: asg.name.clone(),
                        instance_id: inst.instance_id.clone(),
                        ssh: SshTarget::new(&asg.remote_access_user_name, host, &key),
                        dir: Path::new(&ngs.logs_dir).join(&inst.instance_id),
                    });
                }
            }
        }
    }

    let mngs = &cfg.add_on_managed_node_groups;
    if mngs.enable && mngs.fetch_logs {
        for mng in mngs.mngs.values() {
            for inst in mng.instances.values() {
                if let Some(host) = public_host(&inst.public_dns, &inst.public_ip) {
                    out.push(LogTarget {
                        variant: Variant::Managed,
                        group: mng.name.clone(),
                        instance_id: inst.instance_id.clone(),
                        ssh: SshTarget::new(&mng.remote_access_user_name, host, &key),
                        dir: Path::new(&mngs.logs_dir).join(&inst.instance_id),
                    });
                }
            }
        }
    }
    out
}

pub(crate) fn public_host<'a>(dns: &'a str, ip: &'a str) -> Option<&'a str> {
    [dns, ip].into_iter().find(|s| !s.is_empty())
}

/// SSH target of the instance registered as Kubernetes node `node_name`
pub fn ssh_target_for_node(cfg: &Config, node_name: &str) -> Option<SshTarget> {
    let key = PathBuf::from(&cfg.remote_access_private_key_path);
    let asgs = cfg
        .add_on_node_groups
        .asgs
        .values()
        .map(|a| (&a.remote_access_user_name, &a.instances));
    let mngs = cfg
        .add_on_managed_node_groups
        .mngs
        .values()
        .map(|m| (&m.remote_access_user_name, &m.instances));
    asgs.chain(mngs).find_map(|(user, instances)| {
        instances
            .values()
            .find(|i| i.private_dns == node_name)
            .and_then(|i| public_host(&i.public_dns, &i.public_ip))
            .map(|host| SshTarget::new(user, host, &key))
    })
}

impl NodeGroupDriver {
    /// Download kubelet, kernel and `/var/log` from every node.
    ///
    /// Per-node failures are logged and skipped; only an abort is an error.
    pub async fn fetch_logs(&self, stop: &StopSignal) -> Result<()> {
        let targets = log_targets(&self.store.snapshot());
        if targets.is_empty() {
            return Ok(());
        }
        info!(nodes = targets.len(), "fetching node logs");

        let results: Vec<(LogTarget, Result<Vec<String>>)> = stream::iter(targets)
            .map(|t| async move {
                let res = collect(stop, &t).await;
                (t, res)
            })
            .buffer_unordered(CONCURRENCY)
            .collect()
            .await;

        let mut fetched = 0;
        for (t, res) in results {
            match res {
                Ok(files) => {
                    fetched += 1;
                    self.store.update(|c| record(c, &t, files));
                }
                Err(e) if e.is_aborted() => return Err(e),
                Err(e) => warn!(instance = %t.instance_id, group = %t.group, error = %e, "failed to fetch node logs"),
            }
        }
        info!(fetched, "node logs fetched");
        Ok(())
    }
}

fn record(cfg: &mut Config, t: &LogTarget, files: Vec<String>) {
    let logs = match t.variant {
        Variant::SelfManaged => cfg.add_on_node_groups.asgs.get_mut(&t.group).map(|a| &mut a.logs),
        Variant::Managed => cfg
            .add_on_managed_node_groups
            .mngs
            .get_mut(&t.group)
            .map(|m| &mut m.logs),
    };
    if let Some(logs) = logs {
        logs.insert(t.instance_id.clone(), files);
    }
}

async fn collect(stop: &StopSignal, t: &LogTarget) -> Result<Vec<String>> {
    tokio::fs::create_dir_all(&t.dir).await?;
    let mut files = Vec::new();

    for (name, cmd) in [
        ("kubelet.log", "sudo journalctl --no-pager --output=short-precise -u kubelet"),
        ("dmesg.log", "sudo dmesg"),
    ] {
        let out = t.ssh.exec(stop, cmd, COMMAND_TIMEOUT).await?;
        let path = t.dir.join(name);
        tokio::fs::write(&path, out).await?;
        files.push(path.display().to_string());
    }

    let tar = format!("sudo tar -czf {REMOTE_TARBALL} -C /var log 2>/dev/null; sudo chmod 0644 {REMOTE_TARBALL}");
    t.ssh.exec(stop, &tar, COMMAND_TIMEOUT).await?;
    let path = t.dir.join("var-log.tar.gz");
    t.ssh.download(stop, REMOTE_TARBALL, &path, COMMAND_TIMEOUT).await?;
    if !path.exists() {
        return Err(Error::command(format!("{} did not produce {}", t.instance_id, path.display())));
    }
    files.push(path.display().to_string());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Asg, Mng};
    use crate::provider::Instance;

    fn instance(id: &str, public_dns: &str) -> Instance {
        Instance {
            instance_id: id.into(),
            state: "running".into(),
            public_dns: public_dns.into(),
            ..Default::default()
        }
    }

    fn cfg() -> Config {
        let mut cfg = Config {
            remote_access_private_key_path: "/tmp/test-001.pem".into(),
            ..Default::default()
        };
        let ngs = &mut cfg.add_on_node_groups;
        ngs.enable = true;
        ngs.fetch_logs = true;
        ngs.logs_dir = "/tmp/test-001-logs-ngs".into();
        let mut asg = Asg {
            name: "test-001-ng-asg-cpu".into(),
            remote_access_user_name: "ec2-user".into(),
            ..Default::default()
        };
        asg.instances.insert("i-1".into(), instance("i-1", "ec2-1.compute.amazonaws.com"));
        asg.instances.insert("i-2".into(), instance("i-2", ""));
        ngs.asgs.insert(asg.name.clone(), asg);

        let mngs = &mut cfg.add_on_managed_node_groups;
        mngs.enable = true;
        mngs.fetch_logs = false;
        let mut mng = Mng {
            name: "test-001-mng-cpu".into(),
            ..Default::default()
        };
        mng.instances.insert("i-3".into(), instance("i-3", "ec2-3.compute.amazonaws.com"));
        mngs.mngs.insert(mng.name.clone(), mng);
        cfg
    }

    /// Story: only reachable nodes of pools that opted in are visited
    #[test]
    fn story_targets_skip_unreachable_and_opted_out() {
        let targets = log_targets(&cfg());
        assert_eq!(targets.len(), 1);
        let t = &targets[0];
        assert_eq!(t.instance_id, "i-1");
        assert_eq!(t.variant, Variant::SelfManaged);
        assert_eq!(t.ssh.user, "ec2-user");
        assert_eq!(t.dir, PathBuf::from("/tmp/test-001-logs-ngs/i-1"));
    }

    #[test]
    fn record_lands_on_the_owning_group() {
        let mut c = cfg();
        let t = log_targets(&c).remove(0);
        record(&mut c, &t, vec!["/tmp/x/kubelet.log".into()]);
        assert_eq!(
            c.add_on_node_groups.asgs["test-001-ng-asg-cpu"].logs["i-1"],
            vec!["/tmp/x/kubelet.log".to_string()]
        );
    }

    #[test]
    fn node_name_resolves_through_private_dns() {
        let mut c = cfg();
        c.add_on_managed_node_groups
            .mngs
            .get_mut("test-001-mng-cpu")
            .unwrap()
            .instances
            .get_mut("i-3")
            .unwrap()
            .private_dns = "ip-10-0-1-3.ec2.internal".into();
        let ssh = ssh_target_for_node(&c, "ip-10-0-1-3.ec2.internal").unwrap();
        assert_eq!(ssh.host, "ec2-3.compute.amazonaws.com");
        assert!(ssh_target_for_node(&c, "ip-10-0-9-9.ec2.internal").is_none());
    }

    #[test]
    fn public_ip_is_the_fallback_host() {
        assert_eq!(public_host("", "1.2.3.4"), Some("1.2.3.4"));
        assert_eq!(public_host("", ""), None);
    }
}
