//! SSH transport for rwave
//!
//! Transfers are driven from the seed: we open an SSH session to the host holding the file and
//! run `scp` there, pushing the file to the target. The local machine never relays file data,
//! which is what lets the number of parallel sources grow with every completed transfer.
//!
//! Sessions are established with [`openssh`] (multiplexed through the system `ssh` binary), so
//! the usual `~/.ssh/config`, keys and agent apply.

use anyhow::{anyhow, Context};
use tracing::instrument;

use common::registry::Target;
use common::seeds::Seed;
use common::transport::{TransferOutcome, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSession {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshSession {
    /// Parse `[user@]host` as used in host lists.
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let spec = spec.trim();
        let (user, host) = match spec.split_once('@') {
            Some((user, host)) => {
                if user.is_empty() {
                    return Err(anyhow!("empty user name in {:?}", spec));
                }
                (Some(user.to_string()), host)
            }
            None => (None, spec),
        };
        if host.is_empty() {
            return Err(anyhow!("missing host name in {:?}", spec));
        }
        if host.contains(['@', ':', '/']) || host.chars().any(char::is_whitespace) {
            return Err(anyhow!(
                "invalid host name {:?}, use --ssh-port or ~/.ssh/config for non-default ports",
                host
            ));
        }
        Ok(Self {
            user,
            host: host.to_string(),
            port: None,
        })
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    /// Destination string understood by `ssh`.
    pub fn destination(&self) -> String {
        let host = self.host.as_str();
        match (self.user.as_deref(), self.port) {
            (Some(user), Some(port)) => format!("ssh://{user}@{host}:{port}"),
            (None, Some(port)) => format!("ssh://{host}:{port}"),
            (Some(user), None) => format!("ssh://{user}@{host}"),
            (None, None) => format!("ssh://{host}"),
        }
    }
}

impl std::fmt::Display for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}@{}", user, self.host),
            None => write!(f, "{}", self.host),
        }
    }
}

/// Connection settings shared by every session of a run.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    /// Port used for all SSH and scp connections (None = ssh default / ~/.ssh/config)
    pub port: Option<u16>,
    /// Give up connecting to a host after this long
    pub connect_timeout: Option<std::time::Duration>,
    /// Extra options passed to scp on the seed, e.g. `-c aes128-ctr`
    pub scp_options: Vec<String>,
}

async fn setup_ssh_session(
    session: &SshSession,
    config: &SshConfig,
) -> anyhow::Result<openssh::Session> {
    let destination = session.destination();
    tracing::debug!("Connecting to SSH destination: {}", destination);
    let mut builder = openssh::SessionBuilder::default();
    builder
        .known_hosts_check(openssh::KnownHosts::Accept)
        .control_directory(std::env::temp_dir());
    if let Some(timeout) = config.connect_timeout {
        builder.connect_timeout(timeout);
    }
    builder
        .connect(&destination)
        .await
        .with_context(|| format!("Failed to establish SSH connection to {destination}"))
}

async fn close_session(session: openssh::Session, host: &SshSession) {
    if let Err(error) = session.close().await {
        tracing::debug!("failed closing SSH session to {}: {}", host, &error);
    }
}

/// Arguments for the `scp` invocation run on the seed.
pub fn scp_args(config: &SshConfig, seed: &Seed, target: &Target) -> Vec<String> {
    let mut args = vec!["-o".to_string(), "StrictHostKeyChecking=no".to_string()];
    if let Some(port) = config.port {
        args.push("-P".to_string());
        args.push(port.to_string());
    }
    args.extend(config.scp_options.iter().cloned());
    args.push(seed.path.clone());
    args.push(format!("{}:{}", target.host, target.path));
    args
}

fn describe_failure(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    match (stderr.trim(), stdout.trim()) {
        ("", "") => "scp exited without output".to_string(),
        (stderr, "") => stderr.to_string(),
        ("", stdout) => stdout.to_string(),
        (stderr, stdout) => format!("{stderr}\nstdout: {stdout}"),
    }
}

/// Moves the file by running `scp` on the seed over SSH.
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    config: SshConfig,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn session_for(&self, host: &str) -> anyhow::Result<SshSession> {
        Ok(SshSession::parse(host)?.with_port(self.config.port))
    }

    async fn run_scp(&self, seed: &Seed, target: &Target) -> anyhow::Result<std::process::Output> {
        let ssh_session = self.session_for(&seed.host)?;
        let session = setup_ssh_session(&ssh_session, &self.config).await?;
        let args = scp_args(&self.config, seed, target);
        tracing::debug!("running on {}: scp {}", &ssh_session, args.join(" "));
        let output = session
            .command("scp")
            .args(&args)
            .output()
            .await
            .with_context(|| format!("Failed to run scp on {ssh_session}"));
        close_session(session, &ssh_session).await;
        output
    }
}

impl Transport for SshTransport {
    #[instrument(skip_all, fields(seed = %seed, target = %target))]
    async fn transfer(&self, seed: &Seed, target: &Target) -> TransferOutcome {
        match self.run_scp(seed, target).await {
            Ok(output) if output.status.success() => TransferOutcome::Success,
            Ok(output) => TransferOutcome::failure(output.status.code(), describe_failure(&output)),
            Err(error) => TransferOutcome::failure(None, format!("{error:#}")),
        }
    }

    #[instrument(skip(self))]
    async fn is_reachable(&self, host: &str) -> bool {
        let ssh_session = match self.session_for(host) {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!("{:#}", &error);
                return false;
            }
        };
        let session = match setup_ssh_session(&ssh_session, &self.config).await {
            Ok(session) => session,
            Err(error) => {
                tracing::debug!("{} is not reachable: {:#}", &ssh_session, &error);
                return false;
            }
        };
        let status = session.raw_command("exit").status().await;
        close_session(session, &ssh_session).await;
        match status {
            Ok(status) => status.success(),
            Err(error) => {
                tracing::debug!("no-op command failed on {}: {}", &ssh_session, &error);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_host() -> anyhow::Result<()> {
        let session = SshSession::parse("node01")?;
        assert_eq!(
            session,
            SshSession {
                user: None,
                host: "node01".to_string(),
                port: None
            }
        );
        assert_eq!(session.destination(), "ssh://node01");
        Ok(())
    }

    #[test]
    fn parse_user_at_host() -> anyhow::Result<()> {
        let session = SshSession::parse(" deploy@node01.example.com ")?;
        assert_eq!(session.user.as_deref(), Some("deploy"));
        assert_eq!(session.host, "node01.example.com");
        assert_eq!(session.to_string(), "deploy@node01.example.com");
        assert_eq!(
            session.with_port(Some(2222)).destination(),
            "ssh://deploy@node01.example.com:2222"
        );
        Ok(())
    }

    #[test]
    fn parse_rejects_malformed_hosts() {
        for spec in ["", "@node", "user@", "node:22", "a@b@c", "node /x"] {
            assert!(SshSession::parse(spec).is_err(), "{spec:?} should not parse");
        }
    }

    #[test]
    fn scp_arguments() {
        let config = SshConfig {
            port: Some(2222),
            connect_timeout: None,
            scp_options: vec!["-c".to_string(), "aes128-ctr".to_string()],
        };
        let args = scp_args(
            &config,
            &Seed::new("node01", "/srv/image.tar"),
            &Target::new("deploy@node02", "/tmp/image.tar"),
        );
        assert_eq!(
            args,
            vec![
                "-o",
                "StrictHostKeyChecking=no",
                "-P",
                "2222",
                "-c",
                "aes128-ctr",
                "/srv/image.tar",
                "deploy@node02:/tmp/image.tar",
            ]
        );
    }

    #[test]
    fn scp_arguments_without_options() {
        let args = scp_args(
            &SshConfig::default(),
            &Seed::new("origin", "/data/f"),
            &Target::new("node7", "/data/f"),
        );
        assert_eq!(
            args,
            vec!["-o", "StrictHostKeyChecking=no", "/data/f", "node7:/data/f"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn failure_description_prefers_stderr() {
        use std::os::unix::process::ExitStatusExt;
        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(1 << 8),
            stdout: b"".to_vec(),
            stderr: b"scp: /tmp/x: Permission denied\n".to_vec(),
        };
        assert_eq!(describe_failure(&output), "scp: /tmp/x: Permission denied");
        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(1 << 8),
            stdout: vec![],
            stderr: vec![],
        };
        assert_eq!(describe_failure(&output), "scp exited without output");
    }

    #[tokio::test]
    async fn malformed_seed_fails_without_connecting() {
        let transport = SshTransport::default();
        let outcome = transport
            .transfer(&Seed::new("bad:host", "/f"), &Target::new("node1", "/f"))
            .await;
        assert!(!outcome.is_success());
        assert!(outcome.to_string().contains("invalid host name"));
    }
}
