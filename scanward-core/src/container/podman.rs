use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::ContainerRuntime;
use crate::command::CommandRunner;
use crate::engine::kesl::PODMAN_VFS_ROOT;
use crate::error::EngineError;
use crate::registry::Credentials;

/// `podman` CLI driver.
#[derive(Clone, Debug)]
pub struct Podman {
    runner: CommandRunner,
    cert_dir: String,
}

impl Podman {
    /// Unprivileged deployments keep images in a vfs store shared with the
    /// engine.
    pub fn new(
        program: impl Into<PathBuf>,
        privileged: bool,
        cert_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        let mut runner = CommandRunner::new(program, timeout);
        if !privileged {
            runner = runner.with_base_args(["--storage-driver", "vfs", "--root", PODMAN_VFS_ROOT]);
        }
        Self {
            runner,
            cert_dir: cert_dir.into().display().to_string(),
        }
    }

    fn tls_flag(tls: bool) -> String {
        format!("--tls-verify={tls}")
    }
}

#[async_trait]
impl ContainerRuntime for Podman {
    async fn login(&self, repository: &str, credentials: Option<&Credentials>) -> Result<(), EngineError> {
        let Some(creds) = credentials else {
            debug!(repository, "no credentials, login skipped");
            return Ok(());
        };
        debug!(repository, "registry login");
        self.runner
            .run(&[
                "login",
                repository,
                "-u",
                creds.user.as_str(),
                "-p",
                creds.pass.as_str(),
                "--cert-dir",
                self.cert_dir.as_str(),
            ])
            .await
            .map(drop)
    }

    async fn pull(&self, repository: &str, image: &str, tls: bool) -> Result<String, EngineError> {
        let reference = format!("{repository}/{image}");
        let tls = Self::tls_flag(tls);
        let stdout = self
            .runner
            .run(&["pull", "--cert-dir", self.cert_dir.as_str(), tls.as_str(), reference.as_str()])
            .await?;
        // Progress goes to stderr; the image id is the last stdout line.
        Ok(stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    async fn tag(&self, source: &str, destination: &str) -> Result<(), EngineError> {
        self.runner.run(&["tag", source, destination]).await.map(drop)
    }

    async fn push(&self, destination: &str, tls: bool) -> Result<(), EngineError> {
        let tls = Self::tls_flag(tls);
        self.runner
            .run(&["push", "--cert-dir", self.cert_dir.as_str(), tls.as_str(), destination])
            .await
            .map(drop)
    }

    async fn remove(&self, image_id: &str) -> Result<(), EngineError> {
        self.runner.run(&["rmi", image_id, "--force"]).await.map(drop)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    /// Stand-in `podman` that echoes its arguments and prints an image id.
    fn fake_podman(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("podman");
        let log = dir.path().join("args.log");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "#!/bin/sh\necho \"$@\" >> {}\necho 'Copying blob' >&2\necho 5f1b2c3d",
            log.display()
        )
        .unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn pull_returns_image_id_with_vfs_flags() {
        let dir = tempfile::tempdir().unwrap();
        let podman = Podman::new(fake_podman(&dir), false, "/certs", Duration::from_secs(5));

        let id = podman.pull("registry.local:5000", "team/app:1.0", true).await.unwrap();
        assert_eq!(id, "5f1b2c3d");

        let args = std::fs::read_to_string(dir.path().join("args.log")).unwrap();
        assert_eq!(
            args.trim(),
            "--storage-driver vfs --root /var/lib/containers/vfs-storage/ pull --cert-dir /certs --tls-verify=true registry.local:5000/team/app:1.0"
        );
    }

    #[tokio::test]
    async fn login_without_credentials_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let podman = Podman::new(fake_podman(&dir), true, "/certs", Duration::from_secs(5));
        podman.login("registry.local", None).await.unwrap();
        assert!(!dir.path().join("args.log").exists());

        podman
            .login("registry.local", Some(&Credentials::new("bob", "pw")))
            .await
            .unwrap();
        let args = std::fs::read_to_string(dir.path().join("args.log")).unwrap();
        assert_eq!(args.trim(), "login registry.local -u bob -p pw --cert-dir /certs");
    }
}
