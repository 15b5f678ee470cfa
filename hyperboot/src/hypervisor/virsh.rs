//! libvirt backend driven through the `virsh` command line client.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::HypervisorBackend;
use crate::errors::{ProvisionError, ProvisionResult};

/// Substrings of virsh stderr that mean the daemon could not be reached.
const CONNECTION_FAILURES: &[&str] = &[
    "failed to connect",
    "Failed to connect socket",
    "no connection driver available",
    "Cannot recv data",
    "End of file while reading data",
];

/// Substrings of `virsh destroy` stderr that mean there is nothing to stop.
const ALREADY_STOPPED: &[&str] = &[
    "Domain not found",
    "failed to get domain",
    "domain is not running",
];

#[derive(Debug, Clone)]
pub struct VirshBackend {
    program: PathBuf,
    uri: String,
}

impl VirshBackend {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            program: PathBuf::from("virsh"),
            uri: uri.into(),
        }
    }

    /// Use a specific `virsh` binary instead of the one on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Run one virsh subcommand and return its trimmed stdout.
    ///
    /// Non-connection failures are mapped through `rejected`.
    async fn run<I, S>(
        &self,
        args: I,
        rejected: fn(String) -> ProvisionError,
    ) -> ProvisionResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-c")
            .arg(&self.uri)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Deadline expiry drops this future; the child must not outlive it.
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            ProvisionError::HypervisorUnavailable(format!(
                "Failed to run {}: {}",
                self.program.display(),
                e
            ))
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::debug!(
            uri = %self.uri,
            status = %output.status,
            stderr = %stderr,
            "virsh command failed"
        );
        Err(classify_failure(stderr, rejected))
    }
}

fn classify_failure(stderr: String, rejected: fn(String) -> ProvisionError) -> ProvisionError {
    if CONNECTION_FAILURES.iter().any(|s| stderr.contains(s)) {
        ProvisionError::HypervisorUnavailable(stderr)
    } else {
        rejected(stderr)
    }
}

#[async_trait]
impl HypervisorBackend for VirshBackend {
    async fn define_and_start(
        &self,
        name: &str,
        descriptor_path: &Path,
    ) -> ProvisionResult<String> {
        self.run(
            [OsStr::new("define"), descriptor_path.as_os_str()],
            ProvisionError::DomainDefinitionRejected,
        )
        .await?;

        if let Err(e) = self
            .run(["start", name], ProvisionError::DomainDefinitionRejected)
            .await
        {
            // Leave no defined-but-stopped domain behind.
            if let Err(undefine) = self
                .run(["undefine", name], ProvisionError::Internal)
                .await
            {
                tracing::warn!(domain = %name, "Failed to undefine after failed start: {}", undefine);
            }
            return Err(e);
        }

        let raw = self.run(["domuuid", name], ProvisionError::Internal).await?;
        let id = uuid::Uuid::parse_str(&raw).map_err(|e| {
            ProvisionError::Internal(format!("virsh returned invalid UUID {:?}: {}", raw, e))
        })?;
        Ok(id.hyphenated().to_string())
    }

    async fn destroy(&self, name: &str) -> ProvisionResult<()> {
        match self.run(["destroy", name], ProvisionError::Internal).await {
            Ok(_) => Ok(()),
            Err(ProvisionError::Internal(stderr))
                if ALREADY_STOPPED.iter().any(|s| stderr.contains(s)) =>
            {
                tracing::debug!(domain = %name, "Domain already stopped: {}", stderr);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            "error: failed to connect to the hypervisor".into(),
            ProvisionError::DomainDefinitionRejected,
        );
        assert!(matches!(err, ProvisionError::HypervisorUnavailable(_)));

        let err = classify_failure(
            "error: XML error: Invalid value for attribute 'address'".into(),
            ProvisionError::DomainDefinitionRejected,
        );
        assert!(matches!(err, ProvisionError::DomainDefinitionRejected(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let backend = VirshBackend::new("qemu:///system")
            .with_program("/nonexistent/hyperboot-virsh");

        let err = backend
            .define_and_start("vm1", Path::new("/tmp/vm1.xml"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::HypervisorUnavailable(_)));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scripted_virsh() {
        let dir = tempfile::TempDir::new().unwrap();
        // Args are `-c <uri> <subcommand> ...`.
        let accepting = write_script(
            dir.path(),
            "virsh-ok",
            "#!/bin/sh\n\
             case \"$3\" in\n\
               domuuid) echo 6f1c8a52-9c1e-4f4e-8a43-0b8a1d3c2e11 ;;\n\
               *) echo ok ;;\n\
             esac\n",
        );
        let rejecting = write_script(
            dir.path(),
            "virsh-reject",
            "#!/bin/sh\necho 'error: XML error: bad mac' >&2\nexit 1\n",
        );
        let descriptor = dir.path().join("vm1.xml");

        let id = VirshBackend::new("qemu:///system")
            .with_program(&accepting)
            .define_and_start("vm1", &descriptor)
            .await
            .unwrap();
        assert_eq!(id, "6f1c8a52-9c1e-4f4e-8a43-0b8a1d3c2e11");

        let err = VirshBackend::new("qemu:///system")
            .with_program(&rejecting)
            .define_and_start("vm1", &descriptor)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ProvisionError::DomainDefinitionRejected(ref m) if m.contains("bad mac"))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scripted_destroy() {
        let dir = tempfile::TempDir::new().unwrap();
        let gone = write_script(
            dir.path(),
            "virsh-gone",
            "#!/bin/sh\n\
             echo \"error: failed to get domain '$4'\" >&2\n\
             echo 'error: Domain not found: no domain with matching name' >&2\n\
             exit 1\n",
        );
        let stuck = write_script(
            dir.path(),
            "virsh-stuck",
            "#!/bin/sh\necho 'error: Failed to destroy domain: device busy' >&2\nexit 1\n",
        );

        VirshBackend::new("qemu:///system")
            .with_program(&gone)
            .destroy("vm1")
            .await
            .unwrap();

        let err = VirshBackend::new("qemu:///system")
            .with_program(&stuck)
            .destroy("vm1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Internal(ref m) if m.contains("device busy")));
    }
}
