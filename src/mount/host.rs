// Host mount table backed by /proc/mounts and the mount/umount/mkfs/blkid tools.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use nix::sys::stat::stat;
use tokio::process::Command;

use super::{MountPoint, Mounter};
use crate::error::MountError;

pub const PROC_MOUNTS: &str = "/proc/mounts";

#[derive(Debug, Clone)]
pub struct HostMounter {
    mount_table: PathBuf,
}

impl Default for HostMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMounter {
    pub fn new() -> Self {
        Self { mount_table: PathBuf::from(PROC_MOUNTS) }
    }

    /// Reads mounts from another file in /proc/mounts format.
    pub fn with_mount_table(path: impl Into<PathBuf>) -> Self {
        Self { mount_table: path.into() }
    }

    async fn run(program: &str, args: &[&str]) -> Result<Output, MountError> {
        tracing::debug!(program = %program, args = ?args, "run");
        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(MountError::Command {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Existing filesystem on `device`, if any.
    async fn probe_fs(device: &str) -> Result<Option<String>, MountError> {
        let output = Command::new("blkid")
            .args(["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device])
            .output()
            .await?;

        // blkid exits 2 when nothing is found on the device.
        if output.status.code() == Some(2) {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(MountError::Command {
                program: "blkid".into(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_blkid(device, &String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_blkid(device: &str, stdout: &str) -> Result<Option<String>, MountError> {
    let mut fs_type = None;
    let mut partitioned = false;
    for line in stdout.lines() {
        if let Some(value) = line.strip_prefix("TYPE=") {
            fs_type = Some(value.trim().to_string());
        } else if line.starts_with("PTTYPE=") {
            partitioned = true;
        }
    }
    if fs_type.is_none() && partitioned {
        return Err(MountError::Command {
            program: "blkid".into(),
            status: "partition table found".into(),
            stderr: format!("refusing to format {device}: disk has partitions"),
        });
    }
    Ok(fs_type)
}

fn mkfs_args<'a>(fs_type: &str, device: &'a str) -> Vec<&'a str> {
    match fs_type {
        "ext2" | "ext3" | "ext4" => vec!["-F", "-m0", device],
        _ => vec![device],
    }
}

/// Parses the /proc/mounts format, undoing the kernel's octal escapes.
pub fn parse_mounts(content: &str) -> Vec<MountPoint> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = unescape(fields.next()?);
            let path = unescape(fields.next()?);
            let fs_type = fields.next()?.to_string();
            let options = fields
                .next()
                .map(|o| o.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            Some(MountPoint { device, path: PathBuf::from(path), fs_type, options })
        })
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(value) = octal.and_then(|s| u8::from_str_radix(s, 8).ok()) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[async_trait]
impl Mounter for HostMounter {
    async fn list(&self) -> Result<Vec<MountPoint>, MountError> {
        let content = tokio::fs::read_to_string(&self.mount_table).await?;
        Ok(parse_mounts(&content))
    }

    async fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
    ) -> Result<(), MountError> {
        let fs = match Self::probe_fs(device).await? {
            Some(existing) => {
                if existing != fs_type {
                    tracing::warn!(device = %device, existing = %existing, requested = %fs_type, "Device already formatted, keeping existing filesystem");
                }
                existing
            }
            None => {
                tracing::info!(device = %device, fs_type = %fs_type, "Formatting device");
                Self::run(&format!("mkfs.{fs_type}"), &mkfs_args(fs_type, device)).await?;
                fs_type.to_string()
            }
        };

        let target = target.to_string_lossy();
        Self::run("mount", &["-t", &fs, device, &target]).await?;
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        Self::run("umount", &[&target.to_string_lossy()]).await?;
        Ok(())
    }

    async fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool, MountError> {
        let own = stat(path)?;
        let parent = path.parent().unwrap_or(Path::new("/"));
        let parent = stat(parent)?;
        Ok(own.st_dev == parent.st_dev)
    }
}
