//! Host-tool implementations of the capability traits.
//!
//! Every child process runs under the configured timeout; a child that
//! outlives it is killed and reported as a tooling failure.

use std::ffi::OsStr;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use tracing::debug;

use super::{DeltaCodec, ImageAssembler, OwnershipOracle, PackageSigner};
use crate::config::ToolConfig;
use crate::error::{OtaError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs `cmd` to completion, feeding it `stdin` and collecting its output.
///
/// A non-zero exit status is an error carrying the tool's stderr.
pub fn run(tool: &str, mut cmd: Command, stdin: Option<&[u8]>, timeout: Option<Duration>) -> Result<Output> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!(?cmd, "running {}", tool);

    let mut child = cmd
        .spawn()
        .map_err(|e| OtaError::tooling(tool, format!("failed to start: {}", e)))?;

    // Pipes are drained on helper threads so a chatty child can't fill a pipe
    // buffer and stall while we wait on it.
    let writer = match (stdin, child.stdin.take()) {
        (Some(data), Some(mut pipe)) => {
            let data = data.to_vec();
            Some(thread::spawn(move || pipe.write_all(&data)))
        }
        _ => None,
    };
    let stdout = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).map(|_| buf)
        })
    });
    let stderr = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).map(|_| buf)
        })
    });

    let deadline = timeout.map(|t| Instant::now() + t);
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(OtaError::tooling(
                    tool,
                    format!("timed out after {}s", timeout.unwrap_or_default().as_secs()),
                ));
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    // A child may legitimately exit without reading all of its input.
    if let Some(writer) = writer {
        let _ = writer.join();
    }
    let collect = |handle: Option<thread::JoinHandle<std::io::Result<Vec<u8>>>>| -> Result<Vec<u8>> {
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| OtaError::tooling(tool, "output reader panicked"))?
                .map_err(OtaError::from),
            None => Ok(Vec::new()),
        }
    };
    let output = Output { status, stdout: collect(stdout)?, stderr: collect(stderr)? };

    if !output.status.success() {
        return Err(OtaError::tooling(
            tool,
            format!("{}: {}", output.status, String::from_utf8_lossy(&output.stderr).trim()),
        ));
    }
    Ok(output)
}

fn command<S: AsRef<OsStr>>(program: PathBuf, args: &[S]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// `fs_config`: reads paths on stdin, prints `path uid gid mode` lines.
pub struct FsConfig {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl FsConfig {
    pub fn new(config: &ToolConfig) -> Self {
        Self { program: config.program("fs_config"), timeout: config.timeout }
    }
}

impl OwnershipOracle for FsConfig {
    fn query(&self, request: &str) -> Result<String> {
        let output = run(self.name(), command::<&str>(self.program.clone(), &[]), Some(request.as_bytes()), self.timeout)?;
        if !output.stderr.is_empty() {
            return Err(OtaError::tooling(self.name(), String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        String::from_utf8(output.stdout).map_err(|_| OtaError::tooling(self.name(), "output is not UTF-8"))
    }

    fn name(&self) -> &str {
        "fs_config"
    }
}

/// `bsdiff old new patch`.
pub struct Bsdiff {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl Bsdiff {
    pub fn new(config: &ToolConfig) -> Self {
        Self { program: config.program("bsdiff"), timeout: config.timeout }
    }
}

impl DeltaCodec for Bsdiff {
    fn diff(&self, source: &[u8], target: &[u8]) -> Result<Vec<u8>> {
        let dir = tempdir()?;
        let old = dir.path().join("source");
        let new = dir.path().join("target");
        let patch = dir.path().join("patch");
        fs::write(&old, source).map_err(|e| OtaError::io_at(e, &old))?;
        fs::write(&new, target).map_err(|e| OtaError::io_at(e, &new))?;

        run(self.name(), command(self.program.clone(), &[&old, &new, &patch]), None, self.timeout)?;
        fs::read(&patch).map_err(|e| OtaError::io_at(e, &patch))
    }

    fn name(&self) -> &str {
        "bsdiff"
    }
}

/// `mkbootfs | minigzip` for the ramdisk, then `mkbootimg`.
pub struct MkBootImg {
    mkbootfs: PathBuf,
    minigzip: PathBuf,
    mkbootimg: PathBuf,
    timeout: Option<Duration>,
}

impl MkBootImg {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            mkbootfs: config.program("mkbootfs"),
            minigzip: config.program("minigzip"),
            mkbootimg: config.program("mkbootimg"),
            timeout: config.timeout,
        }
    }
}

fn read_trimmed(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|e| OtaError::io_at(e, path))?;
    Ok(Some(text.trim().to_string()))
}

impl ImageAssembler for MkBootImg {
    fn assemble(&self, parts_dir: &Path) -> Result<Option<Vec<u8>>> {
        let kernel = parts_dir.join("kernel");
        if !kernel.exists() {
            return Ok(None);
        }

        let cpio = run("mkbootfs", command(self.mkbootfs.clone(), &[parts_dir.join("RAMDISK")]), None, self.timeout)?;
        let gz = run("minigzip", command::<&str>(self.minigzip.clone(), &[]), Some(&cpio.stdout), self.timeout)?;

        let scratch = tempdir()?;
        let ramdisk = scratch.path().join("ramdisk.img");
        let image = scratch.path().join("boot.img");
        fs::write(&ramdisk, &gz.stdout).map_err(|e| OtaError::io_at(e, &ramdisk))?;

        let mut cmd = Command::new(&self.mkbootimg);
        cmd.arg("--kernel").arg(&kernel);
        if let Some(cmdline) = read_trimmed(&parts_dir.join("cmdline"))? {
            cmd.arg("--cmdline").arg(cmdline);
        }
        if let Some(base) = read_trimmed(&parts_dir.join("base"))? {
            cmd.arg("--base").arg(base);
        }
        cmd.arg("--ramdisk").arg(&ramdisk).arg("--output").arg(&image);
        run(self.name(), cmd, None, self.timeout)?;

        let data = fs::read(&image).map_err(|e| OtaError::io_at(e, &image))?;
        Ok(Some(data))
    }

    fn name(&self) -> &str {
        "mkbootimg"
    }
}

/// `java -jar signapk.jar -w <key>.x509.pem <key>.pk8 <in> <out>`; the key
/// passphrase, if any, is written to stdin.
pub struct SignApk {
    jar: PathBuf,
    timeout: Option<Duration>,
}

impl SignApk {
    pub fn new(config: &ToolConfig) -> Self {
        Self { jar: config.signapk_jar(), timeout: config.timeout }
    }
}

impl PackageSigner for SignApk {
    fn sign(&self, unsigned: &Path, signed: &Path, key: &str, passphrase: Option<&str>) -> Result<()> {
        let mut cmd = Command::new("java");
        cmd.arg("-Xmx512m")
            .arg("-jar")
            .arg(&self.jar)
            .arg("-w")
            .arg(format!("{}.x509.pem", key))
            .arg(format!("{}.pk8", key))
            .arg(unsigned)
            .arg(signed);
        let stdin = passphrase.map(|p| format!("{}\n", p));
        run(self.name(), cmd, stdin.as_deref().map(str::as_bytes), self.timeout)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "signapk"
    }
}
