//! Control-channel connection to one hypervisor process.
//!
//! The hypervisor exposes an HTTP/1.1 API over a Unix socket. A `Monitor`
//! either spawns a fresh process and creates the VM on it, or reattaches to
//! the socket of a process that was already running when the daemon started.
//! It also maintains the thread inventory used by the placement engine,
//! discovered by scanning `/proc/<pid>/task`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, trace, warn};

pub const API_ROOT: &str = "/api/v1";

const VM_CREATE: &str = "vm.create";
const VM_BOOT: &str = "vm.boot";
const VM_SHUTDOWN: &str = "vm.shutdown";
const VM_INFO: &str = "vm.info";
const VMM_PING: &str = "vmm.ping";
const VMM_SHUTDOWN: &str = "vmm.shutdown";

/// Poll interval while waiting for the API socket to appear after spawn.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Run state reported by the hypervisor in `vm.info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum VmState {
    Created,
    Running,
    Shutdown,
    Paused,
}

/// Snapshot of the hypervisor's view of the VM.
#[derive(Debug, Clone)]
pub struct VmInfo {
    pub state: VmState,
    pub console_path: Option<PathBuf>,
    pub serial_path: Option<PathBuf>,
}

#[derive(Deserialize)]
struct RawInfo {
    state: VmState,
    config: Option<RawVmConfig>,
}

#[derive(Deserialize)]
struct RawVmConfig {
    console: Option<RawChardev>,
    serial: Option<RawChardev>,
}

#[derive(Deserialize)]
struct RawChardev {
    file: Option<PathBuf>,
}

/// Functional role of one OS thread inside the hypervisor process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadRole {
    Emulator { name: String },
    Vcpu { index: u32 },
    IoThread { name: String },
    Unknown,
}

/// One discovered hypervisor thread. Rebuilt wholesale on every refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub tid: i32,
    pub role: ThreadRole,
}

/// Classify a thread by its comm name. vCPU threads are named `vcpu<N>`;
/// virtio device threads handle I/O; everything else with a name belongs to
/// the emulator proper (vmm, http-server, signal handler, ...).
pub fn classify_comm(comm: &str) -> ThreadRole {
    let name = comm.trim();
    if name.is_empty() {
        return ThreadRole::Unknown;
    }
    if let Some(rest) = name.strip_prefix("vcpu") {
        if let Ok(index) = rest.parse::<u32>() {
            return ThreadRole::Vcpu { index };
        }
    }
    if name.starts_with("virtio") || name.starts_with("io-") {
        return ThreadRole::IoThread {
            name: name.to_string(),
        };
    }
    ThreadRole::Emulator {
        name: name.to_string(),
    }
}

/// Live control channel to one hypervisor process.
pub struct Monitor {
    socket_path: PathBuf,
    pid: i32,
    /// Present only when this daemon spawned the process; killed on close.
    child: Option<Child>,
    threads: Vec<ThreadRecord>,
    request_timeout: Duration,
}

impl Monitor {
    /// Spawn a fresh hypervisor process, wait for its API socket, and create
    /// (but not boot) the VM from the opaque config payload.
    pub async fn create(
        binary: &Path,
        socket_path: &Path,
        vm_config: &serde_json::Value,
        socket_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Monitor> {
        // A stale socket from a previous run would make the bind fail.
        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => debug!(path = %socket_path.display(), "removed stale API socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("removing stale API socket {}", socket_path.display())
                })
            }
        }

        let log_path = socket_path.with_file_name("hypervisor.log");
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening hypervisor log {}", log_path.display()))?;
        let stderr_log = log.try_clone().context("duplicating hypervisor log fd")?;

        let mut child = Command::new(binary)
            .arg("--api-socket")
            .arg(socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning hypervisor {}", binary.display()))?;

        let pid = match child.id() {
            Some(pid) => pid as i32,
            None => bail!("hypervisor process exited immediately after spawn"),
        };

        let mut monitor = Monitor {
            socket_path: socket_path.to_path_buf(),
            pid,
            child: None,
            threads: Vec::new(),
            request_timeout,
        };

        if let Err(e) = monitor.wait_attach(socket_timeout).await {
            warn!(pid, "hypervisor API socket never came up, killing process");
            let _ = child.kill().await;
            return Err(e);
        }
        monitor.child = Some(child);

        let (status, _) = monitor
            .request("PUT", VM_CREATE, Some(vm_config))
            .await
            .context("creating guest VM")?;
        if let Err(e) = expect_success(status, VM_CREATE) {
            monitor.close().await;
            return Err(e);
        }

        info!(pid, socket = %socket_path.display(), "hypervisor spawned and VM created");
        Ok(monitor)
    }

    /// Reattach to the API socket of an already-running process. Used by the
    /// reconnection path; never spawns anything.
    pub async fn open(
        socket_path: &Path,
        pid: i32,
        request_timeout: Duration,
    ) -> Result<Monitor> {
        let monitor = Monitor {
            socket_path: socket_path.to_path_buf(),
            pid,
            child: None,
            threads: Vec::new(),
            request_timeout,
        };
        let (status, _) = monitor
            .request("PUT", VMM_PING, None)
            .await
            .with_context(|| format!("reattaching to {}", socket_path.display()))?;
        expect_success(status, VMM_PING)?;
        debug!(pid, socket = %socket_path.display(), "reattached to hypervisor");
        Ok(monitor)
    }

    async fn wait_attach(&self, socket_timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + socket_timeout;
        loop {
            if tokio::fs::metadata(&self.socket_path).await.is_ok() {
                if let Ok((status, _)) = self.request("PUT", VMM_PING, None).await {
                    if (200..300).contains(&status) {
                        return Ok(());
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "hypervisor API socket {} not ready after {:?}",
                    self.socket_path.display(),
                    socket_timeout
                );
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    /// One request/response exchange on a fresh connection.
    async fn request(
        &self,
        method: &str,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(u16, Vec<u8>)> {
        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path)
                .await
                .with_context(|| format!("connecting to {}", self.socket_path.display()))?;

            let payload = match body {
                Some(value) => Some(serde_json::to_vec(value)?),
                None => None,
            };
            let mut request = format!("{} {}/{} HTTP/1.1\r\nHost: localhost\r\n", method, API_ROOT, endpoint);
            match &payload {
                Some(bytes) => {
                    request.push_str("Content-Type: application/json\r\n");
                    request.push_str(&format!("Content-Length: {}\r\n\r\n", bytes.len()));
                }
                None => request.push_str("Content-Length: 0\r\n\r\n"),
            }
            stream.write_all(request.as_bytes()).await?;
            if let Some(bytes) = &payload {
                stream.write_all(bytes).await?;
            }
            stream.flush().await?;

            let mut reader = BufReader::new(stream);
            read_http_response(&mut reader).await
        };
        let (status, body) = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| anyhow::anyhow!("monitor request {} timed out", endpoint))??;
        trace!(endpoint, status, "monitor request completed");
        Ok((status, body))
    }

    /// Boot the created VM.
    pub async fn boot(&self) -> Result<()> {
        let (status, _) = self.request("PUT", VM_BOOT, None).await?;
        expect_success(status, VM_BOOT)
    }

    /// Ask the guest to power down (virtual power button).
    pub async fn shutdown_vm(&self) -> Result<()> {
        let (status, _) = self.request("PUT", VM_SHUTDOWN, None).await?;
        expect_success(status, VM_SHUTDOWN)
    }

    /// Current state and console configuration as reported by the hypervisor.
    pub async fn get_info(&self) -> Result<VmInfo> {
        let (status, body) = self.request("GET", VM_INFO, None).await?;
        expect_success(status, VM_INFO)?;
        let raw: RawInfo =
            serde_json::from_slice(&body).context("decoding vm.info response")?;
        let (console_path, serial_path) = match raw.config {
            Some(config) => (
                config.console.and_then(|c| c.file),
                config.serial.and_then(|s| s.file),
            ),
            None => (None, None),
        };
        Ok(VmInfo {
            state: raw.state,
            console_path,
            serial_path,
        })
    }

    /// Rebuild the thread inventory from `/proc/<pid>/task`.
    ///
    /// Returns the number of discovered threads; a scan failure (process
    /// gone, /proc unreadable) is an error, distinct from an empty inventory.
    pub fn refresh_thread_info(&mut self) -> Result<usize> {
        let task_dir = format!("/proc/{}/task", self.pid);
        let entries = std::fs::read_dir(&task_dir)
            .with_context(|| format!("scanning hypervisor threads in {}", task_dir))?;

        let mut threads = Vec::new();
        for entry in entries.flatten() {
            let tid: i32 = match entry.file_name().to_string_lossy().parse() {
                Ok(tid) => tid,
                Err(_) => continue,
            };
            // Threads can exit between readdir and the comm read.
            let comm = match std::fs::read_to_string(entry.path().join("comm")) {
                Ok(comm) => comm,
                Err(e) => {
                    debug!(tid, error = %e, "thread vanished during inventory scan");
                    continue;
                }
            };
            threads.push(ThreadRecord {
                tid,
                role: classify_comm(&comm),
            });
        }
        threads.sort_by_key(|record| record.tid);
        debug!(pid = self.pid, count = threads.len(), "refreshed thread inventory");
        self.threads = threads;
        Ok(self.threads.len())
    }

    /// The cached inventory from the last refresh.
    pub fn threads(&self) -> &[ThreadRecord] {
        &self.threads
    }

    /// I/O threads from the cached inventory, with their names.
    pub fn get_iothreads(&self) -> Vec<(i32, String)> {
        self.threads
            .iter()
            .filter_map(|record| match &record.role {
                ThreadRole::IoThread { name } => Some((record.tid, name.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Release the channel. Asks the VMM to shut down, and kills the child
    /// process if this daemon spawned it. Reattached monitors never kill:
    /// forced termination of inherited processes is an explicit separate step.
    pub async fn close(mut self) {
        match self.request("PUT", VMM_SHUTDOWN, None).await {
            Ok((status, _)) => debug!(pid = self.pid, status, "vmm shutdown requested"),
            Err(e) => debug!(pid = self.pid, error = %e, "vmm shutdown request failed (may already be gone)"),
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(pid = self.pid, error = %e, "failed to kill hypervisor child");
            }
        }
    }
}

/// SIGKILL an inherited hypervisor process the daemon cannot control any
/// more. Used only by recovery paths that must not leave an uncontrolled
/// process running.
pub fn kill_process(pid: i32) {
    if pid <= 1 {
        return;
    }
    warn!(pid, "force-killing hypervisor process");
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

fn expect_success(status: u16, endpoint: &str) -> Result<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        bail!("monitor request {} failed with HTTP {}", endpoint, status)
    }
}

/// Read one HTTP/1.1 response: status line, headers, content-length body.
pub(crate) async fn read_http_response<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<(u16, Vec<u8>)> {
    let mut status_line = String::new();
    let n = reader.read_line(&mut status_line).await?;
    if n == 0 {
        bail!("connection closed before a response arrived");
    }
    let status = parse_status_line(&status_line)?;

    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            bail!("connection closed inside response headers");
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = Some(
                    value
                        .trim()
                        .parse()
                        .with_context(|| format!("bad content-length '{}'", value.trim()))?,
                );
            }
        }
    }

    let body = match content_length {
        Some(len) => {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            body
        }
        None => Vec::new(),
    };
    Ok((status, body))
}

pub(crate) fn parse_status_line(line: &str) -> Result<u16> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .with_context(|| format!("bad HTTP status code '{}'", code)),
        _ => bail!("malformed HTTP status line '{}'", line.trim_end()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-process fake hypervisor API server for supervisor tests.

    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    /// Accepts connections on a Unix socket and answers each HTTP request
    /// from a canned endpoint map, recording request paths in order.
    pub struct FakeHypervisor {
        pub requests: Arc<Mutex<Vec<String>>>,
    }

    impl FakeHypervisor {
        /// `responses` maps an endpoint path suffix (e.g. "vm.boot") to
        /// (status, body). Unlisted endpoints get 200 with an empty body.
        pub fn spawn(
            socket_path: &Path,
            responses: HashMap<String, (u16, String)>,
        ) -> FakeHypervisor {
            let requests: Arc<Mutex<Vec<String>>> = Arc::default();
            let listener = UnixListener::bind(socket_path).unwrap();
            let recorded = Arc::clone(&requests);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let responses = responses.clone();
                    let recorded = Arc::clone(&recorded);
                    tokio::spawn(async move {
                        let mut reader = BufReader::new(stream);
                        // Serve any number of requests per connection; the
                        // netdev handoff reuses one connection.
                        loop {
                            let mut request_line = String::new();
                            match reader.read_line(&mut request_line).await {
                                Ok(0) | Err(_) => return,
                                Ok(_) => {}
                            }
                            let path = request_line
                                .split_whitespace()
                                .nth(1)
                                .unwrap_or_default()
                                .to_string();
                            let mut content_length = 0usize;
                            loop {
                                let mut line = String::new();
                                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                                    return;
                                }
                                let line = line.trim_end();
                                if line.is_empty() {
                                    break;
                                }
                                if let Some((name, value)) = line.split_once(':') {
                                    if name.trim().eq_ignore_ascii_case("content-length") {
                                        content_length = value.trim().parse().unwrap_or(0);
                                    }
                                }
                            }
                            if content_length > 0 {
                                let mut body = vec![0u8; content_length];
                                if reader.read_exact(&mut body).await.is_err() {
                                    return;
                                }
                            }

                            let endpoint = path.rsplit('/').next().unwrap_or_default();
                            let (status, body) = responses
                                .get(endpoint)
                                .cloned()
                                .unwrap_or((200, String::new()));
                            recorded.lock().unwrap().push(endpoint.to_string());

                            let reply = format!(
                                "HTTP/1.1 {} X\r\nContent-Length: {}\r\n\r\n{}",
                                status,
                                body.len(),
                                body
                            );
                            if reader
                                .get_mut()
                                .write_all(reply.as_bytes())
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    });
                }
            });
            FakeHypervisor { requests }
        }

        pub fn recorded(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }
}
