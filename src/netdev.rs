//! Tap device creation and pre-boot network fd handoff.
//!
//! The hypervisor never opens host taps itself; the daemon opens one fd per
//! queue and transfers them over the control socket with SCM_RIGHTS,
//! attached to the `vm.add-net` request. Each device gets a fresh
//! connection, and its fds must ride that same connection, on the message
//! carrying the request: that is how the hypervisor associates them.

use std::io::{BufRead, BufReader, IoSlice, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::NetworkDevice;
use crate::monitor::{parse_status_line, API_ROOT};

const TUN_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_VNET_HDR: libc::c_short = 0x4000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

#[repr(C)]
struct Ifreq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Open the tap interface `name` and return one fd per queue. All fds refer
/// to the same interface; multi-queue is requested whenever more than one
/// queue is configured.
pub fn open_tap(name: &str, num_queues: u32) -> Result<Vec<OwnedFd>> {
    ensure!(num_queues >= 1, "tap '{}' needs at least one queue", name);
    ensure!(
        name.len() < libc::IFNAMSIZ,
        "tap name '{}' exceeds the interface name limit",
        name
    );
    ensure!(
        !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic()),
        "tap name '{}' contains invalid characters",
        name
    );

    let mut ifr = Ifreq {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TAP | IFF_NO_PI | IFF_VNET_HDR,
        _pad: [0; 22],
    };
    for (dst, src) in ifr.name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }
    if num_queues > 1 {
        ifr.flags |= IFF_MULTI_QUEUE;
    }

    let mut fds = Vec::with_capacity(num_queues as usize);
    for queue in 0..num_queues {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)
            .with_context(|| format!("opening {}", TUN_DEVICE))?;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("creating tap '{}' queue {}", name, queue));
        }
        fds.push(OwnedFd::from(file));
    }
    debug!(tap = name, queues = num_queues, "opened tap device");
    Ok(fds)
}

/// Bring a host interface up. Shells out to iproute2 like the rest of the
/// host network plumbing.
pub async fn set_link_up(name: &str) -> Result<()> {
    let output = Command::new("ip")
        .args(["link", "set", "dev", name, "up"])
        .output()
        .await
        .context("running ip link")?;
    if !output.status.success() {
        bail!(
            "ip link set {} up failed: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// The HTTP request carrying one network device, without its fds.
pub(crate) fn build_add_net_request(device: &NetworkDevice) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&serde_json::json!({
        "id": device.id,
        "mac": device.mac,
        "num_queues": device.num_queues,
    }))
    .context("encoding add-net payload")?;
    let mut request = format!(
        "PUT {}/vm.add-net HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        API_ROOT,
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    Ok(request)
}

/// Hand one network device and its tap fds to the hypervisor.
///
/// Runs the blocking sendmsg exchange off the async runtime. The fds are
/// consumed either way; the hypervisor holds its own duplicates on success.
pub async fn add_net(
    socket_path: &Path,
    device: &NetworkDevice,
    fds: Vec<OwnedFd>,
    timeout: Duration,
) -> Result<()> {
    ensure!(
        fds.len() == device.num_queues as usize,
        "network device '{}' needs {} fds, got {}",
        device.id,
        device.num_queues,
        fds.len()
    );
    let request = build_add_net_request(device)?;
    let socket_path: PathBuf = socket_path.to_path_buf();
    let id = device.id.clone();
    let status = tokio::task::spawn_blocking(move || {
        transfer_fds(&socket_path, &request, &fds, timeout)
    })
    .await
    .context("network handoff task panicked")??;

    match status {
        200 | 204 => {
            info!(device = %id, "network device handed off");
            Ok(())
        }
        other => bail!(
            "hypervisor rejected network device '{}' with HTTP {}",
            id,
            other
        ),
    }
}

/// Single-connection exchange: sendmsg carries the fds with the leading
/// bytes of the request, the rest follows as plain writes, then the status
/// line is read back on the same stream.
fn transfer_fds(
    socket_path: &Path,
    request: &[u8],
    fds: &[OwnedFd],
    timeout: Duration,
) -> Result<u16> {
    let mut stream = UnixStream::connect(socket_path)
        .with_context(|| format!("connecting to {}", socket_path.display()))?;
    stream
        .set_read_timeout(Some(timeout))
        .context("setting read timeout")?;
    stream
        .set_write_timeout(Some(timeout))
        .context("setting write timeout")?;

    let raw_fds: Vec<i32> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let iov = [IoSlice::new(request)];
    let cmsg = [ControlMessage::ScmRights(&raw_fds)];
    let sent = sendmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &iov,
        &cmsg,
        MsgFlags::empty(),
        None,
    )
    .context("sending network fds")?;
    if sent < request.len() {
        stream
            .write_all(&request[sent..])
            .context("writing request remainder")?;
    }
    stream.flush().context("flushing handoff request")?;

    read_status_sync(&mut stream)
}

fn read_status_sync(stream: &mut UnixStream) -> Result<u16> {
    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    let n = reader
        .read_line(&mut status_line)
        .context("reading handoff response")?;
    if n == 0 {
        bail!("connection closed before the handoff response arrived");
    }
    let status = parse_status_line(&status_line)?;

    // Drain headers and body so the peer never sees a reset mid-reply.
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).context("reading headers")? == 0 {
            return Ok(status);
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
        if let Err(e) = reader.read_exact(&mut body) {
            warn!(error = %e, "handoff response body truncated");
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs::File;
    use tempfile::TempDir;

    use crate::monitor::test_support::FakeHypervisor;

    fn sample_device(queues: u32) -> NetworkDevice {
        NetworkDevice {
            id: "net0".into(),
            tap: "tap0".into(),
            mac: "52:54:00:12:34:56".into(),
            num_queues: queues,
        }
    }

    fn null_fds(count: usize) -> Vec<OwnedFd> {
        (0..count)
            .map(|_| OwnedFd::from(File::open("/dev/null").unwrap()))
            .collect()
    }

    #[test]
    fn test_build_add_net_request() {
        let request = build_add_net_request(&sample_device(2)).unwrap();
        let text = String::from_utf8(request).unwrap();
        assert!(text.starts_with("PUT /api/v1/vm.add-net HTTP/1.1\r\n"));
        let (headers, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(headers.contains(&format!("Content-Length: {}", body.len())));
        let payload: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(payload["id"], "net0");
        assert_eq!(payload["mac"], "52:54:00:12:34:56");
        assert_eq!(payload["num_queues"], 2);
    }

    #[test]
    fn test_open_tap_rejects_bad_names() {
        assert!(open_tap("", 1).is_err());
        assert!(open_tap("name with spaces", 1).is_err());
        assert!(open_tap(&"x".repeat(libc::IFNAMSIZ), 1).is_err());
        assert!(open_tap("tap0", 0).is_err());
    }

    #[tokio::test]
    async fn test_add_net_accepts_204() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("api.sock");
        let mut responses = HashMap::new();
        responses.insert("vm.add-net".to_string(), (204, String::new()));
        let server = FakeHypervisor::spawn(&socket, responses);

        add_net(
            &socket,
            &sample_device(2),
            null_fds(2),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(server.recorded(), vec!["vm.add-net"]);
    }

    #[tokio::test]
    async fn test_add_net_rejects_error_status() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("api.sock");
        let mut responses = HashMap::new();
        responses.insert(
            "vm.add-net".to_string(),
            (500, r#"{"error":"no such device"}"#.to_string()),
        );
        let _server = FakeHypervisor::spawn(&socket, responses);

        let err = add_net(
            &socket,
            &sample_device(1),
            null_fds(1),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(format!("{}", err).contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_add_net_checks_fd_count() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("api.sock");
        let err = add_net(
            &socket,
            &sample_device(2),
            null_fds(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(format!("{}", err).contains("needs 2 fds"));
    }
}
