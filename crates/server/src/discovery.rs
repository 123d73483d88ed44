use std::net::{IpAddr, UdpSocket};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::bootstrap::find_in_path;

pub const HOSTNAME: &str = "skaldi";

/// Keeps the mDNS helper processes alive; dropping the guard kills them.
pub struct DiscoveryGuard {
    _children: Vec<Child>,
}

/// Publish `skaldi.local` on the LAN by driving the platform's mDNS helper
/// as a child process. Returns whether registration is active; a missing
/// helper is only a warning.
pub fn register(port: u16) -> (Option<DiscoveryGuard>, bool) {
    let Some(ip) = primary_lan_ip() else {
        warn!("no LAN address found, skipping mDNS registration");
        return (None, false);
    };
    let ip = ip.to_string();

    if cfg!(target_os = "linux") {
        register_avahi(&ip, port)
    } else if cfg!(target_os = "macos") {
        register_bonjour(&ip, port)
    } else {
        warn!("mDNS registration not supported on this platform");
        (None, false)
    }
}

pub fn log_ready_message(port: u16, mdns_active: bool) {
    if mdns_active {
        info!("Skaldi ready at http://{HOSTNAME}.local:{port}");
        if let Some(ip) = primary_lan_ip() {
            debug!("also available at http://{ip}:{port}");
        }
    } else if let Some(ip) = primary_lan_ip() {
        info!("Skaldi ready at http://{ip}:{port}");
    } else {
        info!("Skaldi ready on port {port}");
    }
}

fn register_avahi(ip: &str, port: u16) -> (Option<DiscoveryGuard>, bool) {
    let fqdn = format!("{HOSTNAME}.local");

    let Some(publish) =
        find_in_path("avahi-publish-service").or_else(|| find_in_path("avahi-publish"))
    else {
        warn!("avahi-publish-service not found, mDNS unavailable (install avahi-utils)");
        return (None, false);
    };

    let Some(address) = spawn_helper(Command::new(&publish).args(["-a", "-R", &fqdn, ip])) else {
        return (None, false);
    };

    let service = spawn_helper(Command::new(&publish).args([
        "-s",
        "-H",
        &fqdn,
        "Skaldi Jukebox",
        "_http._tcp",
        &port.to_string(),
        "path=/",
    ]));
    let Some(service) = service else {
        // address record alone is useless; dropping the child kills it
        return (None, false);
    };

    debug!("mDNS address and service registration started");
    (
        Some(DiscoveryGuard {
            _children: vec![address, service],
        }),
        true,
    )
}

fn register_bonjour(ip: &str, port: u16) -> (Option<DiscoveryGuard>, bool) {
    let Some(dns_sd) = find_in_path("dns-sd") else {
        warn!("dns-sd not found, mDNS unavailable");
        return (None, false);
    };

    let child = spawn_helper(Command::new(&dns_sd).args([
        "-P",
        "Skaldi Jukebox",
        "_http._tcp",
        "local",
        &port.to_string(),
        &format!("{HOSTNAME}.local"),
        ip,
    ]));
    match child {
        Some(child) => {
            debug!("mDNS service registration started");
            (
                Some(DiscoveryGuard {
                    _children: vec![child],
                }),
                true,
            )
        }
        None => (None, false),
    }
}

fn spawn_helper(command: &mut Command) -> Option<Child> {
    match command
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => Some(child),
        Err(e) => {
            warn!(error = %e, "failed to start mDNS helper");
            None
        }
    }
}

/// The address the kernel would route LAN traffic from. The socket is never
/// actually written to.
fn primary_lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        return None;
    }
    Some(ip)
}
