//! TCP port occupancy probes. Advisory only: a port can be held by an
//! unrelated process, and a script may run before it binds its port.

use devdeck_process::PortOccupancy;

use crate::process_table::{ProcessProber, run_probe};

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
/// Owner pid (and short name when the tool reports one) from
/// `ss -ltnpH sport = :<port>` output, e.g.
/// `LISTEN 0 511 *:3000 *:* users:(("node",pid=4242,fd=21))`.
pub(crate) fn parse_ss_owner(stdout: &str) -> Option<(u32, Option<String>)> {
    for line in stdout.lines() {
        let Some(users) = line.split("users:((").nth(1) else {
            continue;
        };
        let Some(pid_part) = users.split("pid=").nth(1) else {
            continue;
        };
        let digits: String = pid_part.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(pid) = digits.parse::<u32>() {
            let name = users
                .split('"')
                .nth(1)
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty());
            return Some((pid, name));
        }
    }
    None
}

fn port_of_addr(addr: &str) -> Option<u16> {
    addr.rsplit_once(':')?.1.parse::<u16>().ok()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
/// Listening ports from `ss -ltnH`: the fourth column is `local:port`.
pub(crate) fn parse_ss_ports(stdout: &str) -> Vec<u16> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(port_of_addr)
        .collect()
}

#[cfg_attr(any(target_os = "linux", windows), allow(dead_code))]
/// Listening ports from `lsof -nP -iTCP -sTCP:LISTEN`: the address token
/// precedes the trailing `(LISTEN)`.
pub(crate) fn parse_lsof_ports(stdout: &str) -> Vec<u16> {
    stdout
        .lines()
        .filter(|line| line.trim_end().ends_with("(LISTEN)"))
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            cols.len().checked_sub(2).and_then(|i| cols.get(i).copied())
        })
        .filter_map(port_of_addr)
        .collect()
}

#[cfg_attr(not(windows), allow(dead_code))]
/// `(local port, pid)` for every LISTENING row of `netstat -ano -p TCP`.
pub(crate) fn parse_netstat_listeners(stdout: &str) -> Vec<(u16, u32)> {
    stdout
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 || !cols[3].eq_ignore_ascii_case("LISTENING") {
                return None;
            }
            let port = port_of_addr(cols[1])?;
            let pid = cols[4].parse::<u32>().ok()?;
            Some((port, pid))
        })
        .collect()
}

fn sorted_unique(mut ports: Vec<u16>) -> Vec<u16> {
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn ipv6_unavailable(err: &std::io::Error) -> bool {
    if err.kind() == std::io::ErrorKind::AddrNotAvailable {
        return true;
    }
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EAFNOSUPPORT)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct PortChecker {
    prober: ProcessProber,
}

impl PortChecker {
    pub fn new(prober: ProcessProber) -> Self {
        Self { prober }
    }

    /// Tries exclusive binds on both the IPv4 and IPv6 wildcards and
    /// releases each at once. Any failure, including permission errors and
    /// timeouts, counts as occupied. A host without IPv6 only checks IPv4.
    pub async fn is_port_free(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        match self.try_bind("0.0.0.0", port).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                tracing::debug!(port, error = %err, "ipv4 bind failed; treating as occupied");
                return false;
            }
        }
        match self.try_bind("::", port).await {
            Ok(free) => free,
            Err(err) if ipv6_unavailable(&err) => {
                tracing::debug!(port, error = %err, "no ipv6 on this host; ipv4 result stands");
                true
            }
            Err(err) => {
                tracing::debug!(port, error = %err, "ipv6 bind failed; treating as occupied");
                false
            }
        }
    }

    /// `Ok(false)` on timeout.
    async fn try_bind(&self, host: &str, port: u16) -> std::io::Result<bool> {
        let bind = tokio::net::TcpListener::bind((host, port));
        match tokio::time::timeout(self.prober.timeout(), bind).await {
            Ok(Ok(listener)) => {
                drop(listener);
                Ok(true)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(false),
        }
    }

    /// Occupancy plus the owning process when the socket table reveals it.
    pub async fn find_owner(&self, port: u16) -> PortOccupancy {
        if self.is_port_free(port).await {
            return PortOccupancy::free(port);
        }

        let (owning_pid, short_name) = match self.lookup_owner(port).await {
            Some((pid, name)) => (Some(pid), name),
            None => (None, None),
        };
        let owning_command = match owning_pid {
            Some(pid) => self.prober.command_of(pid).await.or(short_name),
            None => None,
        };

        PortOccupancy {
            port,
            occupied: true,
            owning_pid,
            owning_command,
        }
    }

    /// Every TCP port in LISTEN state system-wide, sorted. Empty on failure.
    pub async fn used_ports(&self) -> Vec<u16> {
        let timeout = self.prober.timeout();

        #[cfg(target_os = "linux")]
        let res = run_probe("ss", &["-ltnH"], timeout)
            .await
            .map(|out| parse_ss_ports(&out));

        #[cfg(all(unix, not(target_os = "linux")))]
        let res = run_probe("lsof", &["-nP", "-iTCP", "-sTCP:LISTEN"], timeout)
            .await
            .map(|out| parse_lsof_ports(&out));

        #[cfg(windows)]
        let res = run_probe("netstat", &["-ano", "-p", "TCP"], timeout)
            .await
            .map(|out| {
                parse_netstat_listeners(&out)
                    .into_iter()
                    .map(|(port, _)| port)
                    .collect()
            });

        match res {
            Ok(ports) => sorted_unique(ports),
            Err(err) => {
                tracing::warn!(error = %err, "listening port probe failed");
                Vec::new()
            }
        }
    }

    async fn lookup_owner(&self, port: u16) -> Option<(u32, Option<String>)> {
        let timeout = self.prober.timeout();

        #[cfg(target_os = "linux")]
        let res = {
            let filter = format!(":{port}");
            run_probe("ss", &["-ltnpH", "sport", "=", &filter], timeout)
                .await
                .map(|out| parse_ss_owner(&out))
        };

        #[cfg(all(unix, not(target_os = "linux")))]
        let res = {
            let selector = format!("-iTCP:{port}");
            run_probe("lsof", &["-nP", "-t", &selector, "-sTCP:LISTEN"], timeout)
                .await
                .map(|out| {
                    out.lines()
                        .find_map(|l| l.trim().parse::<u32>().ok())
                        .map(|pid| (pid, None))
                })
        };

        #[cfg(windows)]
        let res = run_probe("netstat", &["-ano", "-p", "TCP"], timeout)
            .await
            .map(|out| {
                parse_netstat_listeners(&out)
                    .into_iter()
                    .find(|(p, _)| *p == port)
                    .map(|(_, pid)| (pid, None))
            });

        match res {
            Ok(owner) => owner,
            Err(err) => {
                tracing::debug!(port, error = %err, "port owner lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ss_owner_line_yields_pid_and_name() {
        let out = "LISTEN 0      511          *:3000       *:*    users:((\"node\",pid=4242,fd=21))\n";
        assert_eq!(parse_ss_owner(out), Some((4242, Some("node".to_string()))));
        assert_eq!(parse_ss_owner("LISTEN 0 511 *:3000 *:*\n"), None);
    }

    #[test]
    fn ss_port_listing() {
        let out = "LISTEN 0 4096 127.0.0.53%lo:53 0.0.0.0:*\nLISTEN 0 511 [::]:3000 [::]:*\nLISTEN 0 511 0.0.0.0:3000 0.0.0.0:*\n";
        assert_eq!(sorted_unique(parse_ss_ports(out)), vec![53, 3000]);
    }

    #[test]
    fn lsof_port_listing_skips_header() {
        let out = "COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME\nnode 123 me 20u IPv6 0xabc 0t0 TCP *:5173 (LISTEN)\nredis 77 me 6u IPv4 0xdef 0t0 TCP 127.0.0.1:6379 (LISTEN)\n";
        assert_eq!(sorted_unique(parse_lsof_ports(out)), vec![5173, 6379]);
    }

    #[test]
    fn netstat_listeners() {
        let out = "\nActive Connections\n\n  Proto  Local Address          Foreign Address        State           PID\n  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1040\n  TCP    127.0.0.1:5554         127.0.0.1:50000        ESTABLISHED     88\n  TCP    [::]:3000              [::]:0                 LISTENING       9001\n";
        assert_eq!(parse_netstat_listeners(out), vec![(135, 1040), (3000, 9001)]);
    }

    #[tokio::test]
    async fn held_port_is_occupied_and_released_port_is_free() {
        let checker = PortChecker::default();
        let held = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = held.local_addr().unwrap().port();

        assert!(!checker.is_port_free(port).await);
        let owner = checker.find_owner(port).await;
        assert!(owner.occupied);
        assert_eq!(owner.port, port);

        drop(held);
        assert!(checker.is_port_free(port).await);
        assert_eq!(checker.find_owner(port).await, PortOccupancy::free(port));
    }

    #[tokio::test]
    async fn ipv6_loopback_listener_counts_as_occupied() {
        let Ok(held) = std::net::TcpListener::bind(("::1", 0)) else {
            return;
        };
        let checker = PortChecker::default();
        let port = held.local_addr().unwrap().port();

        assert!(!checker.is_port_free(port).await);
        assert!(checker.find_owner(port).await.occupied);

        drop(held);
        assert!(checker.is_port_free(port).await);
    }

    #[tokio::test]
    async fn port_zero_is_never_reported_free() {
        assert!(!PortChecker::default().is_port_free(0).await);
    }
}
