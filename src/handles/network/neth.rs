use anyhow::Result as AnyResult;
use serde_json::json;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::sshh::HostResolver;
use crate::core::config::Destination;
use crate::core::context::App;
use crate::core::error::Result;
use crate::core::{
    registry::{Args, Handle, IoStreams},
    status::Status,
};

pub fn register(reg: &mut crate::core::Registry, app: Arc<App>) {
    reg.register_scheme("dest", move |u| Ok(Box::new(DestHandle::from_url(u, app.clone())?)));
}

/// One ICMP echo attempt.
pub trait Pinger: Send + Sync {
    fn ping_once(&self, host: &str, timeout: Duration) -> bool;
}

/// Names of the network interfaces currently present.
pub trait InterfaceLister: Send + Sync {
    fn interface_names(&self) -> std::io::Result<Vec<String>>;
}

/// Uses the system `ping` binary, one packet per attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPinger;

impl Pinger for SystemPinger {
    fn ping_once(&self, host: &str, timeout: Duration) -> bool {
        if which::which("ping").is_err() {
            log::warn!("No ping binary available, treating host='{}' as unreachable", host);
            return false;
        }
        let per_packet_timeout_s = std::cmp::max(1, timeout.as_secs());
        Command::new("ping")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(per_packet_timeout_s.to_string())
            .arg(host)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceLister for SystemInterfaces {
    fn interface_names(&self) -> std::io::Result<Vec<String>> {
        Ok(if_addrs::get_if_addrs()?.into_iter().map(|i| i.name).collect())
    }
}

/// Decides whether a destination can be introspected right now.
#[derive(Clone)]
pub struct ConnectivityProbe {
    retries: u32,
    timeout: Duration,
    hosts: HostResolver,
    pinger: Arc<dyn Pinger>,
    interfaces: Arc<dyn InterfaceLister>,
}

impl ConnectivityProbe {
    pub fn new(hosts: HostResolver) -> Self {
        Self {
            retries: 1,
            timeout: Duration::from_secs(1),
            hosts,
            pinger: Arc::new(SystemPinger),
            interfaces: Arc::new(SystemInterfaces),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pinger(mut self, pinger: Arc<dyn Pinger>) -> Self {
        self.pinger = pinger;
        self
    }

    pub fn with_interfaces(mut self, interfaces: Arc<dyn InterfaceLister>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn hosts(&self) -> &HostResolver {
        &self.hosts
    }

    pub fn is_reachable(&self, destination: &Destination) -> Result<bool> {
        self.is_reachable_with(destination, &mut |_| {})
    }

    /// Like `is_reachable`; `on_retry` gets the attempts left before each retry.
    pub fn is_reachable_with(
        &self,
        destination: &Destination,
        on_retry: &mut dyn FnMut(u32),
    ) -> Result<bool> {
        if !destination.is_remote() {
            return Ok(local_path_populated(Path::new(&destination.path)));
        }

        if let Some(vpn) = destination.vpn.as_deref() {
            if !self.vpn_active(vpn) {
                log::info!("VPN '{}' is down, skipping probe of '{}'", vpn, destination.path);
                return Ok(false);
            }
        }

        let host = self.hosts.resolve(destination)?;
        Ok(self.ping(&host, on_retry))
    }

    fn ping(&self, host: &str, on_retry: &mut dyn FnMut(u32)) -> bool {
        for attempt in 1..=self.retries {
            if self.pinger.ping_once(host, self.timeout) {
                log::debug!("Ping successful host='{}' attempt={}", host, attempt);
                return true;
            }
            let remaining = self.retries - attempt;
            log::debug!("Ping failed host='{}' attempt={} remaining={}", host, attempt, remaining);
            if remaining > 0 {
                on_retry(remaining);
            }
        }
        log::info!("Host '{}' unreachable after {} attempts", host, self.retries);
        false
    }

    fn vpn_active(&self, vpn: &str) -> bool {
        let interface = vpn_interface_name(vpn);
        match self.interfaces.interface_names() {
            Ok(names) => names.iter().any(|n| n == &interface),
            Err(e) => {
                log::warn!("Failed to get network interfaces: {}", e);
                false
            }
        }
    }
}

/// Interface brought up for a VPN config; wg-quick names it after the file stem.
pub fn vpn_interface_name(vpn: &str) -> String {
    Path::new(vpn)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| vpn.to_string())
}

fn local_path_populated(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}

/// `dest://<key>.probe` and `dest://<key>.host`
pub struct DestHandle {
    key: String,
    app: Arc<App>,
}

impl DestHandle {
    pub fn from_url(u: &Url, app: Arc<App>) -> AnyResult<Self> {
        let key = u
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow::anyhow!("dest:// URL missing destination key"))?;
        Ok(Self {
            key: key.to_string(),
            app,
        })
    }

    fn verb_probe(&self, args: &Args, io: &mut IoStreams) -> AnyResult<Status> {
        let dest = self.app.config.destination(&self.key)?;
        let retries = match args.get("retries") {
            Some(r) => r
                .parse::<u32>()
                .map_err(|e| anyhow::anyhow!("invalid retries '{}': {}", r, e))?,
            None => self.app.config.ping_retries,
        };

        let probe = self.app.probe().clone().with_retries(retries);
        let mut attempts_left = Vec::new();
        let reachable = probe.is_reachable_with(dest, &mut |left| {
            attempts_left.push(left);
        })?;
        for left in &attempts_left {
            writeln!(io.stderr, "retrying, {} attempt(s) left", left)?;
        }

        let out = json!({
            "destination": self.key,
            "path": dest.path,
            "remote": dest.is_remote(),
            "reachable": reachable,
        });
        writeln!(io.stdout, "{}", out)?;
        Ok(if reachable { Status::ok() } else { Status::err(1, "destination unreachable") })
    }

    fn verb_host(&self, io: &mut IoStreams) -> AnyResult<Status> {
        let dest = self.app.config.destination(&self.key)?;
        let host = self.app.hosts().resolve(dest)?;
        writeln!(io.stdout, "{}", json!({ "destination": self.key, "host": host }))?;
        Ok(Status::ok())
    }
}

impl Handle for DestHandle {
    fn verbs(&self) -> &'static [&'static str] {
        &["probe", "host"]
    }

    fn call(&self, verb: &str, args: &Args, io: &mut IoStreams) -> AnyResult<Status> {
        match verb {
            "probe" => self.verb_probe(args, io),
            "host" => self.verb_host(io),
            _ => Ok(Status::err(2, format!("unknown verb '{}' for dest://", verb))),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Succeeds on the n-th attempt (1-based); never when `None`.
    pub struct ScriptedPinger {
        pub succeed_on: Option<u32>,
        pub attempts: Mutex<u32>,
    }

    impl ScriptedPinger {
        pub fn new(succeed_on: Option<u32>) -> Self {
            Self { succeed_on, attempts: Mutex::new(0) }
        }
    }

    impl Pinger for ScriptedPinger {
        fn ping_once(&self, _host: &str, _timeout: Duration) -> bool {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            Some(*attempts) == self.succeed_on
        }
    }

    pub struct FixedInterfaces(pub Vec<&'static str>);

    impl InterfaceLister for FixedInterfaces {
        fn interface_names(&self) -> std::io::Result<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn remote(vpn: Option<&str>) -> Destination {
        Destination {
            path: "vault:/srv/borg".into(),
            host: Some("vault.example.net".into()),
            vpn: vpn.map(str::to_string),
            ..Destination::default()
        }
    }

    fn probe(pinger: ScriptedPinger, interfaces: Vec<&'static str>) -> ConnectivityProbe {
        ConnectivityProbe::new(HostResolver::new("/nonexistent"))
            .with_pinger(Arc::new(pinger))
            .with_interfaces(Arc::new(FixedInterfaces(interfaces)))
    }

    #[test]
    fn test_local_destination() {
        let dir = TempDir::new().unwrap();
        let dest = Destination {
            path: dir.path().to_string_lossy().to_string(),
            ..Destination::default()
        };
        let p = probe(ScriptedPinger::new(None), vec![]);
        assert!(!p.is_reachable(&dest).unwrap(), "empty dir is unreachable");

        std::fs::write(dir.path().join("README"), "x").unwrap();
        assert!(p.is_reachable(&dest).unwrap());

        let missing = Destination {
            path: dir.path().join("missing").to_string_lossy().to_string(),
            ..Destination::default()
        };
        assert!(!p.is_reachable(&missing).unwrap());
    }

    #[test]
    fn test_vpn_down_skips_ping() {
        let pinger = ScriptedPinger::new(Some(1));
        let p = probe(pinger, vec!["lo", "eth0"]);
        assert!(!p.is_reachable(&remote(Some("/etc/wireguard/wg-home.conf"))).unwrap());
    }

    #[test]
    fn test_vpn_up_pings() {
        let p = probe(ScriptedPinger::new(Some(1)), vec!["lo", "wg-home"]);
        assert!(p.is_reachable(&remote(Some("wg-home"))).unwrap());
    }

    #[test]
    fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let p = probe(ScriptedPinger::new(Some(3)), vec![]).with_retries(3);
        let mut seen = Vec::new();
        let ok = p
            .is_reachable_with(&remote(None), &mut |left| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.push(left);
            })
            .unwrap();
        assert!(ok);
        assert_eq!(seen, vec![2, 1]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_all_attempts_fail() {
        let p = probe(ScriptedPinger::new(None), vec![]).with_retries(2);
        let mut seen = Vec::new();
        let ok = p.is_reachable_with(&remote(None), &mut |left| seen.push(left)).unwrap();
        assert!(!ok);
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn test_default_single_attempt() {
        let p = probe(ScriptedPinger::new(Some(2)), vec![]);
        assert!(!p.is_reachable(&remote(None)).unwrap());
    }

    #[test]
    fn test_unresolvable_alias_is_an_error() {
        let p = probe(ScriptedPinger::new(Some(1)), vec![]);
        let dest = Destination {
            path: "nas:/volume1".into(),
            ..Destination::default()
        };
        assert!(p.is_reachable(&dest).is_err());
    }

    #[test]
    fn test_vpn_interface_name() {
        assert_eq!(vpn_interface_name("/etc/wireguard/wg0.conf"), "wg0");
        assert_eq!(vpn_interface_name("tun0"), "tun0");
    }
}
