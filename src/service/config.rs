use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// One `[[listeners]]` entry of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// `Any` (or empty) for all IPv4 interfaces, `IPv6Any` for all IPv6
    /// interfaces, otherwise a literal address.
    #[serde(default)]
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

fn default_backlog() -> i32 {
    100
}

/// A listener entry after its address has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerInfo {
    pub endpoint: SocketAddr,
    pub backlog: i32,
}

impl ListenerConfig {
    pub fn to_listener_info(&self) -> AppResult<ListenerInfo> {
        let ip = parse_ip_address(&self.ip)?;
        Ok(ListenerInfo {
            endpoint: SocketAddr::new(ip, self.port),
            backlog: self.backlog,
        })
    }
}

fn parse_ip_address(ip: &str) -> AppResult<IpAddr> {
    let ip = ip.trim();
    if ip.is_empty() || ip.eq_ignore_ascii_case("any") {
        Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    } else if ip.eq_ignore_ascii_case("ipv6any") {
        Ok(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
    } else {
        ip.parse::<IpAddr>()
            .map_err(|e| AppError::InvalidConfig(format!("listener ip {}: {}", ip, e)))
    }
}

/// Server wide settings. Sizes are bytes, `send_timeout` and
/// `shutdown_timeout` are milliseconds, the remaining durations are seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub rec_buffer_size: usize,
    pub send_buffer_size: usize,
    pub max_connection_number: usize,
    pub max_request_length: usize,
    pub sending_queue_size: usize,
    /// < 0: fail at once with a timeout, 0: a single attempt, > 0: retry for
    /// up to this many milliseconds.
    pub send_timeout: i64,
    pub keep_alive_time: u64,
    pub keep_alive_interval: u64,
    pub idle_session_timeout: u64,
    pub clear_idle_session_interval: u64,
    /// How long `stop` waits for sessions to reach closed. 0 waits forever.
    pub shutdown_timeout: u64,
    pub listeners: Vec<ListenerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            rec_buffer_size: 8228,
            send_buffer_size: 8228,
            max_connection_number: 100,
            max_request_length: 8228,
            sending_queue_size: 100,
            send_timeout: 1000,
            keep_alive_time: 30,
            keep_alive_interval: 30,
            idle_session_timeout: 20,
            clear_idle_session_interval: 10,
            shutdown_timeout: 5000,
            listeners: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;

        Ok(server_config)
    }

    /// Resolves every listener entry. An empty list or any malformed entry
    /// is an error.
    pub fn listener_infos(&self) -> AppResult<Vec<ListenerInfo>> {
        if self.listeners.is_empty() {
            return Err(AppError::InvalidConfig("no listener found".to_string()));
        }
        self.listeners
            .iter()
            .map(ListenerConfig::to_listener_info)
            .collect()
    }

    /// The receive slab size, falling back to 4KB when unset.
    pub fn effective_rec_buffer_size(&self) -> usize {
        if self.rec_buffer_size == 0 {
            4 * 1024
        } else {
            self.rec_buffer_size
        }
    }

    pub fn idle_session_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_session_timeout)
    }

    pub fn clear_idle_session_interval(&self) -> Duration {
        Duration::from_secs(self.clear_idle_session_interval.max(1))
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        if self.shutdown_timeout == 0 {
            None
        } else {
            Some(Duration::from_millis(self.shutdown_timeout))
        }
    }

    /// Sending queue pool bounds, derived from the connection limit.
    pub fn sending_queue_pool_bounds(&self) -> (usize, usize) {
        let min = (self.max_connection_number / 6).max(256);
        let max = (self.max_connection_number * 2).max(256);
        (min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_load_from_toml() -> AppResult<()> {
        let mut file = Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            r#"
max_request_length = 4096
send_timeout = -1

[[listeners]]
ip = "Any"
port = 13399
backlog = 5

[[listeners]]
ip = "127.0.0.1"
port = 13400
"#
        )?;
        let config = ServerConfig::set_up_config(file.path())?;
        assert_eq!(config.max_request_length, 4096);
        assert_eq!(config.send_timeout, -1);
        // untouched fields keep their defaults
        assert_eq!(config.sending_queue_size, 100);

        let infos = config.listener_infos()?;
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].endpoint, "0.0.0.0:13399".parse::<SocketAddr>().unwrap());
        assert_eq!(infos[0].backlog, 5);
        assert_eq!(infos[1].endpoint, "127.0.0.1:13400".parse::<SocketAddr>().unwrap());
        assert_eq!(infos[1].backlog, 100);
        Ok(())
    }

    #[test]
    fn test_empty_listeners_rejected() {
        let config = ServerConfig::default();
        assert!(matches!(
            config.listener_infos(),
            Err(AppError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_malformed_listener_rejected() {
        let config = ServerConfig {
            listeners: vec![ListenerConfig {
                ip: "not-an-ip".to_string(),
                port: 1,
                backlog: 1,
            }],
            ..Default::default()
        };
        assert!(config.listener_infos().is_err());
    }

    #[test]
    fn test_ipv6_any() -> AppResult<()> {
        let listener = ListenerConfig {
            ip: "IPv6Any".to_string(),
            port: 80,
            backlog: 1,
        };
        let info = listener.to_listener_info()?;
        assert_eq!(info.endpoint.ip(), IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        Ok(())
    }

    #[test]
    fn test_pool_bounds() {
        let config = ServerConfig {
            max_connection_number: 6000,
            ..Default::default()
        };
        assert_eq!(config.sending_queue_pool_bounds(), (1000, 12000));
        assert_eq!(ServerConfig::default().sending_queue_pool_bounds(), (256, 256));
    }
}
