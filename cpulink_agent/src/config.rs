//! Agent configuration: defaults, env overrides and CLI flags.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8004;
pub const DEFAULT_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub listen: SocketAddr,
    /// Period of both the sampling tick and the per-reader push.
    pub interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
        }
    }
}

impl AgentConfig {
    /// Defaults with `CPULINK_AGENT_PORT` / `CPULINK_AGENT_INTERVAL_MS` applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(port) = std::env::var("CPULINK_AGENT_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
        {
            cfg.listen.set_port(port);
        }
        if let Some(ms) = std::env::var("CPULINK_AGENT_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
        {
            cfg.interval = Duration::from_millis(ms);
        }
        cfg
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ParsedArgs {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub interval_ms: Option<u64>,
}

impl ParsedArgs {
    pub fn apply(&self, cfg: &mut AgentConfig) {
        if let Some(ip) = self.bind {
            cfg.listen.set_ip(ip);
        }
        if let Some(port) = self.port {
            cfg.listen.set_port(port);
        }
        if let Some(ms) = self.interval_ms {
            cfg.interval = Duration::from_millis(ms);
        }
    }
}

fn usage(prog: &str) -> String {
    format!("Usage: {prog} [--port PORT|-p PORT] [--bind ADDR] [--interval-ms MS]")
}

/// Parses CLI flags. `Err` carries the text to print (help or a bad value).
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "cpulink_agent".into());
    let mut parsed = ParsedArgs::default();

    while let Some(arg) = it.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
            _ => (arg.clone(), None),
        };
        match flag.as_str() {
            "-h" | "--help" => return Err(usage(&prog)),
            "--port" | "-p" => {
                let v = inline.or_else(|| it.next()).unwrap_or_default();
                parsed.port = Some(
                    v.parse()
                        .map_err(|_| format!("invalid port {v:?}\n{}", usage(&prog)))?,
                );
            }
            "--bind" => {
                let v = inline.or_else(|| it.next()).unwrap_or_default();
                parsed.bind = Some(
                    v.parse()
                        .map_err(|_| format!("invalid bind address {v:?}\n{}", usage(&prog)))?,
                );
            }
            "--interval-ms" => {
                let v = inline.or_else(|| it.next()).unwrap_or_default();
                match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => parsed.interval_ms = Some(ms),
                    _ => return Err(format!("invalid interval {v:?}\n{}", usage(&prog))),
                }
            }
            _ => return Err(format!("Unexpected argument {arg:?}. {}", usage(&prog))),
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("agent")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn port_long_short_and_assign() {
        assert_eq!(parse_args(args(&["--port", "9001"])).unwrap().port, Some(9001));
        assert_eq!(parse_args(args(&["-p", "9002"])).unwrap().port, Some(9002));
        assert_eq!(parse_args(args(&["--port=9003"])).unwrap().port, Some(9003));
        assert_eq!(parse_args(args(&[])).unwrap(), ParsedArgs::default());
    }

    #[test]
    fn flags_override_defaults() {
        let parsed = parse_args(args(&["--bind", "127.0.0.1", "-p", "0", "--interval-ms", "50"]))
            .unwrap();
        let mut cfg = AgentConfig::default();
        parsed.apply(&mut cfg);
        assert_eq!(cfg.listen, "127.0.0.1:0".parse().unwrap());
        assert_eq!(cfg.interval, Duration::from_millis(50));
    }

    #[test]
    fn rejects_bad_values_and_help() {
        assert!(parse_args(args(&["--port", "nope"])).is_err());
        assert!(parse_args(args(&["--interval-ms", "0"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
        let help = parse_args(args(&["--help"])).unwrap_err();
        assert!(help.starts_with("Usage:"));
    }

    #[test]
    fn defaults_match_the_published_port() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.listen.port(), 8004);
        assert_eq!(cfg.interval, Duration::from_millis(100));
    }
}
