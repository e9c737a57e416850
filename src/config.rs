//! Server configuration and command-line parsing.

use crate::connection::{ChannelUpgrade, NoChannelUpgrade};
use crate::session::{SessionOptions, DEFAULT_MAX_STANZA_BYTES};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Standard XMPP client-to-server port.
pub const DEFAULT_PORT: u16 = 5222;

pub const DEFAULT_BACKLOG: i32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen endpoint. An unspecified IPv6 address binds dual-stack.
    pub listen: SocketAddr,
    pub backlog: i32,
    pub no_delay: bool,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Cap on buffered, not yet parsed bytes per connection.
    pub max_stanza_bytes: usize,
    /// SASL mechanisms advertised by the built-in negotiator.
    pub mechanisms: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_PORT),
            backlog: DEFAULT_BACKLOG,
            no_delay: true,
            read_timeout: None,
            write_timeout: None,
            max_stanza_bytes: DEFAULT_MAX_STANZA_BYTES,
            mechanisms: vec!["PLAIN".to_string()],
        }
    }
}

impl ServerConfig {
    pub fn session_options(&self, upgrade: Arc<dyn ChannelUpgrade>) -> SessionOptions {
        SessionOptions {
            max_stanza_bytes: self.max_stanza_bytes,
            upgrade,
        }
    }

    pub fn plain_session_options(&self) -> SessionOptions {
        self.session_options(Arc::new(NoChannelUpgrade))
    }
}

/// Everything the binary reads from its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOptions {
    pub server: ServerConfig,
    /// `Some("default")` for `-v`/`--verbose`, `Some(level)` for `--verbose=level`.
    pub verbose: Option<String>,
    pub log_file: Option<String>,
    pub help: bool,
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid value for {}: '{}'", flag, value))
}

fn parse_seconds(flag: &str, value: &str) -> Result<Option<Duration>, String> {
    match parse_number::<u64>(flag, value)? {
        0 => Ok(None),
        secs => Ok(Some(Duration::from_secs(secs))),
    }
}

/// Parse `--flag=value` style arguments, without the program name.
pub fn parse_args<I, S>(args: I) -> Result<CliOptions, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut options = CliOptions::default();
    let mut port = None;

    for arg in args {
        let arg = arg.as_ref();
        let (flag, value) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value)),
            None => (arg, None),
        };

        match (flag, value) {
            ("-h" | "--help", None) => options.help = true,
            ("-v" | "--verbose", None) => options.verbose = Some("default".to_string()),
            ("--verbose", Some(level)) => options.verbose = Some(level.to_string()),
            ("--log-file", Some(path)) => options.log_file = Some(path.to_string()),
            ("--listen", Some(addr)) => {
                options.server.listen = addr
                    .parse()
                    .or_else(|_| addr.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DEFAULT_PORT)))
                    .map_err(|_| format!("Invalid listen address: '{}'", addr))?;
            }
            ("--port", Some(value)) => port = Some(parse_number::<u16>(flag, value)?),
            ("--backlog", Some(value)) => options.server.backlog = parse_number(flag, value)?,
            ("--max-stanza-bytes", Some(value)) => {
                let limit: usize = parse_number(flag, value)?;
                if limit == 0 {
                    return Err("--max-stanza-bytes must be positive".to_string());
                }
                options.server.max_stanza_bytes = limit;
            }
            ("--read-timeout-secs", Some(value)) => options.server.read_timeout = parse_seconds(flag, value)?,
            ("--write-timeout-secs", Some(value)) => options.server.write_timeout = parse_seconds(flag, value)?,
            ("--no-delay", Some(value)) => {
                options.server.no_delay = match value {
                    "true" | "on" | "1" => true,
                    "false" | "off" | "0" => false,
                    _ => return Err(format!("Invalid value for --no-delay: '{}'", value)),
                }
            }
            ("--mechanisms", Some(list)) => {
                options.server.mechanisms = list
                    .split(';')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => return Err(format!("Unknown option: '{}'", arg)),
        }
    }

    if let Some(port) = port {
        options.server.listen.set_port(port);
    }
    Ok(options)
}
