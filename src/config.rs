//! Agent configuration.
//!
//! Settings come from one pluggable [`ConfigSource`], chosen once at startup:
//! command-line style flags ([`ArgsSource`]), a dotfile of `KEY=value` lines
//! ([`EnvFileSource`]), pre-collected environment pairs ([`MapSource`]), or a
//! [`Layered`] combination of two of them. [`AgentConfig::load`] validates every
//! required setting before anything touches the network.

use core::fmt;

use crate::error::{ConfigError, CredentialKind};

/// Default MQTT-over-TLS port.
pub const DEFAULT_PORT: u16 = 8883;

/// Help text shown when the configuration is incomplete.
pub const USAGE: &str = "\
Usage: shadow-agent [OPTIONS]

  --thing <name>        AWS IoT thing name (THING_NAME)
  --endpoint <host>     AWS IoT endpoint, host[:port] (ENDPOINT)
  --privatekey <path>   full path to the thing private key .pem.key file (PRIVATE_KEY_PATH)
  --cert <path>         full path to the thing certificate .pem.crt file (CERTIFICATE_PATH)
  --rootca <path>       full path to the root CA .crt file (ROOT_CA_PATH)
  --logfile <path>      full path for the log file (LOG_FILE_PATH)
  --shadow <name>       named shadow to update, classic shadow if omitted (SHADOW_NAME)
";

/// A single configuration setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigKey {
    ThingName,
    Endpoint,
    PrivateKeyPath,
    CertificatePath,
    RootCaPath,
    LogFilePath,
    ShadowName,
}

impl ConfigKey {
    /// Settings without which the agent refuses to start.
    pub const REQUIRED: [ConfigKey; 6] = [
        ConfigKey::ThingName,
        ConfigKey::Endpoint,
        ConfigKey::PrivateKeyPath,
        ConfigKey::CertificatePath,
        ConfigKey::RootCaPath,
        ConfigKey::LogFilePath,
    ];

    /// Command-line flag, including the leading dashes.
    pub fn flag(&self) -> &'static str {
        match self {
            ConfigKey::ThingName => "--thing",
            ConfigKey::Endpoint => "--endpoint",
            ConfigKey::PrivateKeyPath => "--privatekey",
            ConfigKey::CertificatePath => "--cert",
            ConfigKey::RootCaPath => "--rootca",
            ConfigKey::LogFilePath => "--logfile",
            ConfigKey::ShadowName => "--shadow",
        }
    }

    /// Variable name in a dotfile or the environment.
    pub fn env_name(&self) -> &'static str {
        match self {
            ConfigKey::ThingName => "THING_NAME",
            ConfigKey::Endpoint => "ENDPOINT",
            ConfigKey::PrivateKeyPath => "PRIVATE_KEY_PATH",
            ConfigKey::CertificatePath => "CERTIFICATE_PATH",
            ConfigKey::RootCaPath => "ROOT_CA_PATH",
            ConfigKey::LogFilePath => "LOG_FILE_PATH",
            ConfigKey::ShadowName => "SHADOW_NAME",
        }
    }

    fn matches_flag(&self, name: &str) -> bool {
        // Both `-thing` and `--thing` are accepted.
        name.strip_prefix('-')
            .map(|n| n.strip_prefix('-').unwrap_or(n))
            .is_some_and(|n| n == &self.flag()[2..])
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

/// Where settings are read from.
pub trait ConfigSource {
    /// The raw value of `key`, if the source defines it.
    fn get(&self, key: ConfigKey) -> Option<&str>;
}

impl<S: ConfigSource + ?Sized> ConfigSource for &S {
    fn get(&self, key: ConfigKey) -> Option<&str> {
        (**self).get(key)
    }
}

/// Command-line style flags: `--thing pump-7` or `--thing=pump-7`.
///
/// The program name must not be included. When a flag repeats, the last
/// occurrence wins.
pub struct ArgsSource<'a> {
    args: &'a [&'a str],
}

impl<'a> ArgsSource<'a> {
    pub fn new(args: &'a [&'a str]) -> Self {
        Self { args }
    }
}

impl ConfigSource for ArgsSource<'_> {
    fn get(&self, key: ConfigKey) -> Option<&str> {
        let mut found = None;
        let mut args = self.args.iter().copied().peekable();
        while let Some(arg) = args.next() {
            if !arg.starts_with('-') {
                continue;
            }
            let (name, inline) = match arg.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (arg, None),
            };
            if !key.matches_flag(name) {
                continue;
            }
            found = match inline {
                Some(value) => Some(value),
                None => args.next_if(|next| !next.starts_with('-')),
            };
        }
        found
    }
}

/// A dotfile of `KEY=value` lines.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is allowed and
/// values may be wrapped in single or double quotes.
pub struct EnvFileSource<'a> {
    contents: &'a str,
}

impl<'a> EnvFileSource<'a> {
    pub fn new(contents: &'a str) -> Self {
        Self { contents }
    }

    fn entries(&self) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.contents.lines().filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            Some((key.trim(), unquote(value.trim())))
        })
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

impl ConfigSource for EnvFileSource<'_> {
    fn get(&self, key: ConfigKey) -> Option<&str> {
        self.entries()
            .filter(|(name, _)| *name == key.env_name())
            .map(|(_, value)| value)
            .last()
    }
}

/// Pre-collected `(NAME, value)` pairs, typically taken from the process environment.
pub struct MapSource<'a> {
    pairs: &'a [(&'a str, &'a str)],
}

impl<'a> MapSource<'a> {
    pub fn new(pairs: &'a [(&'a str, &'a str)]) -> Self {
        Self { pairs }
    }
}

impl ConfigSource for MapSource<'_> {
    fn get(&self, key: ConfigKey) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(name, _)| *name == key.env_name())
            .map(|(_, value)| *value)
    }
}

/// Two sources; the first one that yields a non-empty value wins.
pub struct Layered<A, B> {
    first: A,
    second: B,
}

impl<A, B> Layered<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: ConfigSource, B: ConfigSource> ConfigSource for Layered<A, B> {
    fn get(&self, key: ConfigKey) -> Option<&str> {
        self.first
            .get(key)
            .filter(|v| !v.is_empty())
            .or_else(|| self.second.get(key))
    }
}

/// Broker address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint<'a> {
    pub host: &'a str,
    pub port: u16,
}

impl<'a> Endpoint<'a> {
    /// Parses `host`, `host:port` or `mqtts://host[:port]`.
    pub fn parse(value: &'a str) -> Option<Self> {
        let value = value.strip_prefix("mqtts://").unwrap_or(value);
        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok().filter(|&p| p != 0)?),
            None => (value, DEFAULT_PORT),
        };
        if host.is_empty() || host.contains(['/', ' ', ':']) {
            return None;
        }
        Some(Self { host, port })
    }
}

/// Paths to the PEM key material used for mutual TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials<'a> {
    pub private_key_path: &'a str,
    pub certificate_path: &'a str,
    pub root_ca_path: &'a str,
}

impl<'a> Credentials<'a> {
    pub fn path(&self, kind: CredentialKind) -> &'a str {
        match kind {
            CredentialKind::PrivateKey => self.private_key_path,
            CredentialKind::Certificate => self.certificate_path,
            CredentialKind::RootCa => self.root_ca_path,
        }
    }
}

/// Validated agent settings.
///
/// Holding one proves every required setting was present, so a driver built
/// from it can never start a connection with incomplete configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentConfig<'a> {
    pub thing_name: &'a str,
    pub endpoint: Endpoint<'a>,
    pub credentials: Credentials<'a>,
    pub log_file_path: &'a str,
    pub shadow_name: Option<&'a str>,
}

impl<'a> AgentConfig<'a> {
    /// Reads and validates every setting from `source`.
    ///
    /// Reports the first missing required setting, in [`ConfigKey::REQUIRED`] order.
    pub fn load<S: ConfigSource + ?Sized>(source: &'a S) -> Result<Self, ConfigError> {
        let required = |key: ConfigKey| {
            source
                .get(key)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let thing_name = required(ConfigKey::ThingName)?;
        let endpoint = required(ConfigKey::Endpoint)?;
        let private_key_path = required(ConfigKey::PrivateKeyPath)?;
        let certificate_path = required(ConfigKey::CertificatePath)?;
        let root_ca_path = required(ConfigKey::RootCaPath)?;
        let log_file_path = required(ConfigKey::LogFilePath)?;

        let endpoint =
            Endpoint::parse(endpoint).ok_or(ConfigError::Invalid(ConfigKey::Endpoint))?;
        if thing_name.contains(['/', '#', '+']) {
            return Err(ConfigError::Invalid(ConfigKey::ThingName));
        }
        let shadow_name = source
            .get(ConfigKey::ShadowName)
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if shadow_name.is_some_and(|n| n.contains(['/', '#', '+'])) {
            return Err(ConfigError::Invalid(ConfigKey::ShadowName));
        }

        Ok(Self {
            thing_name,
            endpoint,
            credentials: Credentials {
                private_key_path,
                certificate_path,
                root_ca_path,
            },
            log_file_path,
            shadow_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARGS: [&str; 12] = [
        "--thing",
        "pump-7",
        "--endpoint",
        "abc123-ats.iot.eu-west-1.amazonaws.com",
        "--privatekey",
        "/etc/agent/private.pem.key",
        "--cert=/etc/agent/cert.pem.crt",
        "-rootca",
        "/etc/agent/AmazonRootCA1.pem",
        "--logfile",
        "/var/log/agent.log",
        "--verbose",
    ];

    #[test]
    fn loads_from_flags() {
        let source = ArgsSource::new(&ARGS);
        let config = AgentConfig::load(&source).unwrap();
        assert_eq!(config.thing_name, "pump-7");
        assert_eq!(
            config.endpoint,
            Endpoint {
                host: "abc123-ats.iot.eu-west-1.amazonaws.com",
                port: DEFAULT_PORT
            }
        );
        assert_eq!(config.credentials.certificate_path, "/etc/agent/cert.pem.crt");
        assert_eq!(config.credentials.root_ca_path, "/etc/agent/AmazonRootCA1.pem");
        assert_eq!(config.log_file_path, "/var/log/agent.log");
        assert_eq!(config.shadow_name, None);
    }

    #[test]
    fn each_missing_required_setting_is_reported() {
        for (i, key) in ConfigKey::REQUIRED.iter().enumerate() {
            // Drop the flag/value pair of one required setting.
            let mut args: heapless::Vec<&str, 12> = heapless::Vec::new();
            let mut skip_value = false;
            for arg in ARGS {
                if skip_value {
                    skip_value = false;
                    continue;
                }
                if arg.trim_start_matches('-').split('=').next() == Some(&key.flag()[2..]) {
                    skip_value = !arg.contains('=');
                    continue;
                }
                args.push(arg).unwrap();
            }
            let source = ArgsSource::new(&args);
            assert_eq!(
                AgentConfig::load(&source),
                Err(ConfigError::Missing(ConfigKey::REQUIRED[i]))
            );
        }
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let source = EnvFileSource::new("THING_NAME=\nENDPOINT=host\n");
        assert_eq!(
            AgentConfig::load(&source),
            Err(ConfigError::Missing(ConfigKey::ThingName))
        );
    }

    #[test]
    fn loads_from_dotfile() {
        let source = EnvFileSource::new(
            "# agent settings\n\
             THING_NAME=pump-7\n\
             export ENDPOINT=\"broker.local:8884\"\n\
             PRIVATE_KEY_PATH='/k.pem'\n\
             CERTIFICATE_PATH=/c.pem\n\
             ROOT_CA_PATH=/ca.pem\n\
             \n\
             LOG_FILE_PATH=/log\n\
             SHADOW_NAME=telemetry\n",
        );
        let config = AgentConfig::load(&source).unwrap();
        assert_eq!(
            config.endpoint,
            Endpoint {
                host: "broker.local",
                port: 8884
            }
        );
        assert_eq!(config.credentials.private_key_path, "/k.pem");
        assert_eq!(config.shadow_name, Some("telemetry"));
    }

    #[test]
    fn layered_prefers_first_source() {
        let flags = ["--thing", "from-flags"];
        let pairs = [
            ("THING_NAME", "from-env"),
            ("ENDPOINT", "broker"),
            ("PRIVATE_KEY_PATH", "/k"),
            ("CERTIFICATE_PATH", "/c"),
            ("ROOT_CA_PATH", "/ca"),
            ("LOG_FILE_PATH", "/log"),
        ];
        let source = Layered::new(ArgsSource::new(&flags), MapSource::new(&pairs));
        let config = AgentConfig::load(&source).unwrap();
        assert_eq!(config.thing_name, "from-flags");
        assert_eq!(config.endpoint.host, "broker");
    }

    #[test]
    fn flag_without_value_is_absent() {
        let args = ["--thing", "--endpoint", "broker"];
        let source = ArgsSource::new(&args);
        assert_eq!(source.get(ConfigKey::ThingName), None);
        assert_eq!(source.get(ConfigKey::Endpoint), Some("broker"));
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        for bad in ["host:port", ":8883", "host:0", "a/b", "host:99999"] {
            assert_eq!(Endpoint::parse(bad), None, "{bad}");
        }
        assert_eq!(
            Endpoint::parse("mqtts://broker:443"),
            Some(Endpoint {
                host: "broker",
                port: 443
            })
        );
    }

    #[test]
    fn thing_name_with_wildcards_is_invalid() {
        let pairs = [
            ("THING_NAME", "pump/7"),
            ("ENDPOINT", "broker"),
            ("PRIVATE_KEY_PATH", "/k"),
            ("CERTIFICATE_PATH", "/c"),
            ("ROOT_CA_PATH", "/ca"),
            ("LOG_FILE_PATH", "/log"),
        ];
        let source = MapSource::new(&pairs);
        assert_eq!(
            AgentConfig::load(&source),
            Err(ConfigError::Invalid(ConfigKey::ThingName))
        );
    }
}
