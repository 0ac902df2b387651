//! Configuration manager for jwks-bearer.
//!
//! Values come from command line flags (or their environment variables)
//! first, then from an optional YAML file.

use std::fs::File;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::{DEFAULT_TIMEOUT, token_endpoint};
use crate::error::{Error, Result};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_PORT: u16 = 8085;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file. `config.yaml` is used when present.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Request an access token using a signed client assertion.
    Token(TokenArgs),
    /// Publish the public key at `/.well-known/jwks.json`.
    Serve(ServeArgs),
}

#[derive(Debug, Default, Args)]
pub struct TokenArgs {
    /// Authentication server host, e.g. `https://auth.example.com`.
    #[arg(long, env = "AUTH_HOST")]
    pub auth_host: Option<String>,
    /// Realm holding the client.
    #[arg(long, env = "AUTH_REALM")]
    pub realm: Option<String>,
    /// Client identifier, used as assertion issuer and subject.
    #[arg(long, env = "CLIENT_ID")]
    pub client_id: Option<String>,
    /// Path to the PEM-encoded RSA private key.
    #[arg(long, env = "KEY_PATH")]
    pub key_path: Option<PathBuf>,
    /// The public key was sent to the authentication server: omit `kid`.
    #[arg(long, conflicts_with = "self_hosted")]
    pub no_self_hosted: bool,
    /// The public key is served as a JWKS: send `kid`. Overrides
    /// `public_key_is_served: false` from the file.
    #[arg(long)]
    pub self_hosted: bool,
    /// Seconds to wait for the token endpoint.
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Default, Args)]
pub struct ServeArgs {
    /// Path to the PEM-encoded RSA private key.
    #[arg(long, env = "KEY_PATH")]
    pub read_key: Option<PathBuf>,
    /// Listening port.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
    /// Expose Prometheus metrics on `/metrics`.
    #[arg(long)]
    pub metrics: bool,
}

/// Content of the YAML configuration file.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub key: Key,
    /// Whether the public key is served by us (JWKS) rather than uploaded.
    pub public_key_is_served: Option<bool>,
    #[serde(default)]
    pub server: Server,
    /// Token request timeout, in seconds.
    pub timeout: Option<u64>,
}

/// Authentication server configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    pub host: Option<String>,
    pub realm: Option<String>,
    pub client_id: Option<String>,
}

/// Private key configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub path: Option<PathBuf>,
}

/// JWKS server configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub port: Option<u16>,
}

impl Configuration {
    /// Reads the YAML file at `path`, or `config.yaml` if it exists.
    ///
    /// Without explicit path and default file, an empty configuration is
    /// returned.
    pub fn read(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(path) => path,
            None if Path::new(DEFAULT_CONFIG_PATH).is_file() => {
                Path::new(DEFAULT_CONFIG_PATH)
            },
            None => {
                tracing::debug!("no `{DEFAULT_CONFIG_PATH}` file, using flags only");
                return Ok(Self::default());
            },
        };

        let file = File::open(file_path).map_err(|err| Error::Configuration {
            message: format!("cannot open `{}`: {err}", file_path.display()),
        })?;

        serde_yaml::from_reader(file).map_err(|err| Error::Configuration {
            message: format!("invalid `{}`: {err}", file_path.display()),
        })
    }
}

/// Normalizes a URL string by ensuring it starts with a valid scheme
/// (`http` or `https`).
fn normalize_url(url: &str) -> Result<Url> {
    let url_with_scheme =
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("https://{url}")
        };

    Url::parse(&url_with_scheme).map_err(|err| Error::Configuration {
        message: format!("invalid auth host `{url}`: {err}"),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Settings of the `token` command.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub auth_host: Url,
    pub realm: String,
    pub client_id: String,
    pub key_path: PathBuf,
    pub self_hosted: bool,
    pub timeout: Duration,
}

impl ClientConfig {
    /// Merge flags over file values. Fails on the first missing value.
    pub fn new(args: TokenArgs, file: Configuration) -> Result<Self> {
        let auth_host = non_empty(args.auth_host.or(file.auth.host))
            .ok_or_else(|| {
                Error::missing("--auth-host", "authentication server host")
            })?;
        let realm = non_empty(args.realm.or(file.auth.realm))
            .ok_or_else(|| Error::missing("--realm", "api realm"))?;
        let client_id = non_empty(args.client_id.or(file.auth.client_id))
            .ok_or_else(|| Error::missing("--client-id", "client id"))?;
        let key_path = args
            .key_path
            .or(file.key.path)
            .ok_or_else(|| {
                Error::missing("--key-path", "path to your private key")
            })?;

        let self_hosted = if args.self_hosted {
            true
        } else if args.no_self_hosted {
            false
        } else {
            file.public_key_is_served.unwrap_or(true)
        };
        let timeout = args
            .timeout
            .or(file.timeout)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Ok(Self {
            auth_host: normalize_url(&auth_host)?,
            realm,
            client_id,
            key_path,
            self_hosted,
            timeout,
        })
    }

    /// Token endpoint, also the audience of client assertions.
    pub fn token_endpoint(&self) -> Result<Url> {
        token_endpoint(&self.auth_host, &self.realm)
    }
}

/// Settings of the `serve` command.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub key_path: PathBuf,
    pub address: SocketAddr,
    pub metrics: bool,
}

impl ServerConfig {
    /// Merge flags over file values.
    pub fn new(args: ServeArgs, file: Configuration) -> Result<Self> {
        let key_path = args.read_key.or(file.key.path).ok_or_else(|| {
            Error::missing("--read-key", "path to your private key")
        })?;
        let port = args.port.or(file.server.port).unwrap_or(DEFAULT_PORT);

        Ok(Self {
            key_path,
            address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            metrics: args.metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn token_args() -> TokenArgs {
        TokenArgs {
            auth_host: Some("auth.example.com".into()),
            realm: Some("demo".into()),
            client_id: Some("my-client".into()),
            key_path: Some("private_key.pem".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_token_command() {
        let cli = Cli::try_parse_from([
            "jwks-bearer",
            "token",
            "--auth-host",
            "https://auth.example.com",
            "--realm",
            "demo",
            "--client-id",
            "my-client",
            "--key-path",
            "private_key.pem",
            "--no-self-hosted",
        ])
        .unwrap();

        let Commands::Token(args) = cli.cmd else {
            panic!("expected token command");
        };
        assert!(args.no_self_hosted);
        assert_eq!(args.realm.as_deref(), Some("demo"));
    }

    #[test]
    fn test_parse_serve_command() {
        let cli = Cli::try_parse_from([
            "jwks-bearer",
            "serve",
            "--read-key",
            "private_key.pem",
            "--port",
            "9000",
        ])
        .unwrap();

        let Commands::Serve(args) = cli.cmd else {
            panic!("expected serve command");
        };
        let config = ServerConfig::new(args, Configuration::default()).unwrap();
        assert_eq!(config.address, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.key_path, PathBuf::from("private_key.pem"));
        assert!(!config.metrics);
    }

    #[test]
    fn test_client_config_defaults() {
        let config =
            ClientConfig::new(token_args(), Configuration::default()).unwrap();

        assert_eq!(config.auth_host.as_str(), "https://auth.example.com/");
        assert!(config.self_hosted);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(
            config.token_endpoint().unwrap().as_str(),
            "https://auth.example.com/auth/realms/demo/protocol/openid-connect/token"
        );
    }

    #[test]
    fn test_no_self_hosted() {
        let args = TokenArgs {
            no_self_hosted: true,
            ..token_args()
        };
        let config = ClientConfig::new(args, Configuration::default()).unwrap();
        assert!(!config.self_hosted);
    }

    #[test]
    fn test_self_hosted_flag_overrides_file() {
        let file = Configuration {
            public_key_is_served: Some(false),
            ..Default::default()
        };
        let config = ClientConfig::new(token_args(), file.clone()).unwrap();
        assert!(!config.self_hosted);

        let args = TokenArgs {
            self_hosted: true,
            ..token_args()
        };
        let config = ClientConfig::new(args, file).unwrap();
        assert!(config.self_hosted);

        let conflict = Cli::try_parse_from([
            "jwks-bearer",
            "token",
            "--self-hosted",
            "--no-self-hosted",
        ]);
        assert!(conflict.is_err());
    }

    #[test]
    fn test_missing_parameters() {
        let args = TokenArgs {
            realm: None,
            ..token_args()
        };
        let err = ClientConfig::new(args, Configuration::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("--realm"));

        let args = TokenArgs {
            client_id: Some("  ".into()),
            ..token_args()
        };
        let err = ClientConfig::new(args, Configuration::default()).unwrap_err();
        assert!(err.to_string().contains("--client-id"));

        let err =
            ServerConfig::new(ServeArgs::default(), Configuration::default())
                .unwrap_err();
        assert!(err.to_string().contains("--read-key"));
    }

    #[test]
    fn test_file_values_and_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
auth:
  host: http://localhost:8080
  realm: file-realm
  client_id: file-client
key:
  path: /etc/keys/private_key.pem
public_key_is_served: false
server:
  port: 9090
timeout: 5
"#
        )
        .unwrap();

        let configuration = Configuration::read(Some(file.path())).unwrap();
        let args = TokenArgs {
            realm: Some("flag-realm".into()),
            ..Default::default()
        };
        let config = ClientConfig::new(args, configuration.clone()).unwrap();

        assert_eq!(config.auth_host.as_str(), "http://localhost:8080/");
        assert_eq!(config.realm, "flag-realm");
        assert_eq!(config.client_id, "file-client");
        assert_eq!(config.key_path, PathBuf::from("/etc/keys/private_key.pem"));
        assert!(!config.self_hosted);
        assert_eq!(config.timeout, Duration::from_secs(5));

        let server =
            ServerConfig::new(ServeArgs::default(), configuration).unwrap();
        assert_eq!(server.address.port(), 9090);
    }

    #[test]
    fn test_invalid_file() {
        let missing = Configuration::read(Some(Path::new("/nonexistent.yaml")));
        assert!(matches!(missing, Err(Error::Configuration { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server: [").unwrap();
        let invalid = Configuration::read(Some(file.path()));
        assert!(matches!(invalid, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_invalid_auth_host() {
        let args = TokenArgs {
            auth_host: Some("http://".into()),
            ..token_args()
        };
        let err = ClientConfig::new(args, Configuration::default()).unwrap_err();
        assert!(err.to_string().contains("invalid auth host"));
    }
}
