use clap::{Parser, Subcommand};
use std::num::ParseIntError;
use std::time::Duration;

use anyhow::{Context, Result};
use nimbus_client::{ClientConfig, IotClient, KeyPair, ProtocolVersion, Uri};

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

fn parse_version(s: &str) -> Result<ProtocolVersion, String> {
    ProtocolVersion::try_from(s).map_err(|e| e.to_string())
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Base URI of the cloud service
    #[arg(env = "NIMBUS_ENDPOINT", long = "endpoint", value_name = "uri")]
    pub endpoint: Uri,

    /// Username of the basic-auth principal
    #[arg(env = "NIMBUS_USERNAME", long = "username", value_name = "user")]
    pub username: String,

    /// Password of the basic-auth principal
    #[arg(env = "NIMBUS_PASSWORD", long = "password", value_name = "pass")]
    pub password: String,

    /// Accept self-signed server certificates (development instances only)
    #[arg(env = "NIMBUS_ACCEPT_INVALID_CERTS", long = "accept-invalid-certs")]
    pub accept_invalid_certs: bool,

    /// Request timeout in milliseconds
    #[arg(
        env = "NIMBUS_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub request_timeout: Option<Duration>,

    /// API protocol version to assume (v1 or v2)
    #[arg(
        env = "NIMBUS_API_VERSION",
        long = "api-version",
        value_name = "ver",
        value_parser = parse_version
    )]
    pub api_version: Option<ProtocolVersion>,

    /// PEM file holding the device private key; a fresh key pair is
    /// generated when not given
    #[arg(env = "NIMBUS_KEY_FILE", long = "key-file", value_name = "path")]
    pub key_file: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Walk one gateway through its whole lifecycle: create, activate,
    /// send telemetry, delete
    Demo {
        /// Shared secret to register the gateway with
        #[arg(long = "shared-secret", value_name = "secret", default_value = "secret")]
        shared_secret: String,

        /// Gateway name; generated when not given
        #[arg(long = "name", value_name = "name")]
        name: Option<String>,
    },

    /// Populate the instance with a randomized device fleet
    Army {
        /// Number of directly-connected devices to create
        #[arg(long = "count", value_name = "n", default_value_t = 40)]
        count: u32,

        #[arg(long = "shared-secret", value_name = "secret", default_value = "secret")]
        shared_secret: String,
    },

    /// Have the activated devices send randomized telemetry
    Simulate {
        #[arg(long = "shared-secret", value_name = "secret", default_value = "secret")]
        shared_secret: String,

        /// Time between rounds in milliseconds
        #[arg(long = "interval-ms", value_name = "ms", default_value_t = 5_000)]
        interval_ms: u64,

        /// Number of rounds to run
        #[arg(long = "rounds", value_name = "n", default_value_t = 10)]
        rounds: u32,
    },

    /// Delete every device that is not decommissioned
    DeleteAll,
}

impl Cli {
    pub fn build_client(&self) -> Result<IotClient> {
        let mut config = ClientConfig::new(self.endpoint.clone())
            .with_accept_invalid_certs(self.accept_invalid_certs);
        if let Some(timeout) = self.request_timeout {
            config = config.with_request_timeout(timeout);
        }
        if let Some(version) = self.api_version {
            config = config.with_version(version);
        }

        let keys = match &self.key_file {
            Some(path) => {
                let pem = std::fs::read_to_string(path)
                    .with_context(|| format!("reading key file {}", path.display()))?;
                KeyPair::from_private_key_pem(&pem).context("decoding device private key")?
            }
            None => KeyPair::generate(2048).context("generating device key pair")?,
        };

        let client = IotClient::new(config, keys)?;
        client.set_principal(self.username.clone(), self.password.clone());
        Ok(client)
    }
}

pub fn parse() -> Cli {
    Parser::parse()
}
