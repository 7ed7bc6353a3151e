use std::{net::IpAddr, path::PathBuf, time::Duration};

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen for HTTPS connections on.
    #[arg(long, default_value_t = String::from("0.0.0.0:8443"), value_name = "ADDRESS")]
    pub https_address: String,

    /// Don't serve HTTPS at all.
    #[arg(long, default_value_t = false)]
    pub disable_https: bool,

    /// Address to listen for plain HTTP connections on.
    #[arg(long, default_value_t = String::from("0.0.0.0:8080"), value_name = "ADDRESS")]
    pub http_address: String,

    /// Don't serve plain HTTP at all.
    #[arg(long, default_value_t = false)]
    pub disable_http: bool,

    /// Don't accept HTTPS connections on the local address, only through the relay tunnel.
    #[arg(long, default_value_t = false)]
    pub disable_local_listener: bool,

    /// How to serve a given host, in the form HOST=TARGET. Can be repeated.
    ///
    /// TARGET is either `home` for the administration interface, `!other.host` to redirect
    /// to another host, or a backend address such as `127.0.0.1:3000`.
    #[arg(long = "route", value_name = "HOST=TARGET")]
    pub routes: Vec<String>,

    /// JSON file mapping hosts to targets, applied on top of --route.
    ///
    /// The file is watched and the routes are replaced whenever it changes.
    #[arg(long, value_name = "FILE")]
    pub routes_file: Option<PathBuf>,

    /// Forward raw TLS connections for a given server name to a TCP address, in the form
    /// HOST=ADDRESS. Can be repeated.
    #[arg(long = "forward", value_name = "HOST=ADDRESS")]
    pub forwards: Vec<String>,

    /// Drop connections from the relay tunnel unless their server name is public.
    #[arg(long, default_value_t = false)]
    pub private_mode: bool,

    /// Server name that stays reachable through the tunnel in private mode. Can be repeated.
    #[arg(long = "public-host", value_name = "HOST")]
    pub public_hosts: Vec<String>,

    /// Directory containing SSL certificates and keys.
    /// Each sub-directory inside of this one must contain a certificate chain in a
    /// fullchain.pem file and its private key in a privkey.pem file.
    #[arg(long, value_name = "DIRECTORY")]
    pub certificates_directory: Option<PathBuf>,

    /// Contact e-mail to use with Let's Encrypt. If set, enables ACME for HTTPS certificates.
    ///
    /// By providing your e-mail, you agree to the Let's Encrypt Subscriber Agreement.
    #[arg(long, value_name = "EMAIL")]
    pub acme_contact_email: Option<String>,

    /// Directory to use as a cache for Let's Encrypt's account and certificates.
    /// Everything but the account keys is removed on startup.
    #[arg(
        long,
        default_value_os = "./deploy/acme_cache",
        value_name = "DIRECTORY"
    )]
    pub acme_cache_directory: PathBuf,

    /// Controls whether to use the staging directory for Let's Encrypt certificates (default is production).
    /// Only set this option for testing.
    #[arg(long, default_value_t = false)]
    pub acme_use_staging: bool,

    /// Where plain HTTP requests for IP addresses and `.local` hosts are proxied to.
    ///
    /// If unset, they are answered by the administration interface.
    #[arg(long, value_name = "ADDRESS")]
    pub local_proxy_address: Option<String>,

    /// URL to probe periodically. The gateway exits after five consecutive failures.
    ///
    /// Defaults to the plain HTTP health endpoint, if plain HTTP is enabled.
    #[arg(long, value_name = "URL")]
    pub health_check_url: Option<String>,

    /// Time between health checks, which is also the timeout of each check.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration, value_name = "DURATION")]
    pub health_check_interval: Duration,

    /// Don't run the health check.
    #[arg(long, default_value_t = false)]
    pub disable_health_check: bool,

    /// How long to wait for a TLS Client Hello before dropping the connection.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration, value_name = "DURATION")]
    pub client_hello_timeout: Duration,

    /// Relay host to open the tunnel to. If unset, no tunnel is used.
    #[arg(long, value_name = "HOST")]
    pub fabrics_host: Option<String>,

    /// SSH port of the relay host.
    #[arg(long, default_value_t = 22, value_name = "PORT")]
    pub fabrics_port: u16,

    /// Known IP address of the relay host, used instead of resolving it. Can be repeated.
    #[arg(long = "fabrics-address", value_name = "IP")]
    pub fabrics_addresses: Vec<IpAddr>,

    /// User to authenticate as with the relay.
    #[arg(long, default_value_t = String::from("doorway"), value_name = "USER")]
    pub fabrics_user: String,

    /// Private key used to authenticate with the relay.
    #[arg(
        long,
        default_value_os = "./deploy/fabrics_key",
        value_name = "FILE"
    )]
    pub fabrics_key_file: PathBuf,

    /// Address that the relay should listen on for us.
    #[arg(long, default_value_t = String::from("0.0.0.0"), value_name = "HOST")]
    pub fabrics_bind_host: String,

    /// Port that the relay should listen on for us.
    #[arg(long, default_value_t = 443, value_name = "PORT")]
    pub fabrics_bind_port: u32,

    /// SHA256 fingerprint of the relay's host key. If set, any other key is rejected.
    #[arg(long, value_name = "FINGERPRINT")]
    pub fabrics_host_key_fingerprint: Option<String>,
}
