use anyhow::{bail, Context, Result};
use clap::parser::ValueSource;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = ".upduck.json";

pub fn build_cli() -> Command {
    let app = Command::new(env!("CARGO_CRATE_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .after_help(AFTER_HELP)
        .arg(
            Arg::new("port")
                .env("UPDUCK_PORT")
                .hide_env(true)
                .short('p')
                .long("port")
                .default_value("8080")
                .value_parser(value_parser!(u16))
                .value_name("port")
                .help("HTTP server port"),
        )
        .arg(
            Arg::new("dir")
                .env("UPDUCK_DIR")
                .hide_env(true)
                .short('d')
                .long("dir")
                .default_value(".")
                .value_parser(value_parser!(PathBuf))
                .value_name("dir")
                .help("Directory that should be served"),
        )
        .arg(
            Arg::new("disallow-listings")
                .env("UPDUCK_DISALLOW_LISTINGS")
                .hide_env(true)
                .long("disallow-listings")
                .action(ArgAction::SetTrue)
                .help("Don't show directory listings"),
        )
        .arg(
            Arg::new("email")
                .env("UPDUCK_EMAIL")
                .hide_env(true)
                .long("email")
                .value_name("email")
                .help("Email sent to Let's Encrypt for certificate registration"),
        )
        .arg(
            Arg::new("token")
                .env("UPDUCK_TOKEN")
                .hide_env(true)
                .long("token")
                .value_name("token")
                .help("The token you get from duckdns.org"),
        )
        .arg(
            Arg::new("site")
                .env("UPDUCK_SITE")
                .hide_env(true)
                .long("site")
                .value_name("site")
                .help("Your duckdns.org subdomain, e.g. \"test\" for test.duckdns.org"),
        )
        .arg(
            Arg::new("https-port")
                .env("UPDUCK_HTTPS_PORT")
                .hide_env(true)
                .long("https-port")
                .default_value("443")
                .value_parser(value_parser!(u16))
                .value_name("port")
                .help("HTTPS server port"),
        )
        .arg(
            Arg::new("allow-symlink")
                .env("UPDUCK_ALLOW_SYMLINK")
                .hide_env(true)
                .long("allow-symlink")
                .action(ArgAction::SetTrue)
                .help("Serve symlinks that point outside the served directory"),
        )
        .arg(
            Arg::new("log-file")
                .env("UPDUCK_LOG_FILE")
                .hide_env(true)
                .long("log-file")
                .value_name("file")
                .value_parser(value_parser!(PathBuf))
                .help("Append log lines to a file instead of the terminal"),
        )
        .arg(
            Arg::new("save")
                .long("save")
                .action(ArgAction::SetTrue)
                .help("Save the given arguments to the config file and exit"),
        );

    #[cfg(feature = "tls")]
    let app = app
        .arg(
            Arg::new("tls-cert")
                .env("UPDUCK_TLS_CERT")
                .hide_env(true)
                .long("tls-cert")
                .value_name("path")
                .value_parser(value_parser!(PathBuf))
                .requires("tls-key")
                .help("Path to a certificate file for the HTTPS listener"),
        )
        .arg(
            Arg::new("tls-key")
                .env("UPDUCK_TLS_KEY")
                .hide_env(true)
                .long("tls-key")
                .value_name("path")
                .value_parser(value_parser!(PathBuf))
                .requires("tls-cert")
                .help("Path to the private key file for the HTTPS listener"),
        );

    app.subcommand(
        Command::new("adduser")
            .about("Add a user, or replace their password")
            .arg(Arg::new("name").required(true).value_name("NAME"))
            .arg(
                Arg::new("password")
                    .long("password")
                    .value_name("password")
                    .help("Password of the user; read from stdin when omitted"),
            ),
    )
    .subcommand(
        Command::new("deluser")
            .about("Remove a user")
            .arg(Arg::new("name").required(true).value_name("NAME")),
    )
    .subcommand(Command::new("resetusers").about("Remove all users, disabling authentication"))
}

const AFTER_HELP: &str = "\
Examples:
  Serve the working directory on port 8080:
    upduck

  Serve a directory on port 2020 without directory listings:
    upduck -p 2020 --disallow-listings --dir path/to/dir

  Keep the DuckDNS settings for the next runs:
    upduck --save --email you@example.com --token <token> --site mysite

  Require a login:
    upduck adduser alice";

/// What the process was asked to do.
#[derive(Debug)]
pub enum Action {
    Serve(Box<Args>),
    SaveConfig(Config),
    AddUser {
        name: String,
        password: Option<String>,
    },
    DelUser {
        name: String,
    },
    ResetUsers,
}

/// Settings persisted with `--save`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_port: u16,
    pub dir: PathBuf,
    pub disallow_listings: bool,
    pub duck_dns_token: String,
    pub duck_dns_site: String,
    pub lets_encrypt_email: String,
    pub https_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 8080,
            dir: PathBuf::from("."),
            disallow_listings: false,
            duck_dns_token: String::new(),
            duck_dns_site: String::new(),
            lets_encrypt_email: String::new(),
            https_port: 443,
        }
    }
}

impl Config {
    /// A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read(path) {
            Ok(v) => v,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read `{}`", path.display()))
            }
        };
        serde_json::from_slice(&data)
            .with_context(|| format!("Invalid config file `{}`", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create `{}`", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data).with_context(|| format!("Failed to write `{}`", path.display()))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        let string = |name: &str| matches.get_one::<String>(name).cloned().unwrap_or_default();
        Self {
            server_port: matches.get_one::<u16>("port").copied().unwrap_or(8080),
            dir: matches
                .get_one::<PathBuf>("dir")
                .cloned()
                .unwrap_or_else(|| PathBuf::from(".")),
            disallow_listings: matches.get_flag("disallow-listings"),
            duck_dns_token: string("token"),
            duck_dns_site: string("site"),
            lets_encrypt_email: string("email"),
            https_port: matches.get_one::<u16>("https-port").copied().unwrap_or(443),
        }
    }

    fn warn_incomplete_duck_dns(&self) {
        match (self.duck_dns_token.is_empty(), self.duck_dns_site.is_empty()) {
            (true, true) => info!("Not using DuckDNS"),
            (true, false) => warn!("Token missing for your DuckDNS site"),
            (false, true) => warn!("DuckDNS site missing, you only gave the token"),
            (false, false) => {}
        }
    }
}

/// Immutable server settings, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Canonical directory being served.
    pub serve_path: PathBuf,
    pub port: u16,
    pub https_port: u16,
    pub disallow_listings: bool,
    pub email: Option<String>,
    pub token: Option<String>,
    pub site: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub allow_symlink: bool,
}

impl Args {
    /// Turns the command line into an [`Action`].
    ///
    /// Unless a DuckDNS or email flag is given, the saved config at
    /// `config_path` is the base and only explicitly given port, directory
    /// and listing flags override it.
    pub fn parse(matches: &ArgMatches, config_path: &Path) -> Result<Action> {
        match matches.subcommand() {
            Some(("adduser", sub)) => {
                return Ok(Action::AddUser {
                    name: required_string(sub, "name")?,
                    password: sub.get_one::<String>("password").cloned(),
                })
            }
            Some(("deluser", sub)) => {
                return Ok(Action::DelUser {
                    name: required_string(sub, "name")?,
                })
            }
            Some(("resetusers", _)) => return Ok(Action::ResetUsers),
            _ => {}
        }

        let mut config = Config::from_matches(matches);
        if matches.get_flag("save") {
            config.dir = canonicalize_dir(&config.dir)?;
            return Ok(Action::SaveConfig(config));
        }

        let uses_duck_dns = ["email", "token", "site"]
            .iter()
            .any(|name| is_explicit(matches, name));
        if !uses_duck_dns {
            let explicit = config;
            config = Config::load(config_path)?;
            if is_explicit(matches, "port") {
                config.server_port = explicit.server_port;
            }
            if is_explicit(matches, "dir") {
                config.dir = explicit.dir;
            }
            if is_explicit(matches, "disallow-listings") {
                config.disallow_listings = explicit.disallow_listings;
            }
            if is_explicit(matches, "https-port") {
                config.https_port = explicit.https_port;
            }
        }
        config.warn_incomplete_duck_dns();

        let non_empty = |v: String| if v.is_empty() { None } else { Some(v) };
        #[cfg(feature = "tls")]
        let (tls_cert, tls_key) = (
            matches.get_one::<PathBuf>("tls-cert").cloned(),
            matches.get_one::<PathBuf>("tls-key").cloned(),
        );
        #[cfg(not(feature = "tls"))]
        let (tls_cert, tls_key) = (None, None);

        let args = Args {
            serve_path: canonicalize_dir(&config.dir)?,
            port: config.server_port,
            https_port: config.https_port,
            disallow_listings: config.disallow_listings,
            email: non_empty(config.lets_encrypt_email),
            token: non_empty(config.duck_dns_token),
            site: non_empty(config.duck_dns_site),
            tls_cert,
            tls_key,
            allow_symlink: matches.get_flag("allow-symlink"),
        };
        Ok(Action::Serve(Box::new(args)))
    }

    /// DuckDNS site and token, when both are configured.
    pub fn duck_dns(&self) -> Option<(&str, &str)> {
        Some((self.site.as_deref()?, self.token.as_deref()?))
    }

    pub fn tls(&self) -> Option<(&Path, &Path)> {
        Some((self.tls_cert.as_deref()?, self.tls_key.as_deref()?))
    }
}

fn is_explicit(matches: &ArgMatches, name: &str) -> bool {
    matches!(
        matches.value_source(name),
        Some(ValueSource::CommandLine | ValueSource::EnvVariable)
    )
}

fn required_string(matches: &ArgMatches, name: &str) -> Result<String> {
    match matches.get_one::<String>(name) {
        Some(v) => Ok(v.clone()),
        None => bail!("Missing `{name}`"),
    }
}

fn canonicalize_dir(dir: &Path) -> Result<PathBuf> {
    let meta = fs::metadata(dir)
        .with_context(|| format!("Failed to access `{}`", dir.display()))?;
    if !meta.is_dir() {
        bail!("`{}` is not a directory", dir.display());
    }
    fs::canonicalize(dir).with_context(|| format!("Failed to resolve `{}`", dir.display()))
}
