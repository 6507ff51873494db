mod args;
mod auth;
mod ddns;
mod errors;
mod http_utils;
mod logger;
mod server;
mod utils;

#[macro_use]
extern crate log;

use crate::args::{build_cli, Action, Args, CONFIG_FILE_NAME};
use crate::auth::{UserStore, USERS_FILE_NAME};
use crate::server::Server;
#[cfg(feature = "tls")]
use crate::utils::{load_certs, load_private_key};
use crate::utils::config_dir;

use anyhow::{anyhow, bail, Context, Result};
use hyper::{body::Incoming, service::service_fn, Request};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
};
use std::io::{BufRead, IsTerminal};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(feature = "tls")]
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
#[cfg(feature = "tls")]
use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        handle_err(err)
    }
}

async fn run() -> Result<()> {
    let matches = build_cli().get_matches();
    logger::init(matches.get_one::<PathBuf>("log-file").cloned())
        .map_err(|e| anyhow!("Failed to init logger, {e}"))?;
    let config_dir = config_dir()?;
    let users_path = config_dir.join(USERS_FILE_NAME);

    match Args::parse(&matches, &config_dir.join(CONFIG_FILE_NAME))? {
        Action::Serve(args) => serve(*args, &users_path).await,
        Action::SaveConfig(config) => {
            let config_path = config_dir.join(CONFIG_FILE_NAME);
            info!("Saving configuration to {}", config_path.display());
            config.save(&config_path)?;
            if !config.duck_dns_token.is_empty() || !config.lets_encrypt_email.is_empty() {
                warn!("Any program able to read that file can now see your email and token");
            }
            println!("Saved configuration to {}", config_path.display());
            Ok(())
        }
        Action::AddUser { name, password } => {
            let password = match password {
                Some(v) => v,
                None => read_password()?,
            };
            let store = UserStore::load(&users_path)?;
            store.add_user(&name, &password)?;
            println!("Added user `{name}` to {}", store.path().display());
            Ok(())
        }
        Action::DelUser { name } => {
            let store = UserStore::load(&users_path)?;
            if !store.remove_user(&name)? {
                bail!("User `{name}` does not exist");
            }
            println!("Removed user `{name}`");
            Ok(())
        }
        Action::ResetUsers => {
            let store = UserStore::load(&users_path)?;
            let names = store.usernames();
            store.reset()?;
            match names.is_empty() {
                true => println!("No users to remove"),
                false => println!("Removed {}, authentication is disabled", names.join(", ")),
            }
            Ok(())
        }
    }
}

async fn serve(args: Args, users_path: &Path) -> Result<()> {
    let users = Arc::new(UserStore::load(users_path)?);
    if users.need_auth() {
        info!("Authentication required for {} user(s)", users.count());
    }
    info!("Serving files from {}", args.serve_path.display());

    if let Some((site, token)) = args.duck_dns() {
        info!("Checking in with DuckDNS");
        if let Err(err) = ddns::ping_duckdns(site, token).await {
            warn!("Error while telling DuckDNS our IP address: {err}");
        }
    }

    let port = args.port;
    #[cfg(feature = "tls")]
    let tls = match args.tls() {
        Some((cert, key)) => Some((tls_acceptor(cert, key)?, args.https_port)),
        None => None,
    };
    if args.email.is_some() && args.tls().is_none() {
        warn!("Automatic certificates are not supported, pass --tls-cert and --tls-key to serve HTTPS");
    }

    let shutdown = CancellationToken::new();
    let server = Arc::new(Server::init(args, users, shutdown.clone()));
    let mut handles: Vec<JoinHandle<()>> = vec![];

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = create_listener(addr).with_context(|| format!("Failed to bind `{addr}`"))?;
    handles.push(tokio::spawn(accept_http(listener, server.clone())));
    match external_ip() {
        Some(ip) => info!("Local HTTP server listening on http://{ip}:{port}"),
        None => info!("Local HTTP server listening on port {port}"),
    }

    #[cfg(feature = "tls")]
    {
        if let Some((acceptor, https_port)) = tls {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), https_port);
            let listener =
                create_listener(addr).with_context(|| format!("Failed to bind `{addr}`"))?;
            handles.push(tokio::spawn(accept_https(listener, acceptor, server.clone())));
            match server.args().site.as_deref() {
                Some(site) => info!("HTTPS server listening on port {https_port} for {site}.duckdns.org"),
                None => info!("HTTPS server listening on port {https_port}"),
            }
        }
    }

    shutdown_signal().await;
    info!("Shutting down");
    shutdown.cancel();
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn accept_http(listener: TcpListener, server: Arc<Server>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                debug!("Failed to accept connection, {err}");
                continue;
            }
        };
        let stream = TokioIo::new(stream);
        tokio::spawn(handle_stream(server.clone(), stream, Some(addr)));
    }
}

#[cfg(feature = "tls")]
async fn accept_https(listener: TcpListener, acceptor: TlsAcceptor, server: Arc<Server>) {
    let handshake_timeout = Duration::from_secs(10);
    loop {
        let Ok((stream, addr)) = listener.accept().await else {
            continue;
        };
        let acceptor = acceptor.clone();
        let server = server.clone();
        tokio::spawn(async move {
            let Some(stream) = tokio::time::timeout(handshake_timeout, acceptor.accept(stream))
                .await
                .ok()
                .and_then(|v| v.ok())
            else {
                return;
            };
            handle_stream(server, TokioIo::new(stream), Some(addr)).await;
        });
    }
}

async fn handle_stream<T>(server: Arc<Server>, stream: TokioIo<T>, addr: Option<SocketAddr>)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let hyper_service =
        service_fn(move |request: Request<Incoming>| server.clone().call(request, addr));

    if let Err(err) = Builder::new(TokioExecutor::new())
        .serve_connection(stream, hyper_service)
        .await
    {
        debug!("Connection closed with error, {err}");
    }
}

fn create_listener(addr: SocketAddr) -> Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024 /* Default backlog */)?;
    let std_listener = StdTcpListener::from(socket);
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;
    Ok(listener)
}

#[cfg(feature = "tls")]
fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid certificate or key")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// First IPv4 address of a non-loopback interface.
fn external_ip() -> Option<Ipv4Addr> {
    if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
}

fn read_password() -> Result<String> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        eprint!("Password: ");
    }
    let mut line = String::new();
    stdin
        .lock()
        .read_line(&mut line)
        .context("Failed to read the password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(password.to_string())
}

fn handle_err<T>(err: anyhow::Error) -> T {
    eprintln!("Error: {err:#}");
    std::process::exit(1);
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to install CTRL+C signal handler, {err}");
        std::future::pending::<()>().await;
    }
}
