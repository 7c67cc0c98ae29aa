use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::process::ExitCode;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand};
use relay::protocol::expected_nonce;
use relay::server::DEFAULT_MAGIC_COOKIE;
use relay::{RegisterRequest, RegisterResponse, RejectReason, Server, ServerConfig};

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    about = "RTSP relay registration server and test unit"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay registration server
    Serve(ServeArgs),
    /// Register as a unit against a running relay
    Register(RegisterArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Local IP every endpoint binds to
    #[arg(long, default_value = "0.0.0.0")]
    listen_ip: IpAddr,
    /// Registration listen port
    #[arg(long, default_value_t = 5070)]
    register_port: u16,
    /// Control-channel listen port shared by all sessions
    #[arg(long, default_value_t = 8554)]
    control_port: u16,
    /// Fixed RTCP port (default: one port per session from the pool)
    #[arg(long)]
    rtcp_port: Option<u16>,
    /// First port of the managed pool
    #[arg(long, default_value_t = 20000)]
    port_min: u16,
    /// Last port of the managed pool
    #[arg(long, default_value_t = 20999)]
    port_max: u16,
    /// Realm announced to units
    #[arg(long, default_value = "rtsp-relay")]
    realm: String,
    /// Shared secret used to derive the nonce
    #[arg(long)]
    hash_key: String,
    /// Magic cookie (hex)
    #[arg(long, value_parser = parse_hex_u32)]
    magic_cookie: Option<u32>,
    /// Close sessions idle for this many seconds
    #[arg(long)]
    session_timeout: Option<u64>,
    /// Worker threads handling registration datagrams
    #[arg(long, default_value_t = 8)]
    workers: usize,
}

#[derive(Args)]
struct RegisterArgs {
    /// Relay registration address (host:port)
    #[arg(long, short, default_value = "127.0.0.1:5070")]
    server: SocketAddr,
    /// Unit id to register
    #[arg(long)]
    unit_id: String,
    /// Realm used to derive the nonce
    #[arg(long, default_value = "rtsp-relay")]
    realm: String,
    /// Shared secret used to derive the nonce
    #[arg(long)]
    hash_key: String,
    /// Magic cookie (hex)
    #[arg(long, value_parser = parse_hex_u32)]
    magic_cookie: Option<u32>,
    /// Seconds to wait for each response
    #[arg(long, default_value_t = 2)]
    timeout: u64,
}

fn parse_hex_u32(value: &str) -> Result<u32, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value {value}: {e}"))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve(args) => serve(args),
        Command::Register(args) => register(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig {
        magic_cookie: args.magic_cookie.unwrap_or(DEFAULT_MAGIC_COOKIE),
        realm: args.realm,
        hash_key: args.hash_key,
        listen_ip: args.listen_ip,
        control_port: args.control_port,
        register_port: args.register_port,
        rtcp_port: args.rtcp_port,
        port_range: args.port_min..=args.port_max,
        session_timeout: args.session_timeout.map(Duration::from_secs),
        workers: args.workers,
    };

    let mut server = Server::new(config);
    server.start()?;

    println!(
        "relay registration on {} (press Enter to stop)",
        server.local_addr()?
    );
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    server.stop();
    Ok(())
}

/// Run the two-step handshake as a unit.
fn register(args: RegisterArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cookie = args.magic_cookie.unwrap_or(DEFAULT_MAGIC_COOKIE);
    let bind_ip: IpAddr = if args.server.is_ipv4() {
        "0.0.0.0".parse()?
    } else {
        "::".parse()?
    };
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))?;
    socket.set_read_timeout(Some(Duration::from_secs(args.timeout)))?;
    let listen_port = socket.local_addr()?.port();

    let first = RegisterRequest::register(cookie, &args.unit_id, listen_port)
        .with_sequence(1)
        .with_timestamp(now_millis());
    let response = exchange(&socket, args.server, &first, cookie)?;
    report(&response);

    if response.reject_reason() != Some(RejectReason::NotAuthorized) {
        return Ok(());
    }

    let nonce = expected_nonce(&args.realm, &args.hash_key);
    let second = RegisterRequest::register(cookie, &args.unit_id, listen_port)
        .with_nonce(&nonce)
        .with_sequence(2)
        .with_timestamp(now_millis());
    let response = exchange(&socket, args.server, &second, cookie)?;
    report(&response);

    if !response.is_success() {
        return Err(format!("registration of {} refused", args.unit_id).into());
    }
    Ok(())
}

fn exchange(
    socket: &UdpSocket,
    server: SocketAddr,
    request: &RegisterRequest,
    cookie: u32,
) -> Result<RegisterResponse, Box<dyn std::error::Error>> {
    tracing::debug!(%server, unit_id = %request.unit_id, seq = request.header.sequence, "sending registration");
    socket.send_to(&request.serialize(), server)?;
    let mut buf = [0u8; 2048];
    let (len, _) = socket.recv_from(&mut buf)?;
    Ok(RegisterResponse::parse(&buf[..len], cookie)?)
}

fn report(response: &RegisterResponse) {
    match &response.reason {
        Some(reason) => println!(
            "seq={} realm={} status={} reason={}",
            response.header.sequence, response.realm, response.status, reason
        ),
        None => println!(
            "seq={} realm={} status={}",
            response.header.sequence, response.realm, response.status
        ),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
