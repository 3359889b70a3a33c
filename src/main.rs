/**
 * MIT License
 *
 * Copyright (c) 2025 Takatoshi Kondo
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use clap::Parser;
use mqtt_engine_tokio::tracing_setup::init_tracing;
use mqtt_engine_tokio::transport::TcpChannel;
use mqtt_engine_tokio::{ProtocolConfig, Qos, Server};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, trace};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "mqtt-broker")]
#[command(about = "MQTT 3.1.1 broker with ordered per-client packet dispatch")]
struct Args {
    /// Number of worker threads for async tasks
    #[arg(long)]
    worker_threads: Option<usize>,

    /// Number of blocking threads for blocking operations
    #[arg(long)]
    max_blocking_threads: Option<usize>,

    /// Enable thread keep alive for worker threads
    #[arg(long)]
    thread_keep_alive: Option<bool>,

    /// Thread stack size in bytes
    #[arg(long)]
    thread_stack_size: Option<usize>,

    /// Global queue interval for work stealing (microseconds)
    #[arg(long)]
    global_queue_interval: Option<u32>,

    /// Event loop interval for polling (microseconds)
    #[arg(long)]
    event_interval: Option<u32>,

    /// Log level
    #[arg(long, default_value = "info")]
    #[arg(value_parser = ["error", "warn", "info", "debug", "trace"])]
    log_level: String,

    #[arg(long, default_value_t = 1883)]
    tcp_port: u16,

    /// Enable TCP_NODELAY socket option
    #[arg(long)]
    socket_no_delay: Option<bool>,

    /// TCP socket send buffer size in bytes
    #[arg(long)]
    socket_send_buf_size: Option<usize>,

    /// TCP socket receive buffer size in bytes
    #[arg(long)]
    socket_recv_buf_size: Option<usize>,

    /// Enable SO_REUSEPORT on the listening socket (unix only)
    #[arg(long)]
    socket_reuseport: Option<bool>,

    /// TCP keepalive time in seconds (0 to disable)
    #[arg(long)]
    socket_keepalive_time: Option<u32>,

    /// Highest QoS the broker delivers with
    #[arg(long, default_value_t = 2)]
    #[arg(value_parser = clap::value_parser!(u8).range(0..=2))]
    maximum_qos: u8,

    /// Retransmission interval in milliseconds
    #[arg(long, default_value_t = 5000)]
    wait_timeout_ms: u64,

    /// Retransmissions before giving up on an acknowledgement (unbounded if omitted)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Largest accepted packet in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Reject topic filters containing wildcards
    #[arg(long, default_value_t = false)]
    no_wildcards: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Parse log level
    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => unreachable!(), // clap validates this
    };

    let worker_threads = args.worker_threads.unwrap_or_else(num_cpus::get);

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.worker_threads(worker_threads).enable_all();

    if let Some(max_blocking) = args.max_blocking_threads {
        runtime_builder.max_blocking_threads(max_blocking);
    }

    if let Some(keep_alive) = args.thread_keep_alive {
        runtime_builder.thread_keep_alive(Duration::from_secs(if keep_alive { 10 } else { 0 }));
    }

    if let Some(stack_size) = args.thread_stack_size {
        runtime_builder.thread_stack_size(stack_size);
    }

    if let Some(interval) = args.global_queue_interval {
        runtime_builder.global_queue_interval(interval);
    }

    if let Some(interval) = args.event_interval {
        runtime_builder.event_interval(interval);
    }

    let runtime = runtime_builder.build()?;

    runtime.block_on(async_main(log_level, worker_threads, args))
}

fn protocol_config(args: &Args) -> anyhow::Result<ProtocolConfig> {
    let maximum_qos = Qos::try_from(args.maximum_qos)
        .map_err(|e| anyhow::anyhow!("Invalid --maximum-qos {}: {e}", args.maximum_qos))?;
    let mut config = ProtocolConfig::default()
        .with_maximum_qos(maximum_qos)
        .with_wait_timeout(Duration::from_millis(args.wait_timeout_ms))
        .with_max_retries(args.max_retries)
        .with_allow_wildcards(!args.no_wildcards);
    if let Some(size) = args.max_packet_size {
        config = config.with_max_packet_size(size);
    }
    Ok(config)
}

/// Bind the listening socket with SO_REUSEADDR and optionally SO_REUSEPORT
fn bind_listener(port: u16, reuseport: bool) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| anyhow::anyhow!("Failed to set SO_REUSEADDR: {e}"))?;

    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    if reuseport {
        socket
            .set_reuse_port(true)
            .map_err(|e| anyhow::anyhow!("Failed to set SO_REUSEPORT: {e}"))?;
    }
    #[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
    if reuseport {
        tracing::warn!("SO_REUSEPORT is not supported on this platform");
    }

    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}"))?;
    socket.listen(1024)?;

    Ok(TcpListener::from_std(socket.into())?)
}

/// Configure individual socket options if specified
fn configure_individual_socket_options(stream: &TcpStream, addr: &SocketAddr, args: &Args) {
    if let Some(no_delay) = args.socket_no_delay {
        if let Err(e) = stream.set_nodelay(no_delay) {
            error!("Failed to set TCP_NODELAY for {addr}: {e}");
        }
    }

    let sock_ref = SockRef::from(stream);

    if let Some(send_buf_size) = args.socket_send_buf_size.filter(|size| *size > 0) {
        if let Err(e) = sock_ref.set_send_buffer_size(send_buf_size) {
            error!("Failed to set send buffer size for {addr}: {e}");
        }
    }

    if let Some(recv_buf_size) = args.socket_recv_buf_size.filter(|size| *size > 0) {
        if let Err(e) = sock_ref.set_recv_buffer_size(recv_buf_size) {
            error!("Failed to set recv buffer size for {addr}: {e}");
        }
    }

    if let Some(keepalive_time) = args.socket_keepalive_time.filter(|secs| *secs > 0) {
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(keepalive_time.into()));
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            error!("Failed to enable keepalive for {addr}: {e}");
        }
    }
}

fn or_none<T: ToString>(value: Option<T>) -> String {
    value.map_or("None".to_string(), |v| v.to_string())
}

async fn async_main(log_level: tracing::Level, threads: usize, args: Args) -> anyhow::Result<()> {
    let _guard = init_tracing(log_level)?;

    info!("Starting MQTT Broker with log level: {log_level}");
    info!("Tokio runtime configuration:");
    info!("  --worker-threads        {threads}");
    info!("  --max-blocking-threads  {}", or_none(args.max_blocking_threads));
    info!("  --thread-keep-alive     {}", or_none(args.thread_keep_alive));
    info!("  --thread-stack-size     {}", or_none(args.thread_stack_size));
    info!("  --global-queue-interval {}", or_none(args.global_queue_interval));
    info!("  --event-interval        {}", or_none(args.event_interval));
    info!("Socket configuration:");
    info!("  --socket-no-delay       {}", or_none(args.socket_no_delay));
    info!("  --socket-send-buf-size  {}", or_none(args.socket_send_buf_size));
    info!("  --socket-recv-buf-size  {}", or_none(args.socket_recv_buf_size));
    info!("  --socket-reuseport      {}", or_none(args.socket_reuseport));
    info!("  --socket-keepalive-time {}", or_none(args.socket_keepalive_time));

    let config = protocol_config(&args)?;
    info!("Protocol configuration:");
    info!("  --maximum-qos           {:?}", config.maximum_qos);
    info!("  --wait-timeout-ms       {}", config.wait_timeout.as_millis());
    info!("  --max-retries           {}", or_none(config.max_retries));
    info!("  --max-packet-size       {}", config.max_packet_size);

    let max_packet_size = config.max_packet_size;
    let server = Server::new(config);

    let port = args.tcp_port;
    info!("Starting TCP listener on port {port}");
    let tcp_listener = bind_listener(port, args.socket_reuseport.unwrap_or(false))?;
    info!("Listening on TCP port {port} for MQTT");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {e}");
                }
                break;
            }
            accepted = tcp_listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    trace!("New TCP connection from: {addr}");
                    configure_individual_socket_options(&stream, &addr, &args);
                    server.accept(TcpChannel::new(stream, max_packet_size));
                }
                Err(e) => error!("Failed to accept TCP connection: {e}"),
            }
        }
    }

    info!("Shutting down");
    server.stop().await;
    Ok(())
}
