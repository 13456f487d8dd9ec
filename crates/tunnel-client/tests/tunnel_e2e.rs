#![cfg(feature = "tunnel-tests")]

//! End-to-end runs against an in-process russh server that plays the remote
//! client by opening forwarded-tcpip channels back to the tunnel.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use russh::{
    Channel, ChannelMsg, MethodKind, MethodSet, client,
    keys::{Algorithm, PrivateKey, ssh_key::rand_core::OsRng},
    server::{self, Auth, Server as _, Session},
};
use secrecy::SecretString;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tunnel_client::{
    ClientError,
    channel::RusshChannel,
    hostkeys::{ClientHandler, HostKeyCheck},
    listener::start_forward_listener,
    run_tunnel,
};
use tunnel_core::{
    IoMode,
    relay::{ChannelRead, SecureChannel, StatusKind, StopReason},
};
use tunnel_types::{AuthOverride, Endpoint, KeyPaths, RelaySettings, TunnelConfig};

const ASSIGNED_PORT: u32 = 4567;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwarded_ping_is_echoed_by_local_service() -> Result<()> {
    let observed = Observed::default();
    let (ssh_port, server) = spawn_server(observed.clone(), methods(&[MethodKind::Password]), RemotePeer::Ping).await?;
    let local_port = spawn_prefix_echo("ECHO:").await?;

    let config = tunnel_config(ssh_port, local_port, None);
    let (_tx, rx) = watch::channel(false);
    let summary = tokio::time::timeout(Duration::from_secs(10), run_tunnel(&config, rx)).await??;

    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.statuses, vec![StatusKind::RemoteEof]);
    assert_eq!(summary.stop, StopReason::LimitReached);
    assert_eq!(observed.received(), b"ECHO:PING");
    assert_eq!(observed.forwards(), vec![("localhost".to_string(), 0)]);

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_without_usable_methods_is_refused() -> Result<()> {
    let observed = Observed::default();
    let (ssh_port, server) = spawn_server(observed.clone(), methods(&[MethodKind::KeyboardInteractive]), RemotePeer::Ping).await?;

    let config = tunnel_config(ssh_port, 9, Some(AuthOverride::Password));
    let (_tx, rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(10), run_tunnel(&config, rx)).await?;

    assert!(matches!(result, Err(ClientError::AuthFailed(ref msg)) if msg.contains("no supported authentication methods")));
    assert!(observed.forwards().is_empty(), "no listener before authentication");

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pinned_fingerprint_mismatch_aborts_before_auth() -> Result<()> {
    let observed = Observed::default();
    let (ssh_port, server) = spawn_server(observed.clone(), methods(&[MethodKind::Password]), RemotePeer::Ping).await?;

    let mut config = tunnel_config(ssh_port, 9, None);
    config.expected_fingerprint = Some("00".repeat(20));
    let (_tx, rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(10), run_tunnel(&config, rx)).await?;

    assert!(
        matches!(result, Err(ClientError::HostKeyFailed(_)) | Err(ClientError::Ssh(russh::Error::UnknownKey))),
        "unexpected result {:?}",
        result.err()
    );
    assert_eq!(observed.auth_attempts(), 0);

    server.abort();
    Ok(())
}

/// Both ends of one forwarded channel, driven directly by the test.
struct DirectChannel {
    channel: RusshChannel,
    remote: Channel<server::Msg>,
    mode: IoMode,
    _session: client::Handle<ClientHandler>,
    server: JoinHandle<()>,
}

async fn open_direct_channel() -> Result<DirectChannel> {
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    let (ssh_port, server) = spawn_server(Observed::default(), methods(&[MethodKind::Password]), RemotePeer::Handoff(peer_tx)).await?;

    let (forwarded_tx, mut forwarded_rx) = mpsc::unbounded_channel();
    let handler = ClientHandler::new(HostKeyCheck::new(None)?, forwarded_tx);
    let mut session = client::connect(Arc::new(client::Config::default()), ("127.0.0.1", ssh_port), handler).await?;
    let auth = session.authenticate_password("tester", "secret").await?;
    assert!(auth.success());
    start_forward_listener(&mut session, "localhost", 0).await?;

    let forwarded = tokio::time::timeout(Duration::from_secs(5), forwarded_rx.recv())
        .await?
        .context("no forwarded channel reached the client")?;
    let remote = tokio::time::timeout(Duration::from_secs(5), peer_rx.recv())
        .await?
        .context("server never opened the forwarded channel")?;

    let mode = IoMode::new();
    Ok(DirectChannel {
        channel: RusshChannel::new(forwarded.channel, mode.clone()),
        remote,
        mode,
        _session: session,
        server,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_message_is_served_across_reads() -> Result<()> {
    let mut direct = open_direct_channel().await?;
    direct.remote.data(&b"0123456789"[..]).await?;

    let mut buf = [0u8; 4];
    let mut collected = Vec::new();
    for expected in [4, 4, 2] {
        let read = tokio::time::timeout(Duration::from_secs(5), direct.channel.read(&mut buf)).await??;
        assert_eq!(read, ChannelRead::Data(expected));
        collected.extend_from_slice(&buf[..expected]);
        assert!(!direct.channel.at_remote_eof());
    }
    assert_eq!(collected, b"0123456789");

    direct.server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_eof_is_visible_with_the_last_chunk() -> Result<()> {
    let mut direct = open_direct_channel().await?;
    direct.remote.data(&b"last"[..]).await?;
    direct.remote.eof().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let scope = direct.mode.enter_non_blocking()?;
    let mut buf = [0u8; 16];
    assert_eq!(direct.channel.read(&mut buf).await?, ChannelRead::Data(4));
    assert_eq!(&buf[..4], b"last");
    assert!(direct.channel.at_remote_eof());
    assert_eq!(direct.channel.read(&mut buf).await?, ChannelRead::Eof);
    drop(scope);

    direct.channel.close().await?;
    direct.channel.close().await?;
    assert!(direct.mode.is_blocking());

    direct.server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_blocking_read_without_data_would_block() -> Result<()> {
    let mut direct = open_direct_channel().await?;
    let scope = direct.mode.enter_non_blocking()?;
    let mut buf = [0u8; 16];

    assert_eq!(direct.channel.read(&mut buf).await?, ChannelRead::WouldBlock);
    assert!(!direct.channel.at_remote_eof());

    direct.remote.data(&b"late"[..]).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(direct.channel.read(&mut buf).await?, ChannelRead::Data(4));
    assert_eq!(&buf[..4], b"late");

    scope.exit();
    assert!(direct.mode.is_blocking());

    direct.server.abort();
    Ok(())
}

fn tunnel_config(ssh_port: u16, local_port: u16, auth_override: Option<AuthOverride>) -> TunnelConfig {
    TunnelConfig {
        server: Endpoint::new("127.0.0.1", ssh_port),
        username: "tester".into(),
        password: SecretString::from("secret"),
        remote_bind: Endpoint::new("localhost", 0),
        local_target: Endpoint::new("127.0.0.1", local_port),
        auth_override,
        keys: KeyPaths {
            public_key: PathBuf::from("/nonexistent/id_rsa.pub"),
            private_key: PathBuf::from("/nonexistent/id_rsa"),
        },
        expected_fingerprint: None,
        relay: RelaySettings {
            poll_interval: Duration::from_millis(20),
            ..RelaySettings::default()
        },
        max_connections: Some(1),
        insecure: false,
        keepalive_interval: None,
    }
}

fn methods(kinds: &[MethodKind]) -> MethodSet {
    let mut set = MethodSet::empty();
    for kind in kinds.iter().cloned() {
        set.push(kind);
    }
    set
}

async fn spawn_server(observed: Observed, methods: MethodSet, peer: RemotePeer) -> Result<(u16, JoinHandle<()>)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    let mut config = server::Config {
        auth_rejection_time: Duration::from_millis(50),
        auth_rejection_time_initial: Some(Duration::from_millis(0)),
        methods,
        ..Default::default()
    };
    config.keys.push(PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?);
    let config = Arc::new(config);

    let mut server = TunnelServer { observed, peer };
    let task = tokio::spawn(async move {
        let _ = server.run_on_socket(config, &listener).await;
    });
    Ok((port, task))
}

async fn spawn_prefix_echo(prefix: &'static str) -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(len) = stream.read(&mut buf).await {
                    if len == 0 {
                        break;
                    }
                    let mut reply = prefix.as_bytes().to_vec();
                    reply.extend_from_slice(&buf[..len]);
                    if stream.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok(port)
}

#[derive(Clone, Default)]
struct Observed {
    state: Arc<Mutex<ObservedState>>,
}

#[derive(Default)]
struct ObservedState {
    received: Vec<u8>,
    forwards: Vec<(String, u32)>,
    auth_attempts: usize,
}

impl Observed {
    fn received(&self) -> Vec<u8> {
        self.state.lock().unwrap().received.clone()
    }

    fn forwards(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().forwards.clone()
    }

    fn auth_attempts(&self) -> usize {
        self.state.lock().unwrap().auth_attempts
    }
}

/// What the server does with a forwarded channel once the client accepts it.
#[derive(Clone)]
enum RemotePeer {
    /// Send PING, wait for the echo, hang up.
    Ping,
    /// Hand the channel to the test.
    Handoff(mpsc::UnboundedSender<Channel<server::Msg>>),
}

struct TunnelServer {
    observed: Observed,
    peer: RemotePeer,
}

impl server::Server for TunnelServer {
    type Handler = TunnelHandler;

    fn new_client(&mut self, _addr: Option<std::net::SocketAddr>) -> Self::Handler {
        TunnelHandler {
            observed: self.observed.clone(),
            peer: self.peer.clone(),
        }
    }
}

struct TunnelHandler {
    observed: Observed,
    peer: RemotePeer,
}

/// Remote client side of one forwarded connection: send PING, wait for the echo, hang up.
async fn play_remote_client(channel: Channel<server::Msg>, observed: Observed) -> Result<()> {
    let mut channel = channel;
    channel.data(&b"PING"[..]).await?;
    let expected = b"ECHO:PING";
    while observed.received().len() < expected.len() {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => observed.state.lock().unwrap().received.extend_from_slice(&data),
            Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    channel.eof().await?;
    channel.close().await?;
    Ok(())
}

impl server::Handler for TunnelHandler {
    type Error = anyhow::Error;

    fn auth_password(&mut self, _user: &str, password: &str) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        self.observed.state.lock().unwrap().auth_attempts += 1;
        let accept = password == "secret";
        async move {
            if accept {
                Ok(Auth::Accept)
            } else {
                Ok(Auth::reject())
            }
        }
    }

    fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        self.observed.state.lock().unwrap().forwards.push((address.to_string(), *port));
        if *port == 0 {
            *port = ASSIGNED_PORT;
        }
        let bound_address = address.to_string();
        let bound_port = *port;
        let handle = session.handle();
        let observed = self.observed.clone();
        let peer = self.peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let Ok(channel) = handle
                .channel_open_forwarded_tcpip(bound_address, bound_port, "203.0.113.9", 50123)
                .await
            else {
                return;
            };
            match peer {
                RemotePeer::Ping => {
                    let _ = play_remote_client(channel, observed).await;
                }
                RemotePeer::Handoff(sender) => {
                    let _ = sender.send(channel);
                }
            }
        });
        async { Ok(true) }
    }
}
