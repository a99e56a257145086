//! The single-threaded cooperative event loop (spec §4.5), translated
//! from the C reference's hand-rolled `poll()` loop onto a current-thread
//! Tokio runtime: `tokio::select!` replaces the manual fd-set dispatch,
//! `tokio::time::sleep_until` replaces the soonest-deadline arithmetic,
//! and [`kad_events::TimerWheel`] replaces the `struct timer` list.
//!
//! All state mutation happens on this one task. TCP peer connections are
//! handled on a [`tokio::task::LocalSet`] so they can run concurrently
//! without `Send`, but each peer task only ever touches its own socket and
//! [`kad_events::PeerFrameParser`] -- never [`DaemonState`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::task::LocalSet;
use tokio::time::Instant;

use kad_proto::message::{Method, TxId};
use kad_rpc::dispatcher::{DispatchOutcome, LookupNotification};
use kad_events::{PeerFrameParser, TimerWheel};

use crate::config::DaemonConfig;
use crate::state::DaemonState;

const MAX_DATAGRAM: usize = 1400;
const REFRESH_PERIOD: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
enum TimerPayload {
    LookupRefresh,
    ProbeTimeout(TxId),
}

/// Drive the node until a shutdown signal arrives, then persist routing
/// state and return.
pub async fn run(config: &DaemonConfig, mut state: DaemonState) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = format!("{}:{}", config.bind_addr, config.bind_port).parse()?;
    let udp = UdpSocket::bind(bind_addr).await?;
    let tcp = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "listening");

    let local = LocalSet::new();
    let mut timers: TimerWheel<TimerPayload> = TimerWheel::new();
    let now = Instant::now();
    timers.schedule_periodic("lookup-refresh", REFRESH_PERIOD, now, TimerPayload::LookupRefresh);

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut shutdown = std::pin::pin!(shutdown_signal());

    local
        .run_until(async {
            loop {
                let deadline = timers.soonest_deadline().unwrap_or_else(|| Instant::now() + REFRESH_PERIOD);
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        fire_timers(&udp, &mut state, &mut timers).await;
                    }
                    recv = udp.recv_from(&mut buf) => {
                        match recv {
                            Ok((len, source)) => handle_datagram(&udp, &mut state, &mut timers, source, &buf[..len]).await,
                            Err(err) => tracing::warn!(%err, "udp recv error"),
                        }
                    }
                    accepted = tcp.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                tracing::debug!(%peer_addr, "peer connection accepted");
                                tokio::task::spawn_local(handle_peer_connection(stream));
                            }
                            Err(err) => tracing::warn!(%err, "tcp accept error"),
                        }
                    }
                    _ = &mut shutdown => {
                        tracing::info!("shutdown signal received");
                        break;
                    }
                }
            }
        })
        .await;

    state.persist(&config.routes_path())?;
    tracing::info!("routing state persisted, daemon stopped");
    Ok(())
}

async fn handle_datagram(
    udp: &UdpSocket,
    state: &mut DaemonState,
    timers: &mut TimerWheel<TimerPayload>,
    source: SocketAddr,
    bytes: &[u8],
) {
    let now = monotonic_secs();
    let outcome = state
        .dispatcher
        .handle(source, bytes, &mut state.routing_table, &mut state.in_flight, now);
    match outcome {
        DispatchOutcome::Reply(reply) => {
            if let Err(err) = udp.send_to(&reply, source).await {
                tracing::warn!(%err, %source, "failed to send reply");
            }
        }
        DispatchOutcome::Correlated(notification) => {
            let (responder, new_candidates) = match notification {
                LookupNotification::PingReply { responder, .. } => (responder, Vec::new()),
                LookupNotification::FindNodeReply { responder, nodes, .. } => (responder, nodes),
            };
            if let Some(lookup) = state.lookup.as_mut() {
                lookup.on_response(responder, new_candidates, &mut state.routing_table);
                advance_lookup(udp, state, timers).await;
            }
        }
        DispatchOutcome::Dropped => {}
    }
}

/// Issue the next round's queries for the active lookup, if any, and drop
/// it once converged.
async fn advance_lookup(udp: &UdpSocket, state: &mut DaemonState, timers: &mut TimerWheel<TimerPayload>) {
    let Some(lookup) = state.lookup.as_mut() else {
        return;
    };
    let target = lookup.target();
    let batch = lookup.progress();
    let now = monotonic_secs();

    for dest in batch {
        let Some((tx_id, bytes)) = state.dispatcher.compose_query(&dest, Method::FindNode, Some(target), &mut state.in_flight, now) else {
            continue;
        };
        if let Err(err) = udp.send_to(&bytes, dest.addr).await {
            tracing::warn!(%err, addr = %dest.addr, "failed to send query");
            continue;
        }
        timers.schedule_once("probe-timeout", PROBE_TIMEOUT, Instant::now(), TimerPayload::ProbeTimeout(tx_id));
    }

    if state.lookup.as_ref().is_some_and(|l| l.is_done()) {
        if let Some(lookup) = state.lookup.take() {
            tracing::debug!(found = lookup.results().len(), "lookup converged");
        }
    }
}

async fn fire_timers(udp: &UdpSocket, state: &mut DaemonState, timers: &mut TimerWheel<TimerPayload>) {
    let fired = timers.expire(Instant::now());
    for (_name, payload) in fired {
        match payload {
            TimerPayload::LookupRefresh => {
                if state.lookup.is_none() {
                    state.start_lookup(state.self_id);
                    advance_lookup(udp, state, timers).await;
                }
            }
            TimerPayload::ProbeTimeout(tx_id) => {
                if let Some(query) = state.in_flight.remove(&tx_id) {
                    state.routing_table.mark_stale(&query.dest_id);
                    if let Some(lookup) = state.lookup.as_mut() {
                        lookup.on_timeout(query.dest_id);
                        advance_lookup(udp, state, timers).await;
                    }
                }
            }
        }
    }
}

async fn handle_peer_connection(mut stream: tokio::net::TcpStream) {
    use tokio::io::AsyncReadExt;

    let mut parser = PeerFrameParser::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => match parser.feed(&buf[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        tracing::debug!(tag = ?frame.tag, len = frame.payload.len(), "inert peer frame");
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "closing peer connection");
                    break;
                }
            },
            Err(err) => {
                tracing::debug!(%err, "peer connection read error");
                break;
            }
        }
    }
}

fn monotonic_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Resolves once any of SIGINT/SIGTERM/SIGHUP/SIGQUIT arrives (spec §4.5).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("registering a SIGTERM handler should not fail");
        let mut hup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("registering a SIGHUP handler should not fail");
        let mut quit = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit())
            .expect("registering a SIGQUIT handler should not fail");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
            _ = hup.recv() => {}
            _ = quit.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
