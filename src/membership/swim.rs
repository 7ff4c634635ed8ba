// SWIM Protocol Engine
//
// The top-level actor owning the local member record, the membership table,
// the disseminator, the pending-probe map, and the suspicion timers. Three
// long-running tasks drive the protocol:
//
// - probe loop: one round-robin target per protocol period; direct ping,
//   then indirect ping-req fan-out, then suspicion
// - receive loop: ingests gossip and dispatches inbound messages
// - suspicion dispatcher: escalates confirmed expiries to dead
//
// plus transient tasks for proxying indirect probes on behalf of peers.
//
// Every state mutation runs inside one tokio mutex so the conflict
// resolution rules execute atomically; sends, sleeps, and probe waits
// happen outside it. Events are emitted while the lock is held, so all
// subscribers observe transitions in commit order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::error::{ErrorKind, Result, SwimError};
use crate::membership::suspicion::{SuspicionExpiry, SuspicionTimers};
use crate::membership::table::{Change, MembershipTable};
use crate::membership::{
    Disseminator, Member, MemberId, MemberStatus, MembershipEvent, SwimConfig,
};
use crate::protocol::Message;
use crate::transport::Transport;

/// Interval at which probe waiters poll their pending entry.
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Number of alive members sampled for the leave announcement.
const LEAVE_FANOUT: usize = 3;

/// A probe awaiting its ack. Holds only a MemberId copy, never a table
/// reference; removed by the waiter that owns it.
struct PendingProbe {
    target: MemberId,
    started_at: Instant,
    ack_seen: bool,
    indirect: bool,
    requester: Option<MemberId>,
}

impl PendingProbe {
    fn direct(target: MemberId) -> Self {
        Self {
            target,
            started_at: Instant::now(),
            ack_seen: false,
            indirect: false,
            requester: None,
        }
    }

    fn proxied(target: MemberId, requester: MemberId) -> Self {
        Self {
            target,
            started_at: Instant::now(),
            ack_seen: false,
            indirect: true,
            requester: Some(requester),
        }
    }
}

/// Engine state behind the serialisation point.
struct SwimState {
    table: MembershipTable,
    gossip: Disseminator,
    suspicion: SuspicionTimers,
    pending: HashMap<u64, PendingProbe>,
    indirect_tasks: Vec<JoinHandle<()>>,
    local: Member,
    sequence: u64,
    stopped: bool,
}

impl SwimState {
    fn next_seq(&mut self) -> u64 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    fn gossip_payload(&mut self) -> Vec<Member> {
        let member_count = self.table.len();
        self.gossip.payload_for_message(member_count)
    }
}

/// Everything a protocol task needs; cheap to clone into spawned tasks.
#[derive(Clone)]
struct EngineCtx {
    local_id: MemberId,
    config: SwimConfig,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<SwimState>>,
    events: broadcast::Sender<MembershipEvent>,
    shutdown: watch::Receiver<bool>,
}

impl EngineCtx {
    fn emit(&self, state: &SwimState, event: MembershipEvent) {
        if state.stopped {
            return;
        }
        // broadcast drops the oldest buffered event for lagging subscribers
        let _ = self.events.send(event);
    }

    /// Translate a committed table change into bookkeeping and an event.
    fn apply_change(&self, state: &mut SwimState, change: Change) {
        match change {
            Change::Joined(member) => {
                tracing::debug!(member = %member.id, status = %member.status, "member joined");
                self.emit(state, MembershipEvent::Joined(member));
            }
            Change::StatusChanged(member, from) => match member.status {
                MemberStatus::Suspect => {
                    tracing::warn!(member = %member.id, incarnation = member.incarnation, "member suspected");
                    self.emit(state, MembershipEvent::Suspected(member));
                }
                MemberStatus::Dead => {
                    state.suspicion.cancel(&member.id);
                    tracing::warn!(member = %member.id, "member failed");
                    self.emit(state, MembershipEvent::Failed(member));
                }
                MemberStatus::Alive => {
                    state.suspicion.cancel(&member.id);
                    tracing::debug!(member = %member.id, was = %from, "member recovered");
                    self.emit(state, MembershipEvent::Recovered(member));
                }
            },
        }
    }

    /// Ingest a gossip payload: refute rumors about the local member, apply
    /// the rest through the table, re-queue what was accepted.
    fn ingest(&self, state: &mut SwimState, updates: Vec<Member>) {
        let mut peers = Vec::with_capacity(updates.len());
        for update in updates {
            if update.id == self.local_id {
                self.refute(state, update);
            } else {
                peers.push(update);
            }
        }
        let changes = state.gossip.ingest(&peers, &mut state.table);
        for change in changes {
            self.apply_change(state, change);
        }
    }

    /// Only the local member may advance its own incarnation: any non-alive
    /// rumor about us at our incarnation or newer gets outbid.
    fn refute(&self, state: &mut SwimState, rumor: Member) {
        if rumor.status == MemberStatus::Alive {
            return;
        }
        if rumor.incarnation < state.local.incarnation {
            return;
        }
        state.local.incarnation = rumor.incarnation.wrapping_add(1);
        state.local.status = MemberStatus::Alive;
        let refreshed = state.local.clone();
        state.table.upsert(refreshed.clone());
        state.gossip.enqueue(refreshed);
        tracing::info!(
            incarnation = state.local.incarnation,
            rumor = %rumor.status,
            "refuted rumor about local member"
        );
        self.emit(
            state,
            MembershipEvent::IncarnationIncremented(state.local.incarnation),
        );
    }
}

/// SWIM membership engine.
///
/// Construct around a transport, `start` the protocol tasks, `join` a
/// cluster through one or more seeds, and consume `events`.
pub struct SwimMembership {
    ctx: EngineCtx,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    expirations: Option<mpsc::UnboundedReceiver<SuspicionExpiry>>,
}

impl SwimMembership {
    pub fn new(local_id: MemberId, config: SwimConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (suspicion, expirations) = SuspicionTimers::new();

        let local = Member::alive(local_id.clone());
        let mut table = MembershipTable::new();
        table.upsert(local.clone());

        let state = SwimState {
            table,
            gossip: Disseminator::new(config.max_payload_size, config.base_dissemination_limit),
            suspicion,
            pending: HashMap::new(),
            indirect_tasks: Vec::new(),
            local,
            sequence: 0,
            stopped: false,
        };

        Self {
            ctx: EngineCtx {
                local_id,
                config,
                transport,
                state: Arc::new(Mutex::new(state)),
                events,
                shutdown: shutdown_rx,
            },
            shutdown: shutdown_tx,
            tasks: Vec::new(),
            expirations: Some(expirations),
        }
    }

    /// Start the probe loop, the receive loop, and the suspicion dispatcher.
    pub async fn start(&mut self) -> Result<()> {
        let Some(expirations) = self.expirations.take() else {
            return Ok(()); // already started
        };
        tracing::info!(local = %self.ctx.local_id, "starting swim membership");
        self.tasks.push(tokio::spawn(probe_loop(self.ctx.clone())));
        self.tasks.push(tokio::spawn(receive_loop(self.ctx.clone())));
        self.tasks
            .push(tokio::spawn(suspicion_loop(self.ctx.clone(), expirations)));
        Ok(())
    }

    /// Stop all protocol activity. No events are emitted and no suspicion
    /// timer fires after this returns.
    pub async fn stop(&mut self) {
        {
            let mut state = self.ctx.state.lock().await;
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.suspicion.cancel_all();
            state.pending.clear();
            for handle in state.indirect_tasks.drain(..) {
                handle.abort();
            }
        }
        let _ = self.shutdown.send(true);
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
        tracing::info!(local = %self.ctx.local_id, "swim membership stopped");
    }

    /// Join a cluster through the given seeds. Succeeds when at least one
    /// seed could be pinged.
    pub async fn join(&self, seeds: &[MemberId]) -> Result<()> {
        if seeds.is_empty() {
            return Err(SwimError::JoinFailed("no seed members provided".into()));
        }

        let outgoing = {
            let mut state = self.ctx.state.lock().await;
            if state.stopped {
                return Err(SwimError::JoinFailed("engine is stopped".into()));
            }
            // announce ourselves so seeds learn our identity from the payload
            let announce = state.local.clone();
            state.gossip.enqueue(announce);

            let mut outgoing = Vec::new();
            for seed in seeds {
                if *seed == self.ctx.local_id {
                    continue;
                }
                if let Some(change) = state.table.upsert(Member::alive(seed.clone())) {
                    self.ctx.apply_change(&mut state, change);
                }
                let gossip = state.gossip_payload();
                outgoing.push((seed.clone(), Message::Ping { seq: 0, gossip }));
            }
            outgoing
        };

        if outgoing.is_empty() {
            return Err(SwimError::JoinFailed(
                "no seeds other than the local member".into(),
            ));
        }

        let mut reached = 0usize;
        for (seed, message) in outgoing {
            match self.ctx.transport.send(&message, &seed).await {
                Ok(()) => reached += 1,
                Err(error) => tracing::warn!(seed = %seed, %error, "seed ping failed"),
            }
        }
        if reached == 0 {
            return Err(SwimError::JoinFailed("every seed was unreachable".into()));
        }
        tracing::info!(reached, seeds = seeds.len(), "joined cluster");
        Ok(())
    }

    /// Leave the cluster gracefully: mark ourselves dead, push the update to
    /// a sample of alive members, emit `LocalLeft`, and stop.
    pub async fn leave(&mut self) -> Result<()> {
        let outgoing = {
            let mut state = self.ctx.state.lock().await;
            if state.stopped {
                return Ok(());
            }
            let incarnation = state.local.incarnation;
            state.local.status = MemberStatus::Dead;
            // no change event for ourselves; LocalLeft below is the signal
            let _ = state.table.mark_dead(&self.ctx.local_id, incarnation);
            let local = state.local.clone();
            state.gossip.enqueue(local);

            let exclude = [self.ctx.local_id.clone()];
            let targets = state.table.random_alive(LEAVE_FANOUT, &exclude);
            let seq = state.next_seq();
            targets
                .into_iter()
                .map(|member| {
                    let gossip = state.gossip_payload();
                    (member.id, Message::Ping { seq, gossip })
                })
                .collect::<Vec<_>>()
        };

        for (target, message) in outgoing {
            if let Err(error) = self.ctx.transport.send(&message, &target).await {
                tracing::debug!(to = %target, %error, "leave announcement failed");
            }
        }

        {
            let state = self.ctx.state.lock().await;
            self.ctx
                .emit(&state, MembershipEvent::LocalLeft(self.ctx.local_id.clone()));
        }
        tracing::info!(local = %self.ctx.local_id, "left cluster");
        self.stop().await;
        Ok(())
    }

    /// Snapshot of every known member, the local one included.
    pub async fn members(&self) -> Vec<Member> {
        self.ctx.state.lock().await.table.members()
    }

    pub async fn alive_count(&self) -> usize {
        self.ctx.state.lock().await.table.alive_count()
    }

    /// The local member record (the only one whose incarnation we own).
    pub async fn local(&self) -> Member {
        self.ctx.state.lock().await.local.clone()
    }

    pub fn local_id(&self) -> &MemberId {
        &self.ctx.local_id
    }

    pub fn config(&self) -> &SwimConfig {
        &self.ctx.config
    }

    /// Subscribe to membership events. Every subscriber observes the same
    /// emission order; slow subscribers lose the oldest buffered events.
    pub fn events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events_sender().subscribe()
    }

    fn events_sender(&self) -> &broadcast::Sender<MembershipEvent> {
        &self.ctx.events
    }
}

impl Drop for SwimMembership {
    fn drop(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

// ============================================================================
// Probe loop
// ============================================================================

async fn probe_loop(ctx: EngineCtx) {
    let mut shutdown = ctx.shutdown.clone();
    let mut interval = time::interval(ctx.config.protocol_period);
    loop {
        tokio::select! {
            _ = interval.tick() => probe_round(&ctx).await,
            _ = shutdown.changed() => break,
        }
    }
}

/// One protocol period: direct probe, indirect escalation, suspicion.
async fn probe_round(ctx: &EngineCtx) {
    let prepared = {
        let mut state = ctx.state.lock().await;
        if state.stopped {
            return;
        }
        if let Some(retention) = ctx.config.dead_retention {
            for id in state.table.gc_dead(retention) {
                tracing::debug!(member = %id, "garbage collected dead member");
            }
        }
        prepare_probe(ctx, &mut state)
    };
    let Some((seq, target, ping)) = prepared else {
        return;
    };

    let mut acked = match ctx.transport.send(&ping, &target).await {
        Ok(()) => wait_for_ack(ctx, seq, Instant::now() + ctx.config.ping_timeout).await,
        Err(error) => {
            // a failed send counts as a timeout
            tracing::debug!(target = %target, %error, "direct probe send failed");
            false
        }
    };
    if !acked {
        acked = indirect_probe(ctx, seq, &target).await;
    }

    let mut state = ctx.state.lock().await;
    let probe = state.pending.remove(&seq);
    if state.stopped {
        return;
    }
    let ack_seen = acked || probe.as_ref().map(|p| p.ack_seen).unwrap_or(true);
    if ack_seen {
        return;
    }
    if let Some(probe) = &probe {
        tracing::debug!(
            target = %target,
            seq,
            elapsed_ms = probe.started_at.elapsed().as_millis() as u64,
            "probe exhausted without ack"
        );
    }
    suspect_member(ctx, &mut state, &target);
}

fn prepare_probe(ctx: &EngineCtx, state: &mut SwimState) -> Option<(u64, MemberId, Message)> {
    let target = state.table.next_round_robin(&ctx.local_id)?;
    let seq = state.next_seq();
    let gossip = state.gossip_payload();
    state
        .pending
        .insert(seq, PendingProbe::direct(target.id.clone()));
    tracing::trace!(target = %target.id, seq, "sending direct probe");
    Some((seq, target.id, Message::Ping { seq, gossip }))
}

/// Fan a PingReq out to random alive intermediaries and wait for any ack
/// correlated to the same sequence number.
async fn indirect_probe(ctx: &EngineCtx, seq: u64, target: &MemberId) -> bool {
    let requests = {
        let mut state = ctx.state.lock().await;
        if state.stopped {
            return true;
        }
        match state.pending.get_mut(&seq) {
            Some(probe) if probe.ack_seen => return true,
            Some(probe) => probe.indirect = true,
            None => return true,
        }
        let exclude = [ctx.local_id.clone(), target.clone()];
        let relays = state
            .table
            .random_alive(ctx.config.indirect_probe_count, &exclude);
        relays
            .into_iter()
            .map(|relay| {
                let gossip = state.gossip_payload();
                (
                    relay.id,
                    Message::PingReq {
                        seq,
                        target: target.clone(),
                        gossip,
                    },
                )
            })
            .collect::<Vec<_>>()
    };

    if requests.is_empty() {
        return false;
    }
    let mut any_sent = false;
    for (relay, message) in requests {
        match ctx.transport.send(&message, &relay).await {
            Ok(()) => any_sent = true,
            Err(error) => tracing::debug!(relay = %relay, %error, "ping-req send failed"),
        }
    }
    if !any_sent {
        return false;
    }
    tracing::trace!(target = %target, seq, "waiting for indirect ack");
    wait_for_ack(ctx, seq, Instant::now() + ctx.config.ping_timeout).await
}

/// Poll the pending entry until its ack flag is set or the deadline passes.
async fn wait_for_ack(ctx: &EngineCtx, seq: u64, deadline: Instant) -> bool {
    loop {
        {
            let state = ctx.state.lock().await;
            if state.stopped {
                return true;
            }
            match state.pending.get(&seq) {
                Some(probe) if probe.ack_seen => return true,
                Some(_) => {}
                None => return true, // concluded elsewhere
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        time::sleep(ACK_POLL_INTERVAL.min(deadline - now)).await;
    }
}

fn suspect_member(ctx: &EngineCtx, state: &mut SwimState, target: &MemberId) {
    let Some(member) = state.table.get(target).cloned() else {
        return;
    };
    if let Some(change) = state.table.mark_suspect(target, member.incarnation) {
        let suspected = Member::new(target.clone(), MemberStatus::Suspect, member.incarnation);
        state.gossip.enqueue(suspected.clone());
        let timeout = ctx.config.suspicion_timeout(state.table.len());
        state
            .suspicion
            .start(suspected.id.clone(), suspected.incarnation, timeout);
        ctx.apply_change(state, change);
    }
}

// ============================================================================
// Receive loop
// ============================================================================

async fn receive_loop(ctx: EngineCtx) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            incoming = ctx.transport.recv() => match incoming {
                Some((message, sender)) => handle_message(&ctx, message, sender).await,
                None => {
                    tracing::debug!("transport incoming stream ended");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_message(ctx: &EngineCtx, message: Message, sender: MemberId) {
    tracing::trace!(
        from = %sender,
        kind = message.message_type(),
        seq = message.seq(),
        "received message"
    );
    match message {
        Message::Ping { seq, gossip } => {
            // ingestion completes before the reply payload is built, so the
            // ack never carries stale gossip
            let reply = {
                let mut state = ctx.state.lock().await;
                if state.stopped {
                    return;
                }
                ctx.ingest(&mut state, gossip);
                observe_sender(ctx, &mut state, &sender);
                let gossip = state.gossip_payload();
                Message::Ack {
                    seq,
                    responder: state.local.id.clone(),
                    gossip,
                }
            };
            if let Err(error) = ctx.transport.send(&reply, &sender).await {
                tracing::debug!(to = %sender, %error, "ack send failed");
                report_error(ctx, ErrorKind::Transport).await;
            }
        }

        Message::PingReq { seq, target, gossip } => {
            let mut state = ctx.state.lock().await;
            if state.stopped {
                return;
            }
            ctx.ingest(&mut state, gossip);
            let proxy = ctx.clone();
            let requester = sender;
            let handle =
                tokio::spawn(async move { proxy_probe(proxy, requester, seq, target).await });
            state.indirect_tasks.retain(|task| !task.is_finished());
            state.indirect_tasks.push(handle);
        }

        Message::Ack {
            seq,
            responder,
            gossip,
        } => {
            let mut state = ctx.state.lock().await;
            if state.stopped {
                return;
            }
            ctx.ingest(&mut state, gossip);

            // correlate on seq AND the recorded target; the responder field
            // is the member the ack proves alive, even when relayed
            if let Some(probe) = state.pending.get_mut(&seq) {
                if probe.target == responder {
                    probe.ack_seen = true;
                    tracing::trace!(
                        seq,
                        responder = %responder,
                        indirect = probe.indirect,
                        proxied_for = probe.requester.as_ref().map(|r| r.id.as_str()),
                        "probe acknowledged"
                    );
                }
            }

            state.suspicion.cancel(&responder);
            revive_if_suspect(ctx, &mut state, &responder);
        }

        Message::Nack { seq, target } => {
            // informational; never mutates probe or table state
            tracing::trace!(seq, target = %target, "nack received");
        }
    }
}

/// Join-by-observation: an inbound ping from an unknown member inserts a
/// fresh alive record; one from a suspect is direct evidence of liveness.
fn observe_sender(ctx: &EngineCtx, state: &mut SwimState, sender: &MemberId) {
    if *sender == ctx.local_id {
        return;
    }
    match state.table.get(sender).map(|m| (m.status, m.incarnation)) {
        None => {
            let observed = Member::alive(sender.clone());
            if let Some(change) = state.table.upsert(observed.clone()) {
                state.gossip.enqueue(observed);
                ctx.apply_change(state, change);
            }
        }
        Some((MemberStatus::Suspect, incarnation)) => {
            state.suspicion.cancel(sender);
            revive(ctx, state, sender, incarnation);
        }
        Some(_) => {}
    }
}

fn revive_if_suspect(ctx: &EngineCtx, state: &mut SwimState, id: &MemberId) {
    if let Some((MemberStatus::Suspect, incarnation)) =
        state.table.get(id).map(|m| (m.status, m.incarnation))
    {
        revive(ctx, state, id, incarnation);
    }
}

fn revive(ctx: &EngineCtx, state: &mut SwimState, id: &MemberId, incarnation: u64) {
    if let Some(change) = state.table.mark_alive(id, incarnation.wrapping_add(1)) {
        if let Some(member) = state.table.get(id).cloned() {
            state.gossip.enqueue(member);
        }
        ctx.apply_change(state, change);
    }
}

/// Probe `target` on behalf of `requester` and answer with an Ack carrying
/// the target as responder, or a Nack. A failed send to the target nacks
/// immediately.
async fn proxy_probe(ctx: EngineCtx, requester: MemberId, request_seq: u64, target: MemberId) {
    let (seq, ping) = {
        let mut state = ctx.state.lock().await;
        if state.stopped {
            return;
        }
        let seq = state.next_seq();
        let gossip = state.gossip_payload();
        state
            .pending
            .insert(seq, PendingProbe::proxied(target.clone(), requester.clone()));
        (seq, Message::Ping { seq, gossip })
    };

    match ctx.transport.send(&ping, &target).await {
        Ok(()) => {
            wait_for_ack(&ctx, seq, Instant::now() + ctx.config.ping_timeout).await;
        }
        Err(error) => {
            tracing::debug!(target = %target, %error, "proxy ping send failed");
        }
    }

    let reply = {
        let mut state = ctx.state.lock().await;
        let probe = state.pending.remove(&seq);
        if state.stopped {
            return;
        }
        let confirmed = probe.map(|p| p.ack_seen).unwrap_or(false);
        if confirmed {
            let gossip = state.gossip_payload();
            Message::Ack {
                seq: request_seq,
                responder: target.clone(),
                gossip,
            }
        } else {
            Message::Nack {
                seq: request_seq,
                target: target.clone(),
            }
        }
    };

    tracing::trace!(
        to = %requester,
        kind = reply.message_type(),
        seq = request_seq,
        "answering ping-req"
    );
    if let Err(error) = ctx.transport.send(&reply, &requester).await {
        tracing::debug!(to = %requester, %error, "proxy reply send failed");
        report_error(&ctx, ErrorKind::Transport).await;
    }
}

// ============================================================================
// Suspicion dispatcher
// ============================================================================

async fn suspicion_loop(ctx: EngineCtx, mut expirations: mpsc::UnboundedReceiver<SuspicionExpiry>) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            expiry = expirations.recv() => match expiry {
                Some(expiry) => handle_expiry(&ctx, expiry).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_expiry(ctx: &EngineCtx, expiry: SuspicionExpiry) {
    let mut state = ctx.state.lock().await;
    if state.stopped {
        return;
    }
    // the serialisation point is taken before mark_dead, so a refutation or
    // cancellation that already committed wins over the raced expiry
    if !state.suspicion.confirm(&expiry) {
        return;
    }
    if let Some(change) = state.table.mark_dead(&expiry.member_id, expiry.incarnation) {
        if let Some(member) = state.table.get(&expiry.member_id).cloned() {
            state.gossip.enqueue(member);
        }
        ctx.apply_change(&mut state, change);
    }
}

async fn report_error(ctx: &EngineCtx, kind: ErrorKind) {
    let state = ctx.state.lock().await;
    ctx.emit(&state, MembershipEvent::Error(kind));
}
