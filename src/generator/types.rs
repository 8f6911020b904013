use super::*;

/// Configuration for one upstream stratum session. Immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub auth: Username,
    pub pass: Option<String>,
    pub client_version: String,
    pub timeout: Duration,
}

/// Signals pushed from the generator to the stratifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Subscribe,
    Notify,
    Diff,
    Update,
    Shutdown,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Subscribe => "subscribe",
            Signal::Notify => "notify",
            Signal::Diff => "diff",
            Signal::Update => "update",
            Signal::Shutdown => "shutdown",
        }
    }
}

/// Holds a downstream connection open, pushing every signal the receiver dispatches as a
/// newline-delimited line until the stratifier disconnects, a write fails, or `cancel` fires.
/// A lagged subscriber only loses backlog, never falls out of the stream.
pub async fn forward_signals(
    mut signals: broadcast::Receiver<Signal>,
    writer: &mut OwnedWriteHalf,
    cancel: &CancellationToken,
) -> error::Result<()> {
    loop {
        let signal = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            signal = signals.recv() => signal,
        };

        match signal {
            Ok(signal) => {
                writer
                    .write_all(format!("{}\n", signal.as_str()).as_bytes())
                    .await
                    .context(error::IoSnafu)?;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "stratifier signal subscriber lagged, continuing");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

/// One upstream `mining.notify` snapshot, keyed by a locally-assigned id.
#[derive(Debug, Clone)]
pub struct NotifyInstance {
    pub id: u32,
    pub upstream_jobid: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub prevhash: PrevHash,
    pub merkles: Vec<MerkleNode>,
    pub bbversion: Version,
    pub nbit: Nbits,
    pub ntime: Ntime,
    pub clean: bool,
    pub notify_time: Instant,
}

impl NotifyInstance {
    pub fn from_notify(id: u32, notify: Notify) -> error::Result<Self> {
        ensure!(
            notify.merkle_branches.len() <= 16,
            error::ProtocolSnafu {
                message: format!(
                    "mining.notify carried {} merkle branches, max 16",
                    notify.merkle_branches.len()
                ),
            }
        );

        Ok(Self {
            id,
            upstream_jobid: notify.job_id.to_string(),
            coinbase1: notify.coinb1,
            coinbase2: notify.coinb2,
            prevhash: notify.prevhash,
            merkles: notify.merkle_branches,
            bbversion: notify.version,
            nbit: notify.nbits,
            ntime: notify.ntime,
            clean: notify.clean_jobs,
            notify_time: Instant::now(),
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "jobid": self.id,
            "prevhash": self.prevhash.to_string(),
            "coinbase1": self.coinbase1,
            "coinbase2": self.coinbase2,
            "merklehash": self.merkles.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "bbversion": self.bbversion.to_string(),
            "nbit": self.nbit.to_string(),
            "ntime": self.ntime.to_string(),
            "clean": self.clean,
        })
    }
}

/// A share submitted by the stratifier, awaiting correlation with an upstream response.
#[derive(Debug, Clone)]
pub struct ShareMsg {
    pub id: u32,
    pub client_id: Value,
    pub msg_id: Value,
    pub submit_time: Instant,
}

/// A share translated and queued for the sender task.
#[derive(Debug, Clone)]
pub struct OutboundMsg {
    pub share_id: u32,
    pub jobid: u32,
    pub nonce2: String,
    pub ntime: Ntime,
    pub nonce: Nonce,
}

/// Mutable per-connection session state: extranonce negotiation, difficulty, fallback flags.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub enonce1: Extranonce,
    pub nonce2len: usize,
    pub sessionid: Option<String>,
    pub no_sessionid: bool,
    pub no_params: bool,
    pub diff: Difficulty,
    pub connected: bool,
}

#[derive(Debug, Default)]
pub struct NotifyRegistry {
    map: HashMap<u32, Arc<NotifyInstance>>,
    current: Option<u32>,
    next_id: u32,
}

impl NotifyRegistry {
    pub fn insert(&mut self, notify: Notify) -> error::Result<Arc<NotifyInstance>> {
        let id = self.next_id;
        self.next_id += 1;

        let instance = Arc::new(NotifyInstance::from_notify(id, notify)?);
        self.map.insert(id, instance.clone());
        self.current = Some(id);

        Ok(instance)
    }

    pub fn current(&self) -> Option<Arc<NotifyInstance>> {
        self.current.and_then(|id| self.map.get(&id).cloned())
    }

    pub fn get(&self, id: u32) -> Option<Arc<NotifyInstance>> {
        self.map.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// While at least 3 entries remain, evict any older than `max_age`.
    pub fn age_out(&mut self, max_age: Duration) {
        while self.map.len() >= 3 {
            let stale = self
                .map
                .iter()
                .find(|(_, notify)| notify.notify_time.elapsed() > max_age)
                .map(|(id, _)| *id);

            match stale {
                Some(id) => {
                    self.map.remove(&id);
                    if self.current == Some(id) {
                        self.current = None;
                    }
                }
                None => break,
            }
        }
    }

    /// All local ids are invalidated on reconnect.
    pub fn clear(&mut self) {
        self.map.clear();
        self.current = None;
    }
}

#[derive(Debug, Default)]
pub struct ShareRegistry {
    map: HashMap<u32, ShareMsg>,
    next_id: u32,
}

impl ShareRegistry {
    pub fn insert(&mut self, client_id: Value, msg_id: Value) -> u32 {
        let id = self.next_id;
        self.next_id += 1;

        self.map.insert(
            id,
            ShareMsg {
                id,
                client_id,
                msg_id,
                submit_time: Instant::now(),
            },
        );

        id
    }

    pub fn remove(&mut self, id: u32) -> Option<ShareMsg> {
        self.map.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.map.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn age_out(&mut self, max_age: Duration) {
        self.map.retain(|_, share| share.submit_time.elapsed() <= max_age);
    }
}

/// Process-wide, per-session state for one upstream stratum connection.
///
/// Passed explicitly as an `Arc` into each task; never a module-level static.
pub struct ProxyInstance {
    pub endpoint: String,
    pub config: UpstreamConfig,
    pub write: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    pub session: RwLock<SessionState>,
    pub notifies: Mutex<NotifyRegistry>,
    pub shares: Mutex<ShareRegistry>,
    pub outbound: Mutex<VecDeque<OutboundMsg>>,
    pub outbound_notify: TokioNotify,
    pub signals: broadcast::Sender<Signal>,
    id_counter: AtomicU64,
}

impl ProxyInstance {
    pub fn new(endpoint: String, config: UpstreamConfig, session: SessionState) -> Self {
        let (signals, _) = broadcast::channel(64);

        Self {
            endpoint,
            config,
            write: Mutex::new(None),
            session: RwLock::new(session),
            notifies: Mutex::new(NotifyRegistry::default()),
            shares: Mutex::new(ShareRegistry::default()),
            outbound: Mutex::new(VecDeque::new()),
            outbound_notify: TokioNotify::new(),
            signals,
            id_counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.id_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn signal(&self, signal: Signal) {
        // No receivers (no stratifier currently listening) is not an error.
        let _ = self.signals.send(signal);
    }

    pub async fn enqueue(&self, msg: OutboundMsg) {
        self.outbound.lock().await.push_back(msg);
        self.outbound_notify.notify_one();
    }
}
