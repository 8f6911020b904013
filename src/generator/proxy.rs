use {super::*, session::Dispatched};

const NOTIFY_MAX_AGE: Duration = Duration::from_secs(600);
const SHARE_MAX_AGE: Duration = Duration::from_secs(120);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const READ_RETRIES: u32 = 24;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Everything needed to run proxy mode: candidate upstreams (tried in order at startup, the
/// first that completes a full handshake wins) and the downstream-facing listener address.
pub struct ProxyConfig {
    pub upstreams: Vec<String>,
    pub upstream: UpstreamConfig,
    pub listen_address: String,
    pub listen_port: u16,
}

pub async fn run_proxy(config: ProxyConfig, cancel: CancellationToken) -> error::Result<()> {
    let mut selected = None;

    for endpoint in &config.upstreams {
        info!(%endpoint, "attempting upstream handshake");
        match session::handshake(endpoint, &config.upstream, 1, None, false, false).await {
            Ok((reader, writer, outcome)) => {
                selected = Some((endpoint.clone(), reader, writer, outcome));
                break;
            }
            Err(source) => warn!(%endpoint, %source, "upstream handshake failed"),
        }
    }

    let Some((endpoint, reader, writer, outcome)) = selected else {
        error!("no configured upstream came up");
        return Err(error::GeneratorError::Fatal);
    };

    info!(%endpoint, "connected to upstream");

    let session = SessionState {
        enonce1: outcome.enonce1,
        nonce2len: outcome.nonce2len,
        sessionid: outcome.sessionid,
        no_sessionid: outcome.no_sessionid,
        no_params: outcome.no_params,
        diff: Difficulty::default(),
        connected: true,
    };

    let proxy = Arc::new(ProxyInstance::new(endpoint, config.upstream.clone(), session));
    *proxy.write.lock().await = Some(writer);
    proxy.signal(Signal::Subscribe);

    let listener = TcpListener::bind((config.listen_address.as_str(), config.listen_port))
        .await
        .context(error::IoSnafu)?;

    info!(
        address = %config.listen_address,
        port = config.listen_port,
        "listening for stratifier requests"
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(receiver_task(proxy.clone(), reader, cancel.clone()));
    tasks.spawn(sender_task(proxy.clone(), cancel.clone()));
    tasks.spawn(request_endpoint(proxy.clone(), listener, cancel.clone()));

    while let Some(result) = tasks.join_next().await {
        if let Err(source) = result {
            error!(%source, "generator task panicked");
        }
    }

    Ok(())
}

async fn receiver_task(
    proxy: Arc<ProxyInstance>,
    mut reader: BufReader<OwnedReadHalf>,
    cancel: CancellationToken,
) {
    loop {
        proxy.notifies.lock().await.age_out(NOTIFY_MAX_AGE);
        proxy.shares.lock().await.age_out(SHARE_MAX_AGE);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = session::read_line_with_retries(&mut reader, READ_TIMEOUT, READ_RETRIES) => outcome,
        };

        let line = match outcome {
            Ok(Some(line)) => line,
            Ok(None) => {
                warn!("upstream read timed out after retries, reconnecting");
                match reconnect(&proxy, &cancel).await {
                    Some(new_reader) => {
                        reader = new_reader;
                        continue;
                    }
                    None => return,
                }
            }
            Err(source) => {
                warn!(%source, "upstream read failed, reconnecting");
                match reconnect(&proxy, &cancel).await {
                    Some(new_reader) => {
                        reader = new_reader;
                        continue;
                    }
                    None => return,
                }
            }
        };

        let message: Message = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(source) => {
                warn!(%source, %line, "invalid JSON from upstream");
                continue;
            }
        };

        match message {
            Message::Response {
                id,
                result,
                error,
                reject_reason,
            } => handle_share_response(&proxy, id, result, error, reject_reason).await,
            notification @ (Message::Notification { .. } | Message::Request { .. }) => {
                let mut guard = proxy.write.lock().await;
                let Some(writer) = guard.as_mut() else {
                    continue;
                };

                match session::parse_method(&proxy, writer, notification).await {
                    Ok(Dispatched::Notify) => {
                        drop(guard);
                        proxy.signal(Signal::Notify);
                    }
                    Ok(Dispatched::Diff) => {
                        drop(guard);
                        proxy.signal(Signal::Diff);
                    }
                    Ok(Dispatched::None) => {}
                    Err(source) => warn!(%source, "failed to reply to upstream"),
                }
            }
        }
    }
}

async fn handle_share_response(
    proxy: &ProxyInstance,
    id: Id,
    result: Option<Value>,
    error: Option<JsonRpcError>,
    reject_reason: Option<String>,
) {
    let Id::Number(number) = id else {
        warn!(?id, "unhandled message");
        return;
    };

    let share_id = number as u32;

    let share = proxy.shares.lock().await.remove(share_id);

    let Some(share) = share else {
        debug!(share_id, "unmatched or aged-out share response");
        return;
    };

    match (result, error, reject_reason) {
        (Some(Value::Bool(true)), None, None) => {
            info!(share_id, client_id = %share.client_id, "share accepted upstream");
        }
        (_, Some(err), _) => {
            info!(share_id, %err, "share rejected upstream");
        }
        (_, _, Some(reason)) => {
            info!(share_id, %reason, "share rejected upstream");
        }
        _ => warn!(share_id, "unexpected share response shape"),
    }
}

/// Drops all notifies, then connects/subscribes/authorizes in a loop until it succeeds or
/// cancellation is observed. The share registry is left untouched: outstanding shares age out
/// naturally rather than being flushed.
async fn reconnect(
    proxy: &Arc<ProxyInstance>,
    cancel: &CancellationToken,
) -> Option<BufReader<OwnedReadHalf>> {
    proxy.notifies.lock().await.clear();
    *proxy.write.lock().await = None;
    {
        let mut session = proxy.session.write().await;
        session.connected = false;
    }

    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let (no_sessionid, no_params, sessionid) = {
            let session = proxy.session.read().await;
            (session.no_sessionid, session.no_params, session.sessionid.clone())
        };

        match session::handshake(
            &proxy.endpoint,
            &proxy.config,
            proxy.next_id(),
            sessionid,
            no_sessionid,
            no_params,
        )
        .await
        {
            Ok((reader, writer, outcome)) => {
                {
                    let mut session = proxy.session.write().await;
                    session.enonce1 = outcome.enonce1;
                    session.nonce2len = outcome.nonce2len;
                    session.sessionid = outcome.sessionid;
                    session.no_sessionid = outcome.no_sessionid;
                    session.no_params = outcome.no_params;
                    session.connected = true;
                }

                *proxy.write.lock().await = Some(writer);
                proxy.signal(Signal::Subscribe);
                info!(endpoint = %proxy.endpoint, "reconnected to upstream");

                return Some(reader);
            }
            Err(source) => {
                warn!(%source, "reconnect attempt failed, retrying");

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                }
            }
        }
    }
}

async fn sender_task(proxy: Arc<ProxyInstance>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = proxy.outbound_notify.notified() => {}
        }

        loop {
            let msg = proxy.outbound.lock().await.pop_front();

            let Some(msg) = msg else {
                break;
            };

            let upstream_jobid = proxy
                .notifies
                .lock()
                .await
                .get(msg.jobid)
                .map(|notify| notify.upstream_jobid.clone());

            let Some(upstream_jobid) = upstream_jobid else {
                warn!(jobid = msg.jobid, "dropping share, job no longer known");
                continue;
            };

            let submit = Message::Request {
                id: Id::Number(msg.share_id as u64),
                method: "mining.submit".to_string(),
                params: json!([
                    proxy.config.auth.0,
                    upstream_jobid,
                    msg.nonce2,
                    msg.ntime.to_string(),
                    msg.nonce.to_string(),
                ]),
            };

            let mut guard = proxy.write.lock().await;
            let Some(writer) = guard.as_mut() else {
                debug!("dropping share submit, not connected");
                continue;
            };

            if let Err(source) = session::write_message(writer, &submit).await {
                warn!(%source, "failed to submit share upstream, closing connection");
                *guard = None;
            }
        }
    }
}

async fn request_endpoint(
    proxy: Arc<ProxyInstance>,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        let (stream, _addr) = match accepted {
            Ok(pair) => pair,
            Err(source) => {
                warn!(%source, "accept failed");
                continue;
            }
        };

        let proxy = proxy.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            if let Err(source) = handle_request(&proxy, stream, &cancel).await {
                debug!(%source, "request connection closed with error");
            }
        });
    }
}

async fn handle_request(
    proxy: &ProxyInstance,
    stream: TcpStream,
    cancel: &CancellationToken,
) -> error::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let n = reader.read_line(&mut line).await.context(error::IoSnafu)?;

    if n == 0 {
        return Ok(());
    }

    let line = line.trim();

    if line.is_empty() {
        return Ok(());
    }

    if line == "shutdown" {
        info!("shutdown requested by stratifier");
        proxy.signal(Signal::Shutdown);
        cancel.cancel();
        return Ok(());
    }

    if line == "ping" {
        write_half.write_all(b"pong\n").await.context(error::IoSnafu)?;
        return Ok(());
    }

    if line == "signals" {
        return types::forward_signals(proxy.signals.subscribe(), &mut write_half, cancel).await;
    }

    if line == "getsubscribe" {
        let session = proxy.session.read().await;
        let body = json!({"enonce1": session.enonce1.to_hex(), "nonce2len": session.nonce2len});
        drop(session);
        return write_json_line(&mut write_half, &body).await;
    }

    if line == "getnotify" {
        let current = proxy.notifies.lock().await.current();
        let body = current.map(|n| n.to_json()).unwrap_or(Value::Null);
        return write_json_line(&mut write_half, &body).await;
    }

    if line == "getdiff" {
        let diff = proxy.session.read().await.diff;
        return write_json_line(&mut write_half, &json!({"diff": diff.as_f64()})).await;
    }

    if line == "getstats" {
        let connected = proxy.session.read().await.connected;
        let notify_count = proxy.notifies.lock().await.len();
        let share_count = proxy.shares.lock().await.len();

        let body = json!({
            "connected": connected,
            "upstream": proxy.endpoint,
            "notify_count": notify_count,
            "share_count": share_count,
        });

        return write_json_line(&mut write_half, &body).await;
    }

    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(mut object)) => {
            let client_id = object.remove("client_id").unwrap_or(Value::Null);
            let msg_id = object.remove("msg_id").unwrap_or(Value::Null);

            let jobid = object.get("jobid").and_then(Value::as_u64).map(|v| v as u32);
            let nonce2 = object
                .get("nonce2")
                .and_then(Value::as_str)
                .map(str::to_string);
            let ntime = object
                .get("ntime")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Ntime>().ok());
            let nonce = object
                .get("nonce")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Nonce>().ok());

            let (Some(jobid), Some(nonce2), Some(ntime), Some(nonce)) =
                (jobid, nonce2, ntime, nonce)
            else {
                warn!(%line, "malformed share submission");
                return Ok(());
            };

            let share_id = proxy.shares.lock().await.insert(client_id, msg_id);

            proxy
                .enqueue(OutboundMsg {
                    share_id,
                    jobid,
                    nonce2,
                    ntime,
                    nonce,
                })
                .await;
        }
        _ => warn!(%line, "unrecognised request"),
    }

    Ok(())
}

async fn write_json_line(
    writer: &mut OwnedWriteHalf,
    value: &Value,
) -> error::Result<()> {
    let mut line = serde_json::to_string(value).context(error::SerializationSnafu)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await.context(error::IoSnafu)?;
    Ok(())
}
