//! Wiring: build the pipeline from config and run it against a broker or stdin/stdout.

use crate::agent::AgentInvoker;
use crate::agent_ctx;
use crate::config::{self, Config};
use crate::consumer::{Consumer, ConsumerSnapshot};
use crate::envelope::now_millis;
use crate::limiter::ConcurrencyLimiter;
use crate::publisher::Publisher;
use crate::retry::RetryPolicy;
use crate::runtime::{AgentRuntime, OllamaClient, OllamaRuntime};
use crate::session::{SessionOptions, SessionStore};
use crate::status::{self, StatusState};
use crate::transport::{LogSink, MemoryBroker, OutboundSink};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEAD_LETTER_LOG: &str = "dead letter";

/// Ollama runtime with AGENTS.md from the configured workspace as its system prompt.
pub fn ollama_runtime(config: &Config, config_path: &Path) -> Arc<OllamaRuntime> {
    let workspace = config::resolve_workspace_dir(config, config_path);
    let instructions = agent_ctx::load_agent_ctx(Some(&workspace));
    if instructions.is_none() {
        log::warn!(
            "no AGENTS.md in {}, running without agent instructions (run `courier init`)",
            workspace.display()
        );
    }
    let runtime = OllamaRuntime::new(
        OllamaClient::new(config.agent.base_url.clone()),
        config.agent.model.clone(),
        instructions,
        config.agent.history_limit,
    );
    log::info!("runtime: ollama model {}", runtime.model());
    Arc::new(runtime)
}

/// Assemble store, limiter, invoker and publishers into a consumer.
pub fn build_consumer(
    config: &Config,
    runtime: Arc<dyn AgentRuntime>,
    outbound: Arc<dyn OutboundSink>,
    dead_letters: Arc<dyn OutboundSink>,
) -> Consumer {
    let store = Arc::new(SessionStore::new(
        runtime.clone(),
        config.agent.app_name.clone(),
        SessionOptions {
            idempotency: config.sessions.idempotency,
            seen_window: config.sessions.seen_window,
        },
    ));
    let limiter = ConcurrencyLimiter::new(config.limits.max_concurrent, config.limits.max_queued);
    let invoker = AgentInvoker::new(runtime, config.agent_timeout());
    Consumer::new(
        store,
        limiter,
        invoker,
        Publisher::from_config(outbound, &config.publish),
        Publisher::from_config(dead_letters, &config.publish),
        RetryPolicy::from(&config.retry),
    )
    .with_prefetch(config.prefetch())
    .with_grace(config.shutdown_grace())
}

/// Drop sessions idle longer than `ttl` every `every`, skipping ones with work in flight,
/// and release their runtime state.
pub fn spawn_sweeper(
    store: Arc<SessionStore>,
    limiter: ConcurrencyLimiter,
    ttl: Duration,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            let evicted = store
                .sweep_idle(ttl, now_millis(), |key| limiter.is_busy(key))
                .await;
            for session in evicted {
                log::debug!("sessions: dropped idle {}", session.conversation_key);
                store.runtime().close_session(&session.runtime_session_handle).await;
            }
        }
    })
}

/// Sweeper and status server, as configured.
fn spawn_background(
    config: &Config,
    consumer: &Consumer,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    if let Some(ttl) = config.sessions.idle_ttl_secs {
        let every = Duration::from_secs(config.sessions.sweep_interval_secs.max(1));
        handles.push(spawn_sweeper(
            consumer.store().clone(),
            consumer.limiter().clone(),
            Duration::from_secs(ttl),
            every,
            shutdown.clone(),
        ));
    }
    if config.status.enabled {
        let state = StatusState {
            stats: consumer.stats(),
            store: consumer.store().clone(),
            limiter: consumer.limiter().clone(),
            inbound_queue: config.broker.inbound_queue.clone(),
            outbound_queue: config.broker.outbound_queue.clone(),
        };
        let bind = config.status.bind.clone();
        let port = config.status.port;
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = status::run_status_server(&bind, port, state, token).await {
                log::error!("status: {:#}", e);
            }
        }));
    }
    handles
}

/// Consume the configured AMQP queue until SIGINT/SIGTERM.
#[cfg(feature = "amqp")]
pub async fn run_service(config: Config, config_path: &Path) -> Result<()> {
    use crate::transport::AmqpBroker;

    let runtime = ollama_runtime(&config, config_path);
    let broker = AmqpBroker::connect(&config.broker.url)
        .await
        .context("connecting to broker")?;
    let b = &config.broker;
    if b.declare_queues {
        let queues = [Some(&b.inbound_queue), Some(&b.outbound_queue), b.dead_letter_queue.as_ref()];
        for queue in queues.into_iter().flatten() {
            broker
                .declare(queue)
                .await
                .with_context(|| format!("declaring queue {}", queue))?;
        }
    }
    let prefetch = u16::try_from(config.prefetch()).unwrap_or(u16::MAX);
    let source = broker
        .source(&b.inbound_queue, prefetch)
        .await
        .with_context(|| format!("consuming {}", b.inbound_queue))?;
    let outbound: Arc<dyn OutboundSink> = Arc::new(broker.sink(&b.outbound_queue));
    let dead_letters: Arc<dyn OutboundSink> = match &b.dead_letter_queue {
        Some(q) => Arc::new(broker.sink(q)),
        None => Arc::new(LogSink::new(DEAD_LETTER_LOG)),
    };
    log::info!(
        "courier: {} -> {} (dead letters: {}, max {} concurrent)",
        b.inbound_queue,
        b.outbound_queue,
        dead_letters.name(),
        config.limits.max_concurrent
    );

    let consumer = build_consumer(&config, runtime, outbound, dead_letters);
    let shutdown = cancel_on_signal();
    let background = spawn_background(&config, &consumer, &shutdown);

    let result = consumer.run(source, shutdown.clone()).await;
    shutdown.cancel();
    for handle in background {
        let _ = handle.await;
    }
    if let Err(e) = broker.close().await {
        log::warn!("closing broker connection: {}", e);
    }
    result.context("consuming inbound queue")
}

#[cfg(not(feature = "amqp"))]
pub async fn run_service(_config: Config, _config_path: &Path) -> Result<()> {
    anyhow::bail!("built without the `amqp` feature; use `courier pipe` or rebuild with --features amqp")
}

/// Run the pipeline over newline-delimited inbound envelopes from `input`, writing each
/// outbound envelope as one JSON line to `output`. Ends when input is exhausted and every
/// message is settled, or when `shutdown` fires. Dead letters go to the log.
pub async fn run_pipe<R, W>(
    config: &Config,
    runtime: Arc<dyn AgentRuntime>,
    input: R,
    mut output: W,
    shutdown: CancellationToken,
) -> Result<ConsumerSnapshot>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let broker = MemoryBroker::new();
    let inbound = config.broker.inbound_queue.clone();
    let outbound = config.broker.outbound_queue.clone();

    let feeder = {
        let broker = broker.clone();
        let inbound = inbound.clone();
        tokio::spawn(async move {
            let result = feed_lines(&broker, &inbound, input).await;
            broker.close(&inbound);
            result
        })
    };
    let writer = {
        let broker = broker.clone();
        let outbound = outbound.clone();
        tokio::spawn(async move {
            while let Some(payload) = broker.next(&outbound).await {
                output.write_all(&payload).await?;
                output.write_all(b"\n").await?;
                output.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        })
    };

    let consumer = build_consumer(
        config,
        runtime,
        Arc::new(broker.sink(&outbound)),
        Arc::new(LogSink::new(DEAD_LETTER_LOG)),
    );
    let stop = shutdown.child_token();
    let background = spawn_background(config, &consumer, &stop);
    let result = consumer.run(broker.source(&inbound), shutdown.clone()).await;

    if result.is_err() || shutdown.is_cancelled() {
        feeder.abort();
    }
    broker.close(&outbound);
    let written = writer.await.context("output writer panicked")?;
    stop.cancel();
    for handle in background {
        let _ = handle.await;
    }
    result.context("running pipeline")?;
    written.context("writing output")?;
    match feeder.await {
        Ok(fed) => fed?,
        Err(e) if e.is_cancelled() => {}
        Err(e) => return Err(e).context("input reader panicked"),
    }
    Ok(consumer.stats().snapshot())
}

async fn feed_lines<R: AsyncBufRead + Unpin>(
    broker: &MemoryBroker,
    queue: &str,
    input: R,
) -> Result<()> {
    let mut lines = input.lines();
    let mut n = 0usize;
    while let Some(line) = lines.next_line().await.context("reading input")? {
        if line.trim().is_empty() {
            continue;
        }
        broker.push(queue, line.into_bytes())?;
        n += 1;
    }
    log::debug!("pipe: read {} message(s)", n);
    Ok(())
}

/// Token cancelled on SIGINT or SIGTERM. Must be called inside a tokio runtime.
pub fn cancel_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                log::info!("shutdown signal received, draining in-flight messages");
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    });
    token
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
