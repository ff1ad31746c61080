//! Drives the agent from a simulated application main loop.
//!
//! Configuration comes from `RUM_*` environment variables (a `.env` file is
//! honoured). Spans are written to the log; set `RUST_LOG=info` to see them.

use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;

use rum_agent::telemetry::{Attributes, LoggingExporter, LoopContext};
use rum_agent::{AgentConfig, AgentResult, RumAgent};

const FRAMES: u32 = 40;
const FRAME_TIME: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> AgentResult<()> {
    dotenv().ok();
    env_logger::init();

    let config = AgentConfig::from_env()?;
    log::info!("Starting RUM agent demo for '{}'", config.application_name);

    let stall_for = config.stall_threshold() + Duration::from_millis(500);

    let agent = RumAgent::builder(config)
        .exporter(Arc::new(LoggingExporter::new()))
        .build()?;
    let flush_loop = agent.spawn_flush_loop();

    let main_loop = Arc::new(LoopContext::new("demo-main").with_stack_provider(|| {
        "at agent_demo::render_frame\nat agent_demo::main".to_string()
    }));
    let watchdog = agent.spawn_watchdog(main_loop.clone());

    agent.add_event("app.start", Attributes::new());

    for frame in 0..FRAMES {
        main_loop.pump();

        let mut span = agent.start_span("frame");
        span.set_attribute("frame.index", frame as i64);

        if frame == FRAMES / 2 {
            log::info!("Blocking the main loop for {}ms", stall_for.as_millis());
            // blocks this worker thread like a long synchronous call would
            std::thread::sleep(stall_for);
        }
        span.end();

        tokio::time::sleep(FRAME_TIME).await;
    }
    main_loop.pump();

    agent.shutdown().await;
    if let Err(e) = flush_loop.await {
        log::warn!("Flush loop ended abnormally: {}", e);
    }
    if let Some((watchdog, handle)) = watchdog {
        let _ = handle.await;
        log::info!("Watchdog saw {} stall(s)", watchdog.stalls_total());
    }

    let stats = agent.stats();
    log::info!(
        "Done: {} span(s) still buffered, {} evicted, {} sampled out",
        stats.store.queued,
        stats.store.dropped_total,
        stats.sampled_out
    );
    Ok(())
}
