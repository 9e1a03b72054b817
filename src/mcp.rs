use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router, ServerHandler,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use eoka_pilot_core::{
    FileKv, KvStore, MemoryStore, OpenAiCompatClient, Pilot, PilotConfig, RunMode, RunPhase,
    RunState, SystemClock, RUN_STATE_KEY,
};
use eoka_pilot_host::EokaHost;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct StartTaskRequest {
    #[schemars(description = "URL to open for the task")]
    pub url: String,
    #[schemars(description = "What to accomplish, in plain language")]
    pub goal: String,
    #[schemars(description = "auto (replay saved steps first), agent, or script. Default: auto")]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ConfirmRequest {
    #[schemars(description = "true to run the pending step, false to skip it")]
    pub approve: bool,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

fn err(e: impl std::fmt::Display) -> ErrorData {
    ErrorData::internal_error(e.to_string(), None::<Value>)
}

fn text_ok(s: impl Into<String>) -> Result<CallToolResult, ErrorData> {
    Ok(CallToolResult::success(vec![Content::text(s.into())]))
}

/// Browser and engine, launched by the first `start_task`.
struct Live {
    host: Arc<EokaHost>,
    pilot: Pilot,
}

#[derive(Clone)]
pub struct PilotServer {
    config: Arc<PilotConfig>,
    store: Arc<FileKv>,
    memory: Arc<MemoryStore>,
    live: Arc<Mutex<Option<Live>>>,
    tool_router: ToolRouter<Self>,
}

impl PilotServer {
    async fn ensure_live(&self) -> Result<(), ErrorData> {
        let mut guard = self.live.lock().await;
        if guard.is_none() {
            let config = (*self.config).clone();
            let model = Arc::new(OpenAiCompatClient::from_config(&config.model).map_err(err)?);
            let host = Arc::new(EokaHost::launch(&config.browser).await.map_err(err)?);
            let pilot = Pilot::builder(config, host.clone(), model, self.store.clone()).build();
            *guard = Some(Live { host, pilot });
        }
        Ok(())
    }

    async fn stored_state(&self) -> Result<Option<RunState>, ErrorData> {
        match self.store.get(RUN_STATE_KEY).await.map_err(err)? {
            Some(value) => serde_json::from_value(value).map(Some).map_err(err),
            None => Ok(None),
        }
    }
}

#[tool_router]
impl PilotServer {
    pub fn new(config: PilotConfig) -> anyhow::Result<Self> {
        let store = Arc::new(FileKv::open(&config.store.dir)?);
        let memory = MemoryStore::new(store.clone(), Arc::new(SystemClock), config.memory.clone());
        Ok(Self {
            config: Arc::new(config),
            store,
            memory: Arc::new(memory),
            live: Arc::new(Mutex::new(None)),
            tool_router: Self::tool_router(),
        })
    }

    #[tool(
        description = "Open a URL in a new tab and start working towards a goal. Launches the browser on first call. Replaces any run in progress. Returns the run id; poll get_status for progress."
    )]
    async fn start_task(
        &self,
        req: Parameters<StartTaskRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let mode: RunMode = match req.0.mode.as_deref() {
            Some(m) => m
                .parse()
                .map_err(|e| ErrorData::invalid_params(format!("{}", e), None::<Value>))?,
            None => RunMode::Auto,
        };
        self.ensure_live().await?;
        let guard = self.live.lock().await;
        let live = guard
            .as_ref()
            .ok_or_else(|| ErrorData::internal_error("browser not running", None::<Value>))?;
        let tab = live.host.open(&req.0.url).await.map_err(err)?;
        let run_id = live
            .pilot
            .start(tab.clone(), &req.0.goal, mode)
            .await
            .map_err(err)?;
        text_ok(format!("Started run {} in tab {}", run_id, tab))
    }

    #[tool(description = "Stop the current run immediately.")]
    async fn stop_task(&self) -> Result<CallToolResult, ErrorData> {
        let guard = self.live.lock().await;
        match guard.as_ref() {
            Some(live) => live.pilot.stop().await.map_err(err)?,
            None => {
                let Some(mut state) = self.stored_state().await?.filter(|s| s.active) else {
                    return text_ok("No active run.");
                };
                state.finish(RunPhase::Stopped, "stopped by user");
                let value = serde_json::to_value(&state).map_err(err)?;
                self.store.set(RUN_STATE_KEY, value).await.map_err(err)?;
            }
        }
        text_ok("Stopped.")
    }

    #[tool(
        description = "Current run state as JSON: phase, status message, iteration count, step history, and any step waiting for confirmation."
    )]
    async fn get_status(&self) -> Result<CallToolResult, ErrorData> {
        match self.stored_state().await? {
            Some(state) => text_ok(serde_json::to_string_pretty(&state).map_err(err)?),
            None => text_ok("No run yet. Use start_task."),
        }
    }

    #[tool(
        description = "Approve or decline the step the run is waiting on (phase waiting_for_confirm)."
    )]
    async fn confirm_step(
        &self,
        req: Parameters<ConfirmRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let guard = self.live.lock().await;
        let live = guard.as_ref().ok_or_else(|| {
            ErrorData::internal_error("No live run. Use start_task first.", None::<Value>)
        })?;
        live.pilot.confirm(req.0.approve).await.map_err(err)?;
        text_ok(if req.0.approve {
            "Approved."
        } else {
            "Declined."
        })
    }

    #[tool(description = "Summary of remembered selectors and task templates per domain.")]
    async fn memory_stats(&self) -> Result<CallToolResult, ErrorData> {
        let stats = self.memory.stats().await.map_err(err)?;
        let mut out = format!(
            "{} domain(s), {} selector(s), {} template(s)",
            stats.total_domains, stats.total_selectors, stats.total_templates
        );
        for d in &stats.domains {
            out.push_str(&format!(
                "\n  {}: {} selectors, {} templates",
                d.domain, d.selectors, d.templates
            ));
        }
        text_ok(out)
    }
}

#[tool_handler]
impl ServerHandler for PilotServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "eoka-pilot".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Goal-driven browser automation. 'start_task' opens a URL and works towards a \
                 plain-language goal on its own, planning each step with a language model. \
                 Poll 'get_status' for progress; when the phase is waiting_for_confirm, answer \
                 with 'confirm_step'. 'stop_task' ends the run. 'memory_stats' shows what has \
                 been learned per site."
                    .into(),
            ),
        }
    }
}

pub async fn run_server(config: PilotConfig) -> anyhow::Result<()> {
    use rmcp::ServiceExt;

    let server = PilotServer::new(config)?;
    let service = server.serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;
    Ok(())
}
