mod params;
mod schema;

pub use params::Params;
pub use schema::{
    BrowserConfig, ExecutorSettings, LimitSettings, MemorySettings, ModelConfig, PilotConfig,
    StoreConfig, Viewport,
};
