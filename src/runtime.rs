use crate::config::RuntimeConfig;
use anyhow::Result;
use tokio::runtime::Runtime;

/// Manually create a tokio runtime
pub fn create_runtime(config: &RuntimeConfig) -> Result<Runtime> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads.unwrap_or_else(num_cpus::get))
        .thread_name(config.thread_name.clone())
        .thread_stack_size(config.thread_stack_size)
        .enable_all()
        .build()?;
    Ok(runtime)
}
