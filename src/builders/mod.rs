//! Builders to construct pools from configuration.

use crate::config::RunnerConfig;
use crate::core::error::CommandError;
use crate::core::group::Group;
use crate::core::pool::Pool;

/// Materialize every pool named by `cfg` as a process-wide singleton.
///
/// Pools that already exist keep their original settings (first writer
/// wins, like every registry in the crate).
pub fn build_pools(cfg: &RunnerConfig) -> Result<Vec<Pool>, CommandError> {
    cfg.validate().map_err(CommandError::Setup)?;
    let mut pools = Vec::with_capacity(cfg.pools.len());
    for (name, pool_cfg) in &cfg.pools {
        pools.push(Pool::with_config(name, pool_cfg.clone())?);
    }
    Ok(pools)
}

/// Build the pools of `cfg` and register each as an executor of `group`.
pub fn install_pools(cfg: &RunnerConfig, group: &Group) -> Result<Vec<Pool>, CommandError> {
    let pools = build_pools(cfg)?;
    for pool in &pools {
        group.add_executor(pool.clone());
    }
    Ok(pools)
}
